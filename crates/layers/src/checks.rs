//! Lightweight validation helpers shared across layer components.
//!
//! Every check takes a `label` naming the tensor under inspection so the
//! resulting `candle_core::Error::Msg` points at the offending argument.
//! They return `candle_core::Result<()>` so call sites can propagate errors
//! without panicking.

use candle_core::{DType, Error, Result, Tensor};

/// Ensures a tensor matches the expected dimensions exactly.
pub fn expect_shape(label: &str, tensor: &Tensor, expected: &[usize]) -> Result<()> {
    let actual = tensor.dims();
    if actual == expected {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{label}: expected shape {:?}, got {:?}",
            expected, actual
        )))
    }
}

/// Ensures a tensor has exactly `rank` dimensions.
pub fn expect_rank(label: &str, tensor: &Tensor, rank: usize) -> Result<()> {
    let actual = tensor.rank();
    if actual == rank {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{label}: expected rank {rank}, got {actual} (shape {:?})",
            tensor.dims()
        )))
    }
}

/// Validates the channel-first `(batch, hidden, length, 1)` convention.
pub fn expect_channel_first(label: &str, tensor: &Tensor) -> Result<(usize, usize, usize)> {
    match tensor.dims() {
        [batch, hidden, length, 1] => Ok((*batch, *hidden, *length)),
        dims => Err(Error::Msg(format!(
            "{label}: expected (batch, hidden, length, 1) layout, got {:?}",
            dims
        ))),
    }
}

/// Checks the tensor dtype is one of the allowed values.
pub fn expect_dtype_in(label: &str, tensor: &Tensor, allowed: &[DType]) -> Result<()> {
    let dtype = tensor.dtype();
    if allowed.contains(&dtype) {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{label}: expected dtype in {:?}, got {:?}",
            allowed, dtype
        )))
    }
}

/// Checks two tensors share a dtype.
pub fn expect_same_dtype(
    left_label: &str,
    left: &Tensor,
    right_label: &str,
    right: &Tensor,
) -> Result<()> {
    if left.dtype() == right.dtype() {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{left_label} has dtype {:?} but {right_label} has dtype {:?}",
            left.dtype(),
            right.dtype()
        )))
    }
}
