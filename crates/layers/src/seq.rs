//! Position-wise projections over channel-first convolution tensors.
//!
//! The convolution stack keeps activations as `(batch, hidden, length, 1)`.
//! [`seq_linear`] lays those out as a flat `(batch * length, hidden)` batch
//! of vectors, runs a [`Linear`] over it and restores the original layout.
//! No values move between positions.

use candle_core::{Error, Result, Tensor};

use crate::{checks, dtypes::PrecisionPolicy, linear::Linear};

/// Applies `linear` independently to every `(batch, position)` hidden vector.
///
/// `x` must be shaped `(batch, hidden, length, 1)` with `hidden` equal to the
/// projection's input width. The result is `(batch, out_dim, length, 1)`.
pub fn seq_linear(linear: &Linear, x: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
    let (batch, hidden, length) = checks::expect_channel_first("seq_linear.input", x)?;
    let config = linear.config();
    if hidden != config.input_dim {
        return Err(Error::Msg(format!(
            "seq_linear.input: hidden size {hidden} does not match projection input {}",
            config.input_dim
        )));
    }

    let flat = x
        .transpose(1, 2)?
        .contiguous()?
        .reshape((batch * length, hidden))?;
    let projected = linear.forward(&flat, policy)?;
    projected
        .reshape((batch, length, config.output_dim, 1))?
        .transpose(1, 2)
}
