//! Shape-checked views over the attention inputs.
//!
//! Building a view is the only way the forward pass reads dimensions, so a
//! tensor with the wrong rank or a non-singleton trailing axis is rejected
//! before any tensor algebra runs.

use candle_core::{DType, Tensor};

use super::AttentionError;

const ACTIVATION_DTYPES: &[DType] = &[DType::F16, DType::BF16, DType::F32, DType::F64];

fn expect_float(name: &'static str, tensor: &Tensor) -> Result<(), AttentionError> {
    if ACTIVATION_DTYPES.contains(&tensor.dtype()) {
        Ok(())
    } else {
        Err(AttentionError::UnsupportedDType {
            requested: format!("{name} has dtype {:?}", tensor.dtype()),
        })
    }
}

/// Decoder-side tensor in the channel-first `[batch, hidden, length, 1]` layout.
#[derive(Debug, Clone, Copy)]
pub struct ConvSeq {
    batch: usize,
    hidden: usize,
    length: usize,
}

impl ConvSeq {
    pub fn new(name: &'static str, tensor: &Tensor) -> Result<Self, AttentionError> {
        expect_float(name, tensor)?;
        match *tensor.dims() {
            [batch, hidden, length, 1] => Ok(Self {
                batch,
                hidden,
                length,
            }),
            ref dims => Err(AttentionError::InvalidShape {
                context: format!("{name}: expected [batch, hidden, length, 1], got {dims:?}"),
            }),
        }
    }

    pub fn batch(&self) -> usize {
        self.batch
    }

    pub fn hidden(&self) -> usize {
        self.hidden
    }

    pub fn length(&self) -> usize {
        self.length
    }
}

/// Encoder output in the `[batch, hidden, src_len]` layout.
#[derive(Debug, Clone, Copy)]
pub struct EncoderSeq {
    batch: usize,
    hidden: usize,
    src_len: usize,
}

impl EncoderSeq {
    pub fn new(name: &'static str, tensor: &Tensor) -> Result<Self, AttentionError> {
        expect_float(name, tensor)?;
        match *tensor.dims() {
            [_, _, 0] => Err(AttentionError::InvalidShape {
                context: format!("{name}: src_len must be non-zero"),
            }),
            [batch, hidden, src_len] => Ok(Self {
                batch,
                hidden,
                src_len,
            }),
            ref dims => Err(AttentionError::InvalidShape {
                context: format!("{name}: expected [batch, hidden, src_len], got {dims:?}"),
            }),
        }
    }

    pub fn batch(&self) -> usize {
        self.batch
    }

    pub fn hidden(&self) -> usize {
        self.hidden
    }

    pub fn src_len(&self) -> usize {
        self.src_len
    }
}
