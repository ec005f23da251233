//! Exclusion masks for the multi-step attention layer.
//!
//! Masks are `u8` tensors shaped `[batch, length, src_len]` (or anything that
//! broadcasts to it). A non-zero entry excludes that source position for that
//! decoder position; the layer writes `-inf` into the matching score before
//! the softmax, so excluded positions receive exactly zero weight.

pub mod padding;

use candle_core::{DType, Result, Tensor};

/// Dtype shared by all exclusion masks.
pub const MASK_DTYPE: DType = DType::U8;

pub use padding::{mask_from_booleans, source_padding_mask};

/// Excludes a position when either mask excludes it.
pub fn union(left: &Tensor, right: &Tensor) -> Result<Tensor> {
    left.broadcast_maximum(right)
}
