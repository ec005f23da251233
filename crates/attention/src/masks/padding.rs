//! Builders for masks that drop padded source positions.
//!
//! Both builders return [`MASK_DTYPE`](super::MASK_DTYPE) tensors shaped
//! `[batch, length, src_len]` with `1` marking an excluded key.

use candle_core::{Device, Error, Result, Tensor};

/// Excludes, per batch element, every source position at or past its length.
pub fn source_padding_mask(
    device: &Device,
    src_lengths: &[usize],
    length: usize,
    src_len: usize,
) -> Result<Tensor> {
    let batch = src_lengths.len();
    let mut data = vec![0u8; batch * length * src_len];

    for (b, &valid) in src_lengths.iter().enumerate() {
        let valid = valid.min(src_len);
        for t in 0..length {
            let row_start = (b * length + t) * src_len;
            data[row_start + valid..row_start + src_len].fill(1);
        }
    }

    Tensor::from_vec(data, (batch, length, src_len), device)
}

/// Builds a mask from explicit per-source-position exclusion flags.
///
/// Each inner slice corresponds to a batch element; `true` excludes that
/// source position for every decoder position. All slices must share the
/// same length.
pub fn mask_from_booleans(
    device: &Device,
    excluded: &[Vec<bool>],
    length: usize,
) -> Result<Tensor> {
    let Some(first) = excluded.first() else {
        return Tensor::zeros((0, length, 0), super::MASK_DTYPE, device);
    };

    let src_len = first.len();
    if let Some(row) = excluded.iter().find(|row| row.len() != src_len) {
        return Err(Error::Msg(format!(
            "all exclusion rows must share src_len {src_len}, found {}",
            row.len()
        )));
    }

    let batch = excluded.len();
    let mut data = Vec::with_capacity(batch * length * src_len);
    for row in excluded {
        for _ in 0..length {
            data.extend(row.iter().map(|&flag| u8::from(flag)));
        }
    }

    Tensor::from_vec(data, (batch, length, src_len), device)
}
