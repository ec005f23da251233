use candle_core::{Tensor, D};

use crate::core::AttentionError;

/// Result of one attention step.
#[derive(Debug, Clone)]
pub struct AttentionOutput {
    /// Context vectors in the decoder layout `[batch, hidden, length, 1]`.
    pub context: Tensor,
    /// Normalised weights `[batch, length, src_len]`; each row sums to one.
    pub attn: Tensor,
}

impl AttentionOutput {
    /// Most attended source position for every `(batch, decoder position)`.
    ///
    /// Used for alignment export and for copying source tokens over unknown
    /// target tokens.
    pub fn alignment(&self) -> Result<Vec<Vec<u32>>, AttentionError> {
        Ok(self.attn.argmax(D::Minus1)?.to_vec2::<u32>()?)
    }
}
