//! Error types emitted by the attention layer.

use thiserror::Error;

/// Attention-specific error category.
#[derive(Debug, Error)]
pub enum AttentionError {
    /// Two dimensions that must agree do not.
    #[error("{context}: {left} != {right}")]
    DimMismatch {
        context: &'static str,
        left: usize,
        right: usize,
    },
    /// The supplied tensor does not have the documented rank or layout.
    #[error("invalid tensor shape for {context}")]
    InvalidShape { context: String },
    /// The layer does not support the requested data type.
    #[error("unsupported dtype {requested}")]
    UnsupportedDType { requested: String },
    /// Configuration values that cannot produce a working layer.
    #[error("invalid attention config: {message}")]
    InvalidConfig { message: String },
    /// A tensor engine failure propagated to the caller unmodified.
    #[error(transparent)]
    Backend(#[from] candle_core::Error),
}

/// Returns [`AttentionError::DimMismatch`] unless `left == right`.
pub(crate) fn expect_dim(
    context: &'static str,
    left: usize,
    right: usize,
) -> Result<(), AttentionError> {
    if left == right {
        Ok(())
    } else {
        Err(AttentionError::DimMismatch {
            context,
            left,
            right,
        })
    }
}
