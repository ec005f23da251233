//! Multi-step attention for convolutional sequence-to-sequence decoders.
//!
//! Each decoder convolution layer attends over the full encoder output and
//! feeds the resulting context back into the convolution stack. Decoder-side
//! tensors use the channel-first layout `[batch, hidden, length, 1]`; the
//! encoder supplies keys and values as `[batch, hidden, src_len]`.
//!
//! Shape contracts are checked before any tensor algebra and reported as
//! [`AttentionError`] values naming the conflicting dimensions. Masks are
//! `u8` tensors where non-zero marks an excluded source position; builders
//! live in [`masks`].

pub mod core;
pub mod masks;
pub mod multistep;

pub use core::{AttentionConfig, AttentionError, ConvSeq, EncoderSeq, PrecisionMode};
pub use multistep::{AttentionOutput, ConvMultiStepAttention};
