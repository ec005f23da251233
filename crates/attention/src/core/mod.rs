//! Core types shared across the attention crate.
//!
//! Decoder-side tensors use the channel-first layout
//! `[batch, hidden, length, 1]`; encoder outputs are `[batch, hidden, src_len]`.
//! [`ConvSeq`] and [`EncoderSeq`] are validated views over those layouts.

pub mod config;
pub mod errors;
pub mod shapes;

pub use config::{AttentionConfig, PrecisionMode, PRECISION_ENV};
pub use errors::AttentionError;
pub use shapes::{ConvSeq, EncoderSeq};
