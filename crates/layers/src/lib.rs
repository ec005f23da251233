//! Building blocks for convolutional sequence-to-sequence layers.
//!
//! Decoder and encoder activations are channel-first, shaped
//! `(batch, hidden, length, 1)`. This crate hosts the affine projection used
//! on those tensors, the precision policy that governs casts, and the shape
//! checks shared with the attention crate.

pub mod checks;
pub mod dtypes;
pub mod linear;
pub mod seq;

pub use dtypes::PrecisionPolicy;
pub use linear::{Linear, LinearConfig, LinearInit};
pub use seq::seq_linear;
