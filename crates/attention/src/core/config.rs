//! Configuration for the multi-step attention layer.
//!
//! [`AttentionConfig`] deserialises from the model section of a JSON or TOML
//! file; every field except `hidden_dim` has a default. The precision mode
//! can also be overridden at run time through [`PRECISION_ENV`].

use std::str::FromStr;

use candle_core::DType;
use layers::PrecisionPolicy;
use serde::{Deserialize, Serialize};

use super::AttentionError;

/// Environment variable read by [`AttentionConfig::apply_env_overrides`].
pub const PRECISION_ENV: &str = "CONVS2S_ATTENTION_PRECISION";

/// How activations are cast around the matmuls and the softmax.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrecisionMode {
    /// Compute in the dtype of the incoming activations.
    #[default]
    Inherit,
    /// Promote to `f32` for compute and cast outputs back.
    ForceF32,
}

impl PrecisionMode {
    /// Precision policy for activations stored as `storage`.
    pub fn policy(self, storage: DType) -> PrecisionPolicy {
        match self {
            PrecisionMode::Inherit => PrecisionPolicy::new(storage, storage),
            PrecisionMode::ForceF32 => PrecisionPolicy::force_f32(storage),
        }
    }
}

impl FromStr for PrecisionMode {
    type Err = AttentionError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "inherit" => Ok(PrecisionMode::Inherit),
            "f32" | "force_f32" => Ok(PrecisionMode::ForceF32),
            other => Err(AttentionError::InvalidConfig {
                message: format!("unknown precision mode '{other}'"),
            }),
        }
    }
}

/// Configuration driving [`ConvMultiStepAttention`](crate::ConvMultiStepAttention).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttentionConfig {
    /// Hidden size shared by the decoder, the encoder outputs and `linear_in`.
    pub hidden_dim: usize,
    /// Whether `linear_in` carries a bias.
    #[serde(default = "default_bias")]
    pub bias: bool,
    /// Factor applied to `base_target_emb + linear_in(input)`.
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub precision: PrecisionMode,
}

fn default_bias() -> bool {
    true
}

fn default_scale() -> f64 {
    std::f64::consts::FRAC_1_SQRT_2
}

impl AttentionConfig {
    /// Default configuration for the given hidden size.
    pub fn new(hidden_dim: usize) -> Self {
        Self {
            hidden_dim,
            bias: default_bias(),
            scale: default_scale(),
            precision: PrecisionMode::default(),
        }
    }

    pub fn validate(&self) -> Result<(), AttentionError> {
        if self.hidden_dim == 0 {
            return Err(AttentionError::InvalidConfig {
                message: "hidden_dim must be greater than zero".into(),
            });
        }
        if !self.scale.is_finite() || self.scale <= 0.0 {
            return Err(AttentionError::InvalidConfig {
                message: format!("scale must be finite and positive, got {}", self.scale),
            });
        }
        Ok(())
    }

    /// Applies [`PRECISION_ENV`] when set. Unparseable values are ignored
    /// with a warning.
    pub fn apply_env_overrides(&mut self) {
        let value = std::env::var(PRECISION_ENV).ok();
        self.apply_precision_override(value.as_deref());
    }

    fn apply_precision_override(&mut self, value: Option<&str>) {
        let Some(value) = value else {
            return;
        };
        match value.parse::<PrecisionMode>() {
            Ok(mode) => self.precision = mode,
            Err(err) => log::warn!("ignoring {PRECISION_ENV}: {err}"),
        }
    }
}
