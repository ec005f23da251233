//! Affine projection used by the attention query path.
//!
//! [`Linear`] accepts inputs shaped `(rows, in_dim)` or `(batch, seq, in_dim)`
//! and computes `input · weightᵀ + bias`. Weights are stored as
//! `(out_dim, in_dim)`. Activations and parameters are cast to
//! [`PrecisionPolicy::compute`] for the matmul and the result is cast back
//! with [`PrecisionPolicy::cast_to_storage`].
//!
//! Parameters sit behind `Arc<Mutex<_>>` so a checkpoint loader or an
//! external optimizer can swap them between forward calls.

use std::sync::{Arc, Mutex};

use candle_core::{DType, Device, Error, Result, Tensor};
use candle_nn::VarBuilder;

use crate::{checks, dtypes::PrecisionPolicy};

const PARAM_DTYPES: &[DType] = &[DType::F16, DType::BF16, DType::F32, DType::F64];

/// Static description of a dense projection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearConfig {
    /// Incoming feature dimension.
    pub input_dim: usize,
    /// Output feature dimension.
    pub output_dim: usize,
    /// Whether a learnable bias vector is applied.
    pub bias: bool,
}

impl LinearConfig {
    /// Creates a configuration for a projection with bias.
    pub fn new(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            output_dim,
            bias: true,
        }
    }

    /// Square projection, `hidden -> hidden`.
    pub fn square(hidden: usize) -> Self {
        Self::new(hidden, hidden)
    }
}

/// Weight initialisation policies.
#[derive(Debug, Clone)]
pub enum LinearInit {
    /// Uniform in `±1/sqrt(fan_in)` for both weight and bias.
    Default,
    /// Xavier/Glorot uniform weight, zero bias.
    XavierUniform,
    /// Xavier/Glorot normal weight, zero bias.
    XavierNormal,
    /// Scales the weight sampled by another policy.
    Scaled { base: Box<LinearInit>, scale: f64 },
}

impl LinearInit {
    /// Convenience helper to scale an existing policy.
    pub fn scaled(base: LinearInit, scale: f64) -> Self {
        Self::Scaled {
            base: Box::new(base),
            scale,
        }
    }

    fn sample_weight(&self, shape: (usize, usize), device: &Device) -> Result<Tensor> {
        let (out_dim, in_dim) = shape;
        let (fan_in, fan_out) = (in_dim as f64, out_dim as f64);
        match self {
            LinearInit::Default => {
                let bound = 1.0 / fan_in.sqrt();
                Tensor::rand(-bound as f32, bound as f32, shape, device)
            }
            LinearInit::XavierUniform => {
                let bound = (6.0f64 / (fan_in + fan_out)).sqrt();
                Tensor::rand(-bound as f32, bound as f32, shape, device)
            }
            LinearInit::XavierNormal => {
                let std = (2.0f64 / (fan_in + fan_out)).sqrt();
                Tensor::randn(0f32, std as f32, shape, device)
            }
            LinearInit::Scaled { base, scale } => {
                base.sample_weight(shape, device)?.affine(*scale, 0.0)
            }
        }
    }

    fn sample_bias(&self, out_dim: usize, in_dim: usize, device: &Device) -> Result<Tensor> {
        match self {
            LinearInit::Default => {
                let bound = 1.0 / (in_dim as f64).sqrt();
                Tensor::rand(-bound as f32, bound as f32, out_dim, device)
            }
            LinearInit::Scaled { base, .. } => base.sample_bias(out_dim, in_dim, device),
            _ => Tensor::zeros(out_dim, DType::F32, device),
        }
    }
}

/// Dense affine projection with optional bias.
#[derive(Debug, Clone)]
pub struct Linear {
    config: LinearConfig,
    weight: Arc<Mutex<Tensor>>,
    bias: Option<Arc<Mutex<Tensor>>>,
}

impl Linear {
    /// Constructs a linear layer from pre-existing parameters.
    pub fn new(config: LinearConfig, weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        Self::validate_weight(&config, &weight)?;
        Self::validate_bias(&config, bias.as_ref())?;
        if let Some(bias) = bias.as_ref() {
            checks::expect_same_dtype("linear.weight", &weight, "linear.bias", bias)?;
        }
        Ok(Self {
            config,
            weight: Arc::new(Mutex::new(weight)),
            bias: bias.map(|b| Arc::new(Mutex::new(b))),
        })
    }

    /// Builds a linear layer with randomly initialised parameters.
    pub fn with_init(
        config: LinearConfig,
        init: &LinearInit,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let shape = (config.output_dim, config.input_dim);
        let weight = init.sample_weight(shape, device)?.to_dtype(dtype)?;
        let bias = if config.bias {
            Some(
                init.sample_bias(config.output_dim, config.input_dim, device)?
                    .to_dtype(dtype)?,
            )
        } else {
            None
        };
        Self::new(config, weight, bias)
    }

    /// Reads `weight` (and `bias` when enabled) from a variable builder.
    pub fn load(config: LinearConfig, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get((config.output_dim, config.input_dim), "weight")?;
        let bias = if config.bias {
            Some(vb.get(config.output_dim, "bias")?)
        } else {
            None
        };
        Self::new(config, weight, bias)
    }

    /// Static configuration of the projection.
    pub fn config(&self) -> &LinearConfig {
        &self.config
    }

    /// Returns a handle to the current weight tensor.
    pub fn weight(&self) -> Result<Tensor> {
        lock_clone("linear.weight", &self.weight)
    }

    /// Returns a handle to the current bias tensor, if the layer has one.
    pub fn bias(&self) -> Result<Option<Tensor>> {
        self.bias
            .as_ref()
            .map(|bias| lock_clone("linear.bias", bias))
            .transpose()
    }

    /// Replaces the weight, casting to the stored dtype.
    pub fn set_weight(&self, value: &Tensor) -> Result<()> {
        Self::validate_weight(&self.config, value)?;
        let mut weight = self
            .weight
            .lock()
            .map_err(|_| Error::Msg("linear.weight mutex poisoned".into()))?;
        *weight = value.to_dtype(weight.dtype())?;
        Ok(())
    }

    /// Replaces the bias, casting to the stored dtype.
    pub fn set_bias(&self, value: &Tensor) -> Result<()> {
        let Some(existing) = &self.bias else {
            return Err(Error::Msg("layer has no bias to copy into".into()));
        };
        Self::validate_bias(&self.config, Some(value))?;
        let mut bias = existing
            .lock()
            .map_err(|_| Error::Msg("linear.bias mutex poisoned".into()))?;
        *bias = value.to_dtype(bias.dtype())?;
        Ok(())
    }

    /// Applies the projection, promoting to the compute dtype for the matmul.
    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        self.validate_input(hidden)?;

        let input = policy.cast_for_matmul(hidden)?;
        let weight_t = policy.cast_for_matmul(&self.weight()?)?.t()?;
        let out_dim = self.config.output_dim;

        let mut output = match *input.dims() {
            [batch, seq, in_dim] => input
                .reshape((batch * seq, in_dim))?
                .matmul(&weight_t)?
                .reshape((batch, seq, out_dim))?,
            [_, _] => input.matmul(&weight_t)?,
            _ => unreachable!("validated above"),
        };

        if let Some(bias) = self.bias()? {
            output = output.broadcast_add(&policy.cast_for_matmul(&bias)?)?;
        }

        policy.cast_to_storage(&output)
    }

    fn validate_weight(config: &LinearConfig, weight: &Tensor) -> Result<()> {
        checks::expect_rank("linear.weight", weight, 2)?;
        checks::expect_shape(
            "linear.weight",
            weight,
            &[config.output_dim, config.input_dim],
        )?;
        checks::expect_dtype_in("linear.weight", weight, PARAM_DTYPES)
    }

    fn validate_bias(config: &LinearConfig, bias: Option<&Tensor>) -> Result<()> {
        match (config.bias, bias) {
            (true, Some(tensor)) => {
                checks::expect_rank("linear.bias", tensor, 1)?;
                checks::expect_shape("linear.bias", tensor, &[config.output_dim])?;
                checks::expect_dtype_in("linear.bias", tensor, PARAM_DTYPES)
            }
            (false, Some(_)) => Err(Error::Msg("bias provided but config disables bias".into())),
            (true, None) => Err(Error::Msg("config expects bias but none supplied".into())),
            (false, None) => Ok(()),
        }
    }

    fn validate_input(&self, hidden: &Tensor) -> Result<()> {
        let in_dim = match hidden.dims() {
            [batch, seq, in_dim] => {
                if *batch == 0 || *seq == 0 {
                    return Err(Error::Msg("batch/seq dimensions must be non-zero".into()));
                }
                *in_dim
            }
            [_, in_dim] => *in_dim,
            _ => {
                return Err(Error::Msg(
                    "linear expects input shaped [B, T, H_in] or [T, H_in]".into(),
                ))
            }
        };
        if in_dim != self.config.input_dim {
            return Err(Error::Msg(format!(
                "expected last dim {} but received {}",
                self.config.input_dim, in_dim
            )));
        }
        Ok(())
    }
}

fn lock_clone(label: &str, param: &Mutex<Tensor>) -> Result<Tensor> {
    param
        .lock()
        .map(|guard| guard.clone())
        .map_err(|_| Error::Msg(format!("{label} mutex poisoned")))
}
