//! Multi-step attention for convolutional sequence-to-sequence decoders.
//!
//! Every decoder convolution layer calls the same kind of attention step:
//!
//! 1. `input` (the layer's output) is projected by `linear_in`, added to the
//!    target embedding and scaled by `config.scale` to form the queries.
//! 2. Queries are scored against `encoder_out_t` (keys).
//! 3. Masked scores are set to `-inf` and a softmax over source positions
//!    yields `attn`.
//! 4. `attn` weights `encoder_out_c` (values) into the context, which is
//!    returned in the decoder's channel-first layout.
//!
//! The mask can be passed per call via
//! [`ConvMultiStepAttention::forward_masked`] or stored on the layer with
//! [`ConvMultiStepAttention::apply_mask`]. Storing requires `&mut self`, so a
//! mask can never change underneath a running forward pass.

mod output;

use std::sync::OnceLock;

use candle_core::{DType, Device, Tensor, D};
use candle_nn::{ops::softmax, VarBuilder};
use layers::{seq_linear, Linear, LinearConfig, LinearInit, PrecisionPolicy};

use crate::core::errors::expect_dim;
use crate::core::{AttentionConfig, AttentionError, ConvSeq, EncoderSeq};
use crate::masks::MASK_DTYPE;

pub use output::AttentionOutput;

/// Attention step shared by the decoder convolution layers.
#[derive(Debug)]
pub struct ConvMultiStepAttention {
    config: AttentionConfig,
    linear_in: Linear,
    mask: Option<Tensor>,
    first_call: OnceLock<()>,
}

impl ConvMultiStepAttention {
    /// Wraps an existing projection. `linear_in` must be `hidden -> hidden`
    /// and agree with `config.bias`.
    ///
    /// Environment overrides are resolved here, once per layer.
    pub fn new(mut config: AttentionConfig, linear_in: Linear) -> Result<Self, AttentionError> {
        config.validate()?;
        config.apply_env_overrides();
        let expected = Self::projection_config(&config);
        if linear_in.config() != &expected {
            return Err(AttentionError::InvalidConfig {
                message: format!(
                    "linear_in must be {expected:?}, got {:?}",
                    linear_in.config()
                ),
            });
        }
        Ok(Self {
            config,
            linear_in,
            mask: None,
            first_call: OnceLock::new(),
        })
    }

    /// Builds the layer with freshly initialised parameters.
    pub fn with_init(
        config: AttentionConfig,
        init: &LinearInit,
        device: &Device,
        dtype: DType,
    ) -> Result<Self, AttentionError> {
        config.validate()?;
        let linear_in = Linear::with_init(Self::projection_config(&config), init, device, dtype)?;
        Self::new(config, linear_in)
    }

    /// Reads `linear_in.weight` and `linear_in.bias` under the builder prefix.
    pub fn load(config: AttentionConfig, vb: VarBuilder) -> Result<Self, AttentionError> {
        config.validate()?;
        let linear_in = Linear::load(Self::projection_config(&config), vb.pp("linear_in"))?;
        Self::new(config, linear_in)
    }

    fn projection_config(config: &AttentionConfig) -> LinearConfig {
        LinearConfig {
            bias: config.bias,
            ..LinearConfig::square(config.hidden_dim)
        }
    }

    pub fn config(&self) -> &AttentionConfig {
        &self.config
    }

    pub fn linear_in(&self) -> &Linear {
        &self.linear_in
    }

    /// Replaces the stored mask; `None` removes it.
    ///
    /// The mask must be `u8`, broadcastable to `[batch, length, src_len]`,
    /// with non-zero entries marking excluded positions. It stays in effect
    /// for every [`forward`](Self::forward) until replaced.
    pub fn apply_mask(&mut self, mask: Option<Tensor>) {
        match &mask {
            Some(mask) => log::debug!("conv attention mask set, shape {:?}", mask.dims()),
            None => log::debug!("conv attention mask cleared"),
        }
        self.mask = mask;
    }

    pub fn clear_mask(&mut self) {
        self.apply_mask(None);
    }

    pub fn mask(&self) -> Option<&Tensor> {
        self.mask.as_ref()
    }

    /// Runs one attention step using the stored mask.
    pub fn forward(
        &self,
        base_target_emb: &Tensor,
        input: &Tensor,
        encoder_out_t: &Tensor,
        encoder_out_c: &Tensor,
    ) -> Result<AttentionOutput, AttentionError> {
        self.forward_masked(
            base_target_emb,
            input,
            encoder_out_t,
            encoder_out_c,
            self.mask.as_ref(),
        )
    }

    /// Runs one attention step with an explicit mask, ignoring the stored one.
    ///
    /// * `base_target_emb`, `input`: `[batch, hidden, length, 1]`.
    /// * `encoder_out_t` (keys), `encoder_out_c` (values): `[batch, hidden, src_len]`.
    /// * Returns `context` shaped like `input` and `attn` shaped
    ///   `[batch, length, src_len]`.
    pub fn forward_masked(
        &self,
        base_target_emb: &Tensor,
        input: &Tensor,
        encoder_out_t: &Tensor,
        encoder_out_c: &Tensor,
        mask: Option<&Tensor>,
    ) -> Result<AttentionOutput, AttentionError> {
        let cfg = &self.config;
        if self.first_call.set(()).is_ok() {
            log::info!(
                "attention::multistep init hidden={} bias={} scale={} precision={:?}",
                cfg.hidden_dim,
                cfg.bias,
                cfg.scale,
                cfg.precision
            );
        }

        let target_emb = ConvSeq::new("base_target_emb", base_target_emb)?;
        let decoder = ConvSeq::new("input", input)?;
        let keys = EncoderSeq::new("encoder_out_t", encoder_out_t)?;
        let values = EncoderSeq::new("encoder_out_c", encoder_out_c)?;
        self.check_shapes(&target_emb, &decoder, &keys, &values)?;

        let storage = input.dtype();
        for other in [base_target_emb, encoder_out_t, encoder_out_c] {
            if other.dtype() != storage {
                return Err(AttentionError::UnsupportedDType {
                    requested: format!(
                        "attention inputs must share dtype {storage:?}, found {:?}",
                        other.dtype()
                    ),
                });
            }
        }
        if let Some(mask) = mask {
            if mask.dtype() != MASK_DTYPE {
                return Err(AttentionError::UnsupportedDType {
                    requested: format!("mask expects dtype {MASK_DTYPE:?}, got {:?}", mask.dtype()),
                });
            }
        }

        log::debug!(
            "attention::multistep forward batch={} length={} src_len={} masked={}",
            decoder.batch(),
            decoder.length(),
            keys.src_len(),
            mask.is_some()
        );

        let policy = cfg.precision.policy(storage);
        let compute = PrecisionPolicy::new(policy.compute(), policy.compute());

        // Queries: [batch, length, hidden].
        let preatt = seq_linear(&self.linear_in, &policy.cast_for_matmul(input)?, &compute)?;
        let target = policy
            .cast_for_matmul(base_target_emb)?
            .add(&preatt)?
            .affine(cfg.scale, 0.0)?
            .squeeze(3)?
            .transpose(1, 2)?
            .contiguous()?;

        let keys = policy.cast_for_matmul(encoder_out_t)?.contiguous()?;
        let mut scores = target.matmul(&keys)?;
        if let Some(mask) = mask {
            scores = fill_excluded(&scores, mask)?;
        }
        let attn = softmax(&scores, D::Minus1)?;

        let values = policy
            .cast_for_matmul(encoder_out_c)?
            .transpose(1, 2)?
            .contiguous()?;
        let context = attn.matmul(&values)?.unsqueeze(3)?.transpose(1, 2)?;

        Ok(AttentionOutput {
            context: policy.cast_to_storage(&context)?,
            attn: policy.cast_to_storage(&attn)?,
        })
    }

    fn check_shapes(
        &self,
        target_emb: &ConvSeq,
        decoder: &ConvSeq,
        keys: &EncoderSeq,
        values: &EncoderSeq,
    ) -> Result<(), AttentionError> {
        expect_dim(
            "batch of base_target_emb and input",
            target_emb.batch(),
            decoder.batch(),
        )?;
        expect_dim(
            "length of base_target_emb and input",
            target_emb.length(),
            decoder.length(),
        )?;
        expect_dim(
            "batch of encoder_out_t and encoder_out_c",
            keys.batch(),
            values.batch(),
        )?;
        expect_dim(
            "src_len of encoder_out_t and encoder_out_c",
            keys.src_len(),
            values.src_len(),
        )?;
        expect_dim("batch of input and encoder_out_t", decoder.batch(), keys.batch())?;

        let hidden = self.config.hidden_dim;
        expect_dim("hidden of base_target_emb", target_emb.hidden(), hidden)?;
        expect_dim("hidden of input", decoder.hidden(), hidden)?;
        expect_dim("hidden of encoder_out_t", keys.hidden(), hidden)?;
        expect_dim("hidden of encoder_out_c", values.hidden(), hidden)
    }
}

/// Writes `-inf` wherever `mask` is non-zero.
fn fill_excluded(scores: &Tensor, mask: &Tensor) -> Result<Tensor, AttentionError> {
    let shape = scores.shape();
    let mask = mask.broadcast_as(shape)?;
    let neg_inf = Tensor::new(f32::NEG_INFINITY, scores.device())?
        .to_dtype(scores.dtype())?
        .broadcast_as(shape)?;
    Ok(mask.where_cond(&neg_inf, scores)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{IndexOp, Result as CandleResult};

    fn layer(hidden: usize) -> ConvMultiStepAttention {
        ConvMultiStepAttention::with_init(
            AttentionConfig::new(hidden),
            &LinearInit::Default,
            &Device::Cpu,
            DType::F32,
        )
        .unwrap()
    }

    fn inputs(
        batch: usize,
        hidden: usize,
        length: usize,
        src_len: usize,
    ) -> CandleResult<(Tensor, Tensor, Tensor, Tensor)> {
        let device = Device::Cpu;
        Ok((
            Tensor::randn(0f32, 1.0, (batch, hidden, length, 1), &device)?,
            Tensor::randn(0f32, 1.0, (batch, hidden, length, 1), &device)?,
            Tensor::randn(0f32, 1.0, (batch, hidden, src_len), &device)?,
            Tensor::randn(0f32, 1.0, (batch, hidden, src_len), &device)?,
        ))
    }

    #[test]
    fn output_shapes_follow_inputs() -> CandleResult<()> {
        let (emb, input, keys, values) = inputs(2, 6, 4, 7)?;
        let out = layer(6).forward(&emb, &input, &keys, &values).unwrap();
        assert_eq!(out.context.dims(), input.dims());
        assert_eq!(out.attn.dims(), &[2, 4, 7]);
        Ok(())
    }

    #[test]
    fn batch_mismatch_is_reported_before_compute() -> CandleResult<()> {
        let device = Device::Cpu;
        let emb = Tensor::zeros((2, 4, 3, 1), DType::F32, &device)?;
        let input = Tensor::zeros((3, 4, 3, 1), DType::F32, &device)?;
        let keys = Tensor::zeros((2, 4, 5), DType::F32, &device)?;
        let err = layer(4).forward(&emb, &input, &keys, &keys).unwrap_err();
        match err {
            AttentionError::DimMismatch { left, right, .. } => assert_eq!((left, right), (2, 3)),
            other => panic!("unexpected error {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn hidden_mismatch_is_reported() -> CandleResult<()> {
        let (emb, input, keys, _) = inputs(1, 4, 2, 3)?;
        let values = Tensor::zeros((1, 5, 3), DType::F32, &Device::Cpu)?;
        let err = layer(4).forward(&emb, &input, &keys, &values).unwrap_err();
        assert!(err.to_string().contains("hidden of encoder_out_c"));
        Ok(())
    }

    #[test]
    fn stored_mask_persists_until_cleared() -> CandleResult<()> {
        let (emb, input, keys, values) = inputs(1, 4, 2, 3)?;
        let mut attention = layer(4);
        let mask = Tensor::from_vec(vec![0u8, 0, 1], (1, 1, 3), &Device::Cpu)?;
        attention.apply_mask(Some(mask));

        for _ in 0..2 {
            let out = attention.forward(&emb, &input, &keys, &values).unwrap();
            let weights = out.attn.i((0, .., 2))?.to_vec1::<f32>()?;
            assert!(weights.iter().all(|w| *w == 0.0));
        }

        attention.clear_mask();
        assert!(attention.mask().is_none());
        let out = attention.forward(&emb, &input, &keys, &values).unwrap();
        let weights = out.attn.i((0, .., 2))?.to_vec1::<f32>()?;
        assert!(weights.iter().all(|w| *w > 0.0));
        Ok(())
    }

    #[test]
    fn explicit_mask_overrides_stored_mask() -> CandleResult<()> {
        let (emb, input, keys, values) = inputs(1, 4, 2, 3)?;
        let mut attention = layer(4);
        attention.apply_mask(Some(Tensor::from_vec(vec![1u8, 0, 0], (1, 1, 3), &Device::Cpu)?));

        let unmasked = attention
            .forward_masked(&emb, &input, &keys, &values, None)
            .unwrap();
        let weights = unmasked.attn.i((0, .., 0))?.to_vec1::<f32>()?;
        assert!(weights.iter().all(|w| *w > 0.0));
        Ok(())
    }

    #[test]
    fn float_masks_are_rejected() -> CandleResult<()> {
        let (emb, input, keys, values) = inputs(1, 4, 2, 3)?;
        let mask = Tensor::zeros((1, 2, 3), DType::F32, &Device::Cpu)?;
        let err = layer(4)
            .forward_masked(&emb, &input, &keys, &values, Some(&mask))
            .unwrap_err();
        assert!(matches!(err, AttentionError::UnsupportedDType { .. }));
        Ok(())
    }

    #[test]
    fn non_broadcastable_mask_surfaces_backend_error() -> CandleResult<()> {
        let (emb, input, keys, values) = inputs(1, 4, 2, 3)?;
        let mask = Tensor::zeros((1, 2, 4), DType::U8, &Device::Cpu)?;
        let err = layer(4)
            .forward_masked(&emb, &input, &keys, &values, Some(&mask))
            .unwrap_err();
        assert!(matches!(err, AttentionError::Backend(_)));
        Ok(())
    }

    #[test]
    fn empty_source_is_rejected_before_compute() -> CandleResult<()> {
        let (emb, input, _, _) = inputs(1, 4, 2, 3)?;
        let empty = Tensor::zeros((1, 4, 0), DType::F32, &Device::Cpu)?;
        let err = layer(4).forward(&emb, &input, &empty, &empty).unwrap_err();
        assert!(matches!(err, AttentionError::InvalidShape { .. }));
        Ok(())
    }

    #[test]
    fn precision_override_is_fixed_at_construction() -> CandleResult<()> {
        // Every layer in this module is f32, where both modes compute alike.
        std::env::set_var(crate::core::PRECISION_ENV, "force_f32");
        let attention = layer(4);
        std::env::remove_var(crate::core::PRECISION_ENV);

        assert_eq!(attention.config().precision, crate::PrecisionMode::ForceF32);
        let (emb, input, keys, values) = inputs(1, 4, 2, 3)?;
        attention.forward(&emb, &input, &keys, &values).unwrap();
        assert_eq!(attention.config().precision, crate::PrecisionMode::ForceF32);
        Ok(())
    }

    #[test]
    fn projection_must_match_config() -> CandleResult<()> {
        let linear = Linear::with_init(
            LinearConfig::square(8),
            &LinearInit::Default,
            &Device::Cpu,
            DType::F32,
        )?;
        let err = ConvMultiStepAttention::new(AttentionConfig::new(4), linear).unwrap_err();
        assert!(matches!(err, AttentionError::InvalidConfig { .. }));
        Ok(())
    }

    #[test]
    fn alignment_picks_most_attended_source() -> CandleResult<()> {
        let attn = Tensor::from_vec(
            vec![0.1f32, 0.7, 0.2, 0.5, 0.3, 0.2],
            (1, 2, 3),
            &Device::Cpu,
        )?;
        let context = Tensor::zeros((1, 4, 2, 1), DType::F32, &Device::Cpu)?;
        let out = AttentionOutput { context, attn };
        assert_eq!(out.alignment().unwrap(), vec![vec![1, 0]]);
        Ok(())
    }
}
