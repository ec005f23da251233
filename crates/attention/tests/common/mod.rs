#![allow(dead_code)]

use std::collections::HashMap;

use attention::{AttentionConfig, ConvMultiStepAttention};
use candle_core::{DType, Device, Result, Tensor};
use candle_nn::VarBuilder;

/// Deterministic attention inputs with known projection parameters.
pub struct Fixture {
    pub batch: usize,
    pub hidden: usize,
    pub length: usize,
    pub src_len: usize,
    pub weight: Vec<f32>,
    pub bias: Vec<f32>,
    pub base_target_emb: Tensor,
    pub input: Tensor,
    pub encoder_out_t: Tensor,
    pub encoder_out_c: Tensor,
}

fn ramp(len: usize, step: f32, offset: f32) -> Vec<f32> {
    (0..len)
        .map(|i| ((i as f32 * step + offset).sin()) * 0.5)
        .collect()
}

impl Fixture {
    pub fn new(batch: usize, hidden: usize, length: usize, src_len: usize) -> Result<Self> {
        let device = Device::Cpu;
        let dec = batch * hidden * length;
        let enc = batch * hidden * src_len;
        let decoder_shape = (batch, hidden, length, 1);
        let encoder_shape = (batch, hidden, src_len);
        Ok(Self {
            batch,
            hidden,
            length,
            src_len,
            weight: ramp(hidden * hidden, 0.37, 0.1),
            bias: ramp(hidden, 0.91, 0.3),
            base_target_emb: Tensor::from_vec(ramp(dec, 0.23, 0.0), decoder_shape, &device)?,
            input: Tensor::from_vec(ramp(dec, 0.41, 1.0), decoder_shape, &device)?,
            encoder_out_t: Tensor::from_vec(ramp(enc, 0.17, 2.0), encoder_shape, &device)?,
            encoder_out_c: Tensor::from_vec(ramp(enc, 0.29, 3.0), encoder_shape, &device)?,
        })
    }

    /// Layer loaded with the fixture's projection parameters.
    pub fn layer(
        &self,
        config: AttentionConfig,
        dtype: DType,
    ) -> anyhow::Result<ConvMultiStepAttention> {
        let device = Device::Cpu;
        let mut tensors = HashMap::new();
        tensors.insert(
            "decoder.attn.linear_in.weight".to_string(),
            Tensor::from_vec(self.weight.clone(), (self.hidden, self.hidden), &device)?,
        );
        tensors.insert(
            "decoder.attn.linear_in.bias".to_string(),
            Tensor::from_vec(self.bias.clone(), self.hidden, &device)?,
        );
        let vb = VarBuilder::from_tensors(tensors, dtype, &device);
        Ok(ConvMultiStepAttention::load(config, vb.pp("decoder").pp("attn"))?)
    }

    /// Straight-line evaluation of the attention step, returning
    /// `(context [b][h][t], attn [b][t][s])`.
    pub fn reference(&self, excluded: Option<&[Vec<Vec<bool>>]>) -> Result<(Vec<f32>, Vec<f32>)> {
        let (bs, h, l, s) = (self.batch, self.hidden, self.length, self.src_len);
        let emb = self.base_target_emb.flatten_all()?.to_vec1::<f32>()?;
        let input = self.input.flatten_all()?.to_vec1::<f32>()?;
        let keys = self.encoder_out_t.flatten_all()?.to_vec1::<f32>()?;
        let values = self.encoder_out_c.flatten_all()?.to_vec1::<f32>()?;
        let scale = 0.5f32.sqrt();

        let mut context = vec![0f32; bs * h * l];
        let mut attn = vec![0f32; bs * l * s];
        for b in 0..bs {
            for t in 0..l {
                let query: Vec<f32> = (0..h)
                    .map(|i| {
                        let projected = self.bias[i]
                            + (0..h)
                                .map(|j| self.weight[i * h + j] * input[(b * h + j) * l + t])
                                .sum::<f32>();
                        (emb[(b * h + i) * l + t] + projected) * scale
                    })
                    .collect();

                let scores: Vec<f32> = (0..s)
                    .map(|k| {
                        let masked = excluded.map(|m| m[b][t][k]).unwrap_or(false);
                        if masked {
                            f32::NEG_INFINITY
                        } else {
                            (0..h).map(|i| query[i] * keys[(b * h + i) * s + k]).sum()
                        }
                    })
                    .collect();
                let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let exps: Vec<f32> = scores.iter().map(|v| (v - max).exp()).collect();
                let denom: f32 = exps.iter().sum();
                for k in 0..s {
                    attn[(b * l + t) * s + k] = exps[k] / denom;
                }

                for i in 0..h {
                    context[(b * h + i) * l + t] = (0..s)
                        .map(|k| attn[(b * l + t) * s + k] * values[(b * h + i) * s + k])
                        .sum();
                }
            }
        }
        Ok((context, attn))
    }
}

pub fn max_abs_diff(actual: &Tensor, expected: &[f32]) -> Result<f32> {
    let actual = actual.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    assert_eq!(actual.len(), expected.len());
    Ok(actual
        .iter()
        .zip(expected)
        .map(|(a, e)| (a - e).abs())
        .fold(0f32, f32::max))
}
