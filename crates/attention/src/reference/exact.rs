//! Exact scaled dot-product attention.
//!
//! Every query attends to every key: scores are scaled, masked (causal
//! triangle and/or user mask), normalised with a softmax over keys, passed
//! through dropout when configured and used to weight the values.

use std::sync::OnceLock;

use candle_core::Tensor;
use candle_nn::ops::{dropout, softmax_last_dim};

use crate::core::{
    batched_matmul, reduction_dtype, validate_qkv, Attention, AttentionError, AttentionOutput,
    Config,
};
use crate::masks::{build_causal_mask, normalize};

/// Numerically stable, portable full attention kernel.
#[derive(Debug, Default)]
pub struct ExactAttention {
    first_call: OnceLock<()>,
}

impl ExactAttention {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Attention for ExactAttention {
    fn name(&self) -> &'static str {
        "full"
    }

    fn attend_with_weights(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
        config: &Config,
        return_weights: bool,
    ) -> Result<AttentionOutput, AttentionError> {
        let dims = validate_qkv(q, k, v)?;
        if self.first_call.set(()).is_ok() {
            log::info!(
                "attention::full init dtype={:?} causal={} dropout={:?}",
                q.dtype(),
                config.causal,
                config.dropout_p
            );
        }
        if config.causal && dims.q_len != dims.k_len {
            return Err(AttentionError::shape(format!(
                "causal full attention needs q_len == k_len, got {} and {}",
                dims.q_len, dims.k_len
            )));
        }

        let work = reduction_dtype(q.dtype());
        let q_work = q.to_dtype(work)?;
        let k_work = k.to_dtype(work)?;
        let v_work = v.to_dtype(work)?;

        let scale = config.scale_for(dims.head_dim);
        let mut scores = batched_matmul(&q_work, &k_work.transpose(2, 3)?)?.affine(scale, 0.0)?;

        if config.causal {
            let causal = build_causal_mask(q.device(), 1, 1, dims.q_len, dims.k_len)?;
            scores = scores.broadcast_add(&causal.to_dtype(work)?)?;
        }
        if let Some(mask) = mask {
            let mask = normalize(mask, dims.batch, dims.heads, dims.q_len, dims.k_len)?;
            scores = scores.add(&mask.to_dtype(work)?)?;
        }

        let mut probs = softmax_last_dim(&scores.contiguous()?)?;
        if let Some(dropout_p) = config.dropout_p {
            if !(0.0..1.0).contains(&dropout_p) {
                return Err(AttentionError::shape(format!(
                    "dropout probability must be in [0, 1), got {dropout_p}"
                )));
            }
            if dropout_p > 0.0 {
                probs = dropout(&probs, dropout_p)?;
            }
        }

        let context = batched_matmul(&probs, &v_work)?.to_dtype(q.dtype())?;
        log::debug!(
            "attention::full b={} h={} q={} k={}",
            dims.batch,
            dims.heads,
            dims.q_len,
            dims.k_len
        );
        Ok(AttentionOutput {
            context,
            weights: return_weights.then_some(probs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Result as CandleResult};

    fn build_inputs(device: &Device) -> CandleResult<(Tensor, Tensor, Tensor)> {
        let data: Vec<f32> = (0..64).map(|i| (i as f32) * 0.01).collect();
        let q = Tensor::from_vec(data.clone(), (1, 2, 4, 8), device)?;
        let k = Tensor::from_vec(data.iter().rev().copied().collect::<Vec<_>>(), (1, 2, 4, 8), device)?;
        let v = Tensor::from_vec(data, (1, 2, 4, 8), device)?;
        Ok((q, k, v))
    }

    fn naive_attention(
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
    ) -> CandleResult<Tensor> {
        let (batch, heads, q_len, head_dim) = q.dims4()?;
        let (_, _, k_len, _) = k.dims4()?;
        let mut output = vec![0f32; batch * heads * q_len * head_dim];

        let q_vec = q.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let k_vec = k.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let v_vec = v.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let mask_vec = match mask {
            Some(m) => Some(m.flatten_all()?.to_vec1::<f32>()?),
            None => None,
        };
        let scale = 1.0 / (head_dim as f32).sqrt();

        for b in 0..batch {
            for h in 0..heads {
                for q_idx in 0..q_len {
                    let mut row = vec![0f32; k_len];
                    let mut max_val = f32::NEG_INFINITY;
                    for (k_idx, slot) in row.iter_mut().enumerate() {
                        let mut dot = 0f32;
                        for d in 0..head_dim {
                            let qi = ((b * heads + h) * q_len + q_idx) * head_dim + d;
                            let ki = ((b * heads + h) * k_len + k_idx) * head_dim + d;
                            dot += q_vec[qi] * k_vec[ki];
                        }
                        dot *= scale;
                        if let Some(mask_vec) = &mask_vec {
                            dot += mask_vec[((b * heads + h) * q_len + q_idx) * k_len + k_idx];
                        }
                        *slot = dot;
                        if dot > max_val {
                            max_val = dot;
                        }
                    }
                    let mut denom = 0f32;
                    for val in row.iter_mut() {
                        *val = if *val == f32::NEG_INFINITY {
                            0.0
                        } else {
                            (*val - max_val).exp()
                        };
                        denom += *val;
                    }
                    for d in 0..head_dim {
                        let mut acc = 0f32;
                        for (k_idx, weight) in row.iter().enumerate() {
                            let vi = ((b * heads + h) * k_len + k_idx) * head_dim + d;
                            acc += weight / denom * v_vec[vi];
                        }
                        output[((b * heads + h) * q_len + q_idx) * head_dim + d] = acc;
                    }
                }
            }
        }

        Tensor::from_vec(output, (batch, heads, q_len, head_dim), q.device())
    }

    fn max_diff(a: &Tensor, b: &Tensor) -> CandleResult<f32> {
        a.to_dtype(DType::F32)?
            .sub(&b.to_dtype(DType::F32)?)?
            .abs()?
            .max_all()?
            .to_vec0::<f32>()
    }

    #[test]
    fn exact_attention_matches_naive() -> CandleResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        let attention = ExactAttention::default();
        let output = attention.attend(&q, &k, &v, None, &Config::default())?;
        let expected = naive_attention(&q, &k, &v, None)?;
        assert!(max_diff(&output, &expected)? < 1e-4);
        Ok(())
    }

    #[test]
    fn causal_flag_matches_explicit_mask() -> CandleResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        let mask = build_causal_mask(&device, 1, 2, 4, 4)?;
        let attention = ExactAttention::default();
        let flagged = attention.attend(&q, &k, &v, None, &Config::causal())?;
        let explicit = attention.attend(&q, &k, &v, Some(&mask), &Config::default())?;
        let expected = naive_attention(&q, &k, &v, Some(&mask))?;
        assert!(max_diff(&flagged, &expected)? < 1e-4);
        assert!(max_diff(&explicit, &expected)? < 1e-4);
        Ok(())
    }

    #[test]
    fn weights_are_row_stochastic() -> CandleResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        let out = ExactAttention::default().attend_with_weights(
            &q,
            &k,
            &v,
            None,
            &Config::causal(),
            true,
        )?;
        let weights = out.weights.expect("weights requested");
        assert_eq!(weights.dims(), &[1, 2, 4, 4]);
        for sum in weights.sum(3)?.flatten_all()?.to_vec1::<f32>()? {
            assert!((sum - 1.0).abs() < 1e-5);
        }
        // The first query may only look at itself.
        let first = weights.narrow(2, 0, 1)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(&first[1..4], &[0.0, 0.0, 0.0]);
        Ok(())
    }

    #[test]
    fn boolean_mask_removes_key_influence() -> CandleResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        // Mask key 2 for every query.
        let flags = Tensor::from_vec(
            (0..16).map(|i| u8::from(i % 4 == 2)).collect::<Vec<_>>(),
            (4, 4),
            &device,
        )?;
        let attention = ExactAttention::default();
        let masked = attention.attend(&q, &k, &v, Some(&flags), &Config::default())?;
        let unmasked = attention.attend(&q, &k, &v, None, &Config::default())?;
        assert!(max_diff(&masked, &unmasked)? > 1e-4);

        // Changing the masked value row leaves the output untouched.
        let bump = Tensor::from_vec(
            (0..64).map(|i| if (i / 8) % 4 == 2 { 5.0f32 } else { 0.0 }).collect::<Vec<_>>(),
            (1, 2, 4, 8),
            &device,
        )?;
        let v_bumped = v.add(&bump)?;
        let masked_bumped = attention.attend(&q, &k, &v_bumped, Some(&flags), &Config::default())?;
        assert!(max_diff(&masked, &masked_bumped)? < 1e-5);
        Ok(())
    }

    #[test]
    fn mismatched_shapes_error() -> CandleResult<()> {
        let device = Device::Cpu;
        let q = Tensor::zeros((1, 2, 4, 8), DType::F32, &device)?;
        let k = Tensor::zeros((1, 2, 5, 8), DType::F32, &device)?;
        let v = Tensor::zeros((1, 2, 4, 8), DType::F32, &device)?;
        let err = ExactAttention::default()
            .attend(&q, &k, &v, None, &Config::default())
            .unwrap_err();
        assert!(matches!(err, AttentionError::InvalidShape { .. }));
        Ok(())
    }

    #[test]
    fn mask_shape_validation() -> CandleResult<()> {
        let device = Device::Cpu;
        let q = Tensor::zeros((1, 2, 4, 8), DType::F32, &device)?;
        let mask = Tensor::zeros((1, 3, 4, 4), DType::F32, &device)?;
        let err = ExactAttention::default()
            .attend(&q, &q, &q, Some(&mask), &Config::default())
            .unwrap_err();
        assert!(matches!(err, AttentionError::InvalidShape { .. }));
        Ok(())
    }

    #[test]
    fn dtype_matrix() -> CandleResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        let reference = ExactAttention::default().attend(&q, &k, &v, None, &Config::causal())?;
        for dtype in [DType::F32, DType::BF16, DType::F16] {
            let out = ExactAttention::default().attend(
                &q.to_dtype(dtype)?,
                &k.to_dtype(dtype)?,
                &v.to_dtype(dtype)?,
                None,
                &Config::causal(),
            )?;
            assert_eq!(out.dtype(), dtype);
            let max = max_diff(&out, &reference)?;
            assert!(max < 5e-2, "dtype {dtype:?} diverged by {max}");
        }
        Ok(())
    }

    #[test]
    fn numerical_stability() -> CandleResult<()> {
        let device = Device::Cpu;
        let q = Tensor::full(10_000.0f32, (1, 1, 4, 4), &device)?;
        let k = Tensor::full(-10_000.0f32, (1, 1, 4, 4), &device)?;
        let v = Tensor::ones((1, 1, 4, 4), DType::F32, &device)?;
        let out = ExactAttention::default()
            .attend(&q, &k, &v, None, &Config::default())?
            .flatten_all()?
            .to_vec1::<f32>()?;
        assert!(out.iter().all(|value| value.is_finite()));
        Ok(())
    }

    #[test]
    fn dropout_zero_probability_is_noop() -> CandleResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        let config = Config {
            dropout_p: Some(0.0),
            ..Config::causal()
        };
        let attention = ExactAttention::default();
        let out = attention.attend(&q, &k, &v, None, &config)?;
        let reference = attention.attend(&q, &k, &v, None, &Config::causal())?;
        assert!(max_diff(&out, &reference)? < 1e-6);
        Ok(())
    }
}
