//! ProbSparse self-attention.
//!
//! Only the `u = factor * ceil(ln L_Q)` queries whose score distribution is
//! furthest from uniform receive a full softmax over the keys. The rest keep
//! a cheap default context: the mean of `V` (non-causal) or its running sum
//! (causal). "Furthest from uniform" is estimated on `factor * ceil(ln L_K)`
//! randomly sampled keys per query with `M = max(s) - sum(s) / L_K`.
//!
//! Sampled key indices are shared across batch and heads. The sampler is
//! seeded so runs are reproducible. Dropout from [`Config`] is not applied.

use std::sync::{Mutex, OnceLock};

use candle_core::{Tensor, D};
use candle_nn::ops::softmax_last_dim;
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::core::{
    batched_matmul, reduction_dtype, validate_qkv, Attention, AttentionError, AttentionOutput,
    Config, QkvDims,
};
use crate::masks::normalize;

/// Default sampling factor.
pub const DEFAULT_FACTOR: usize = 5;

/// Sparse attention kernel that scores a logarithmic subset of queries.
#[derive(Debug)]
pub struct ProbSparseAttention {
    factor: usize,
    rng: Mutex<StdRng>,
    first_call: OnceLock<()>,
}

impl ProbSparseAttention {
    /// Creates the kernel; `factor` scales both sample sizes and is at least 1.
    pub fn new(factor: usize, seed: u64) -> Self {
        Self {
            factor: factor.max(1),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            first_call: OnceLock::new(),
        }
    }

    pub fn factor(&self) -> usize {
        self.factor
    }

    /// `min(factor * ceil(ln len), len)`, never below one.
    pub fn sample_size(&self, len: usize) -> usize {
        let log = (len.max(1) as f64).ln().ceil() as usize;
        (self.factor * log).clamp(1, len.max(1))
    }

    fn sample_key_indices(&self, q_len: usize, k_len: usize, per_query: usize) -> Result<Vec<u32>, AttentionError> {
        let mut rng = self
            .rng
            .lock()
            .map_err(|_| AttentionError::Backend(candle_core::Error::Msg("sampler mutex poisoned".into())))?;
        Ok((0..q_len * per_query)
            .map(|_| rng.gen_range(0..k_len as u32))
            .collect())
    }

    /// Sparsity measurement for every query, shaped `[batch, heads, q_len]`.
    fn query_sparsity(&self, q: &Tensor, k: &Tensor, dims: &QkvDims) -> Result<Tensor, AttentionError> {
        let QkvDims {
            batch,
            heads,
            q_len,
            k_len,
            head_dim,
            ..
        } = *dims;
        let per_query = self.sample_size(k_len);
        let indices = self.sample_key_indices(q_len, k_len, per_query)?;
        let indices = Tensor::from_vec(indices, q_len * per_query, q.device())?;

        let merged = batch * heads;
        let k_sample = k
            .reshape((merged, k_len, head_dim))?
            .index_select(&indices, 1)?
            .reshape((merged * q_len, per_query, head_dim))?;
        let q_rows = q.reshape((merged * q_len, 1, head_dim))?;
        let sampled = q_rows
            .matmul(&k_sample.transpose(1, 2)?)?
            .reshape((batch, heads, q_len, per_query))?;

        let peak = sampled.max(D::Minus1)?;
        let mean = sampled.sum(D::Minus1)?.affine(1.0 / k_len as f64, 0.0)?;
        Ok(peak.sub(&mean)?)
    }
}

impl Default for ProbSparseAttention {
    fn default() -> Self {
        Self::new(DEFAULT_FACTOR, 0)
    }
}

impl Attention for ProbSparseAttention {
    fn name(&self) -> &'static str {
        "prob"
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
        let QkvDims {
            batch,
            heads,
            q_len,
            k_len,
            head_dim,
            v_dim,
        } = dims;
        if config.causal && q_len != k_len {
            return Err(AttentionError::shape(format!(
                "causal ProbSparse attention needs q_len == k_len, got {q_len} and {k_len}"
            )));
        }

        let n_top = self.sample_size(q_len);
        if self.first_call.set(()).is_ok() {
            log::info!(
                "attention::prob init factor={} dtype={:?} causal={}",
                self.factor,
                q.dtype(),
                config.causal
            );
        }
        log::debug!(
            "attention::prob b={batch} h={heads} q={q_len} k={k_len} sampled_keys={} top_queries={n_top}",
            self.sample_size(k_len)
        );

        let work = reduction_dtype(q.dtype());
        let device = q.device();
        let q_work = q.to_dtype(work)?.contiguous()?;
        let k_work = k.to_dtype(work)?.contiguous()?;
        let v_work = v.to_dtype(work)?.contiguous()?;

        // Indices of the selected queries, [batch, heads, n_top].
        let sparsity = self.query_sparsity(&q_work, &k_work, &dims)?;
        let top = sparsity
            .contiguous()?
            .arg_sort_last_dim(false)?
            .narrow(2, 0, n_top)?
            .contiguous()?;
        let top_col = top.unsqueeze(3)?;

        let q_index = top_col.broadcast_as((batch, heads, n_top, head_dim))?.contiguous()?;
        let q_reduce = q_work.gather(&q_index, 2)?;
        let scale = config.scale_for(head_dim);
        let mut scores = batched_matmul(&q_reduce, &k_work.transpose(2, 3)?)?.affine(scale, 0.0)?;

        if config.causal {
            let key_pos = Tensor::arange(0u32, k_len as u32, device)?.reshape((1, 1, 1, k_len))?;
            let future = key_pos.broadcast_gt(&top_col)?;
            let blocked = Tensor::full(f32::NEG_INFINITY, scores.shape(), device)?.to_dtype(work)?;
            scores = future.where_cond(&blocked, &scores)?;
        }
        if let Some(mask) = mask {
            let mask = normalize(mask, batch, heads, q_len, k_len)?.to_dtype(work)?;
            let row_index = top_col.broadcast_as((batch, heads, n_top, k_len))?.contiguous()?;
            scores = scores.add(&mask.gather(&row_index, 2)?)?;
        }
        let attn = softmax_last_dim(&scores.contiguous()?)?;
        let update = batched_matmul(&attn, &v_work)?;

        // One-hot rows mapping selected slots back to query positions.
        let query_pos = Tensor::arange(0u32, q_len as u32, device)?.reshape((1, 1, 1, q_len))?;
        let selector = top_col.broadcast_eq(&query_pos)?.to_dtype(work)?;
        let scatter = selector.transpose(2, 3)?;
        let keep = selector.sum(2)?.affine(-1.0, 1.0)?.unsqueeze(3)?;

        let initial = if config.causal {
            v_work.cumsum(2)?
        } else {
            v_work
                .mean_keepdim(2)?
                .broadcast_as((batch, heads, q_len, v_dim))?
        };
        let context = initial
            .broadcast_mul(&keep)?
            .add(&batched_matmul(&scatter, &update)?)?
            .to_dtype(q.dtype())?;

        let weights = if return_weights {
            let uniform = Tensor::full(1.0 / k_len as f32, (batch, heads, q_len, k_len), device)?
                .to_dtype(work)?;
            Some(
                uniform
                    .broadcast_mul(&keep)?
                    .add(&batched_matmul(&scatter, &attn)?)?,
            )
        } else {
            None
        };

        Ok(AttentionOutput { context, weights })
    }
}
