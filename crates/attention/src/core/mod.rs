//! Core traits and types shared across attention implementations.
//!
//! Implementations operate on tensors with layout
//! `[batch, n_heads, seq_len, head_dim]`. The output tensor mirrors the query
//! layout, and reductions accumulate in at least `f32` regardless of the
//! incoming dtype (`bf16`, `f16`, `f32` or `f64`).

pub mod config;
pub mod errors;

use std::fmt;

use candle_core::{DType, Tensor};

pub use config::Config;
pub use errors::AttentionError;

/// Result of an attention call.
#[derive(Debug, Clone)]
pub struct AttentionOutput {
    /// Context vectors shaped `[batch, heads, q_len, v_dim]`.
    pub context: Tensor,
    /// Attention weights shaped `[batch, heads, q_len, k_len]` when requested.
    pub weights: Option<Tensor>,
}

/// Unified interface for attention kernels.
///
/// * `q` and `k` share the layout `[batch, n_heads, seq_len, head_dim]`; `v`
///   matches `k` on every axis but the last.
/// * The returned context mirrors the dtype of `q`.
/// * Masks, when present, are `[q_len, k_len]` or
///   `[batch|1, n_heads|1, q_len, k_len]`, either additive floats or `u8`
///   flags where non-zero entries are masked (see [`crate::masks::normalize`]).
/// * Dropout is controlled via [`Config::dropout_p`]; callers pass `None`
///   outside of training.
pub trait Attention: Send + Sync + fmt::Debug {
    /// Short kernel name used in logs.
    fn name(&self) -> &'static str;

    /// Computes attention and, when `return_weights` is set, the weight map.
    fn attend_with_weights(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
        config: &Config,
        return_weights: bool,
    ) -> Result<AttentionOutput, AttentionError>;

    /// Computes attention context only.
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
        config: &Config,
    ) -> Result<Tensor, AttentionError> {
        Ok(self.attend_with_weights(q, k, v, mask, config, false)?.context)
    }
}

/// Validated dimensions of a `q`, `k`, `v` triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QkvDims {
    pub batch: usize,
    pub heads: usize,
    pub q_len: usize,
    pub k_len: usize,
    pub head_dim: usize,
    pub v_dim: usize,
}

/// Checks devices, dtypes and shapes shared by every kernel.
pub fn validate_qkv(q: &Tensor, k: &Tensor, v: &Tensor) -> Result<QkvDims, AttentionError> {
    let device = q.device();
    if !device.same_device(k.device()) || !device.same_device(v.device()) {
        return Err(AttentionError::shape("q, k, v must reside on the same device"));
    }

    let dtype = q.dtype();
    if dtype != k.dtype() || dtype != v.dtype() {
        return Err(AttentionError::shape("q, k, v must share the same dtype"));
    }
    if !matches!(dtype, DType::F32 | DType::F16 | DType::BF16 | DType::F64) {
        return Err(AttentionError::UnsupportedDType {
            requested: format!("{dtype:?}"),
        });
    }

    let (batch, heads, q_len, head_dim) = q
        .dims4()
        .map_err(|_| AttentionError::shape("q must have shape [batch, heads, seq_len, head_dim]"))?;
    let (kb, kh, k_len, kd) = k
        .dims4()
        .map_err(|_| AttentionError::shape("k must have shape [batch, heads, seq_len, head_dim]"))?;
    let (vb, vh, vk, v_dim) = v
        .dims4()
        .map_err(|_| AttentionError::shape("v must have shape [batch, heads, seq_len, v_dim]"))?;

    if kb != batch || kh != heads || kd != head_dim {
        return Err(AttentionError::shape(format!(
            "k shape mismatch: expected [{batch}, {heads}, ?, {head_dim}] got [{kb}, {kh}, {k_len}, {kd}]"
        )));
    }
    if vb != batch || vh != heads || vk != k_len {
        return Err(AttentionError::shape(format!(
            "v shape mismatch: expected [{batch}, {heads}, {k_len}, ?] got [{vb}, {vh}, {vk}, {v_dim}]"
        )));
    }
    if q_len == 0 || k_len == 0 || head_dim == 0 {
        return Err(AttentionError::shape("attention inputs must not be empty"));
    }

    Ok(QkvDims {
        batch,
        heads,
        q_len,
        k_len,
        head_dim,
        v_dim,
    })
}

/// Dtype used for scores and softmax given the input dtype.
pub(crate) fn reduction_dtype(dtype: DType) -> DType {
    match dtype {
        DType::F64 => DType::F64,
        _ => DType::F32,
    }
}

/// Batched `lhs @ rhs` over `[batch, heads, m, k] x [batch, heads, k, n]`.
///
/// Both operands are folded to rank 3 so the matmul sees a single batch axis.
pub(crate) fn batched_matmul(lhs: &Tensor, rhs: &Tensor) -> candle_core::Result<Tensor> {
    let (b, h, m, inner) = lhs.dims4()?;
    let (_, _, _, n) = rhs.dims4()?;
    let lhs = lhs.contiguous()?.reshape((b * h, m, inner))?;
    let rhs = rhs.contiguous()?.reshape((b * h, inner, n))?;
    lhs.matmul(&rhs)?.reshape((b, h, m, n))
}
