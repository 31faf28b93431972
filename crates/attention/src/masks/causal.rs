//! Builders for causal attention masks.
//!
//! The resulting tensors have dtype [`MASK_DTYPE`](super::MASK_DTYPE) and shape
//! `[batch, num_heads, q_len, k_len]`. Entries are `0.0` where attention is
//! permitted and `f32::NEG_INFINITY` otherwise.

use candle_core::{Device, Result, Tensor};

/// Construct a causal mask for the supplied sequence dimensions.
///
/// When `k_len > q_len`, queries are assumed to align with the most recent
/// `q_len` keys, allowing access to the extended prefix. With equal lengths
/// this is the strict upper triangle of a square matrix.
pub fn build_causal_mask(
    device: &Device,
    batch: usize,
    num_heads: usize,
    q_len: usize,
    k_len: usize,
) -> Result<Tensor> {
    let offset = k_len.saturating_sub(q_len);
    let template: Vec<f32> = (0..q_len)
        .flat_map(|q| {
            (0..k_len).map(move |k| if k > q + offset { f32::NEG_INFINITY } else { 0.0 })
        })
        .collect();
    Tensor::from_vec(template, (1, 1, q_len, k_len), device)?
        .broadcast_as((batch, num_heads, q_len, k_len))?
        .contiguous()
}
