//! Mask utilities shared by attention implementations.
//!
//! Masks produced here are additive tensors with dtype `f32`, shaped
//! `[batch, num_heads, q_len, k_len]`. Values are either `0.0` (keep) or
//! `f32::NEG_INFINITY` (discard) to align with Candle's softmax-friendly
//! masking behaviour. Callers may also hand kernels boolean `u8` masks, which
//! [`normalize`] converts.

pub mod causal;

use candle_core::{DType, Tensor};

use crate::core::AttentionError;

/// Dtype shared by all additive masks.
pub const MASK_DTYPE: DType = DType::F32;

pub use causal::build_causal_mask;

/// Converts a `u8` mask (non-zero = masked) into an additive mask.
pub fn to_additive(mask: &Tensor) -> candle_core::Result<Tensor> {
    let keep = Tensor::zeros(mask.shape(), MASK_DTYPE, mask.device())?;
    let drop = Tensor::full(f32::NEG_INFINITY, mask.shape(), mask.device())?;
    mask.where_cond(&drop, &keep)
}

/// Brings a user mask to an additive `[batch, heads, q_len, k_len]` tensor.
///
/// Accepted inputs are rank 2 `[q_len, k_len]`, rank 3
/// `[batch * heads, q_len, k_len]` with the batch axis outermost, or rank 4
/// `[batch|1, heads|1, q_len, k_len]`, either `u8` flags or float additive
/// values.
pub fn normalize(
    mask: &Tensor,
    batch: usize,
    heads: usize,
    q_len: usize,
    k_len: usize,
) -> Result<Tensor, AttentionError> {
    let additive = match mask.dtype() {
        DType::U8 => to_additive(mask)?,
        DType::F16 | DType::BF16 | DType::F32 | DType::F64 => mask.to_dtype(MASK_DTYPE)?,
        other => {
            return Err(AttentionError::UnsupportedDType {
                requested: format!("mask dtype {other:?}"),
            })
        }
    };

    let shaped = match *additive.dims() {
        [mq, mk] if mq == q_len && mk == k_len => additive.reshape((1, 1, q_len, k_len))?,
        [mbh, mq, mk] if mbh == batch * heads && mq == q_len && mk == k_len => {
            additive.reshape((batch, heads, q_len, k_len))?
        }
        [mb, mh, mq, mk]
            if (mb == 1 || mb == batch)
                && (mh == 1 || mh == heads)
                && mq == q_len
                && mk == k_len =>
        {
            additive
        }
        _ => {
            return Err(AttentionError::shape(format!(
                "mask shape mismatch: expected [{q_len}, {k_len}], [{}, {q_len}, {k_len}] or [1|{batch}, 1|{heads}, {q_len}, {k_len}] got {:?}",
                batch * heads,
                mask.dims()
            )))
        }
    };
    Ok(shaped
        .broadcast_as((batch, heads, q_len, k_len))?
        .contiguous()?)
}
