//! Attention primitives for the forecasting models.
//!
//! Kernels implement the [`Attention`] trait over tensors with layout
//! `[batch, n_heads, seq_len, head_dim]`. Two kernels are provided: exact
//! full attention and ProbSparse attention, which only computes full score
//! rows for a logarithmic number of queries. Reductions run in `f32` (or
//! `f64`) and the output matches the query dtype.
//!
//! Dropout is an optional, train-only concern controlled via [`Config`].
//! Causal masking is a per-call flag; additional masks (additive or boolean)
//! are normalised by [`masks::normalize`].
//!
//! [`MultiHeadAttention`] wraps a kernel with query/key/value/output
//! projections and handles head splitting for `(batch, seq, d_model)` or
//! `(seq, batch, d_model)` inputs.

pub mod core;
pub mod masks;
pub mod multi_head;
pub mod reference;

pub use core::{Attention, AttentionError, AttentionOutput, Config};
pub use multi_head::{MultiHeadAttention, MultiHeadAttentionConfig};
pub use reference::{ExactAttention, ProbSparseAttention};
