//! Embedding crate
//!
//! Turns raw multivariate series and their calendar covariates into
//! `(batch, seq, d_model)` representations: a circular convolution over the
//! values, a fixed sinusoidal positional signal and a per-field calendar
//! embedding. [`DataEmbedding`] sums the three.

pub mod data;
pub mod positional;
pub mod temporal;
pub mod value;

pub use data::{DataEmbedding, DataEmbeddingConfig};
pub use positional::*;
pub use temporal::{TemporalEmbedding, TemporalEmbeddingKind, TemporalFeature};
pub use value::ValueEmbedding;
