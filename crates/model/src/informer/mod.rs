//! Informer encoder/decoder forecaster.
//!
//! The encoder stacks self-attention layers (ProbSparse unless configured
//! otherwise) and, with `distil`, halves the sequence between them with a
//! convolution and max pool. The decoder runs causal self-attention over the
//! `label_len + out_len` decoder inputs, full cross-attention over the
//! encoder memory, and the final projection keeps the last `out_len` steps.

pub mod decoder;
pub mod encoder;
mod model;

pub use decoder::{Decoder, DecoderLayer};
pub use encoder::{DistilLayer, Encoder, EncoderLayer};
pub use model::Informer;
