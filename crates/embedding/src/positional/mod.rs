//! Positional encodings.

pub mod sinusoidal;

pub use sinusoidal::{sinusoid_table, SinusoidalPositionalEncoding, DEFAULT_MAX_LEN};
