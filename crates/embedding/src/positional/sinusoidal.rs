//! Fixed sinusoidal position signal.
//!
//! `PE(pos, 2i) = sin(pos / 10000^(2i / d))` and
//! `PE(pos, 2i + 1) = cos(pos / 10000^(2i / d))`. The table is computed once
//! at construction and sliced per call, so repeated calls with the same
//! length return identical tensors.

use candle_core::{bail, DType, Device, Result, Tensor};
use layers::{checks, dropout::Dropout, dtypes::PrecisionPolicy};

/// Longest sequence covered by a default table.
pub const DEFAULT_MAX_LEN: usize = 5000;

/// Builds a `(len, d_model)` sinusoid table in `f32`.
///
/// Odd widths are supported: the last column is a sine.
pub fn sinusoid_table(len: usize, d_model: usize, device: &Device) -> Result<Tensor> {
    if d_model == 0 {
        bail!("sinusoid table needs a positive width");
    }
    let log_base = -(10_000f64).ln() / d_model as f64;
    let mut data = Vec::with_capacity(len * d_model);
    for pos in 0..len {
        for col in 0..d_model {
            let pair = (col - col % 2) as f64;
            let angle = pos as f64 * (pair * log_base).exp();
            let value = if col % 2 == 0 { angle.sin() } else { angle.cos() };
            data.push(value as f32);
        }
    }
    Tensor::from_vec(data, (len, d_model), device)
}

/// Adds a sinusoidal encoding indexed by sequence position, then dropout.
#[derive(Debug)]
pub struct SinusoidalPositionalEncoding {
    d_model: usize,
    table: Tensor,
    dropout: Dropout,
}

impl SinusoidalPositionalEncoding {
    /// Precomputes `max_len` positions in the storage `dtype`.
    pub fn new(
        d_model: usize,
        max_len: usize,
        dropout_p: f32,
        seed: u64,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        if max_len == 0 {
            bail!("positional encoding needs max_len > 0");
        }
        Ok(Self {
            d_model,
            table: sinusoid_table(max_len, d_model, device)?.to_dtype(dtype)?,
            dropout: Dropout::new(dropout_p, seed)?,
        })
    }

    pub fn max_len(&self) -> usize {
        self.table.dims()[0]
    }

    pub fn set_training(&self, training: bool) {
        self.dropout.set_training(training);
    }

    /// First `seq_len` rows of the table, shaped `(seq_len, d_model)`.
    pub fn encoding(&self, seq_len: usize) -> Result<Tensor> {
        if seq_len > self.max_len() {
            bail!(
                "sequence length {seq_len} exceeds positional table of {} positions",
                self.max_len()
            );
        }
        self.table.narrow(0, 0, seq_len)
    }

    /// `dropout(x + PE[:seq])` for `x` shaped `(batch, seq, d_model)`.
    pub fn forward(&self, x: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_batch_seq_hidden("positional.input", x, self.d_model)?;
        let seq_len = x.dim(1)?;
        let pe = policy.cast_for_matmul(&self.encoding(seq_len)?.unsqueeze(0)?)?;
        let summed = policy.cast_for_matmul(x)?.broadcast_add(&pe)?;
        self.dropout
            .forward(&policy.cast_to_storage(&summed)?, policy)
    }
}
