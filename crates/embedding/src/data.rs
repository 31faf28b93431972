//! Combined value, positional and calendar embedding.

use candle_core::{bail, DType, Device, Result, Tensor};
use layers::{dropout::Dropout, dtypes::PrecisionPolicy};

use crate::{
    positional::{sinusoid_table, DEFAULT_MAX_LEN},
    temporal::{TemporalEmbedding, TemporalEmbeddingKind},
    value::ValueEmbedding,
};

/// Parameters for a [`DataEmbedding`].
#[derive(Debug, Clone, PartialEq)]
pub struct DataEmbeddingConfig {
    /// Number of input series.
    pub c_in: usize,
    pub d_model: usize,
    pub temporal_kind: TemporalEmbeddingKind,
    /// Calendar fields consumed from the covariate tensor.
    pub temp_depth: usize,
    pub dropout_p: f32,
    /// Positions covered by the sinusoid table.
    pub max_len: usize,
}

impl DataEmbeddingConfig {
    pub fn new(c_in: usize, d_model: usize) -> Self {
        Self {
            c_in,
            d_model,
            temporal_kind: TemporalEmbeddingKind::Fixed,
            temp_depth: 4,
            dropout_p: 0.0,
            max_len: DEFAULT_MAX_LEN,
        }
    }
}

/// `dropout(value(x) + PE[:seq] + temporal(x_mark))`.
#[derive(Debug)]
pub struct DataEmbedding {
    config: DataEmbeddingConfig,
    value: ValueEmbedding,
    positions: Tensor,
    temporal: TemporalEmbedding,
    dropout: Dropout,
}

impl DataEmbedding {
    pub fn new(config: DataEmbeddingConfig, seed: u64, device: &Device, dtype: DType) -> Result<Self> {
        let value = ValueEmbedding::new(config.c_in, config.d_model, device, dtype)?;
        let positions = sinusoid_table(config.max_len, config.d_model, device)?.to_dtype(dtype)?;
        let temporal = TemporalEmbedding::new(
            config.d_model,
            config.temp_depth,
            config.temporal_kind,
            device,
            dtype,
        )?;
        Ok(Self {
            dropout: Dropout::new(config.dropout_p, seed)?,
            config,
            value,
            positions,
            temporal,
        })
    }

    pub fn config(&self) -> &DataEmbeddingConfig {
        &self.config
    }

    pub fn set_training(&self, training: bool) {
        self.dropout.set_training(training);
    }

    pub fn num_parameters(&self) -> usize {
        self.value.num_parameters() + self.temporal.num_parameters()
    }

    /// Embeds `x (batch, seq, c_in)` with covariates `x_mark (batch, seq, fields)`.
    pub fn forward(&self, x: &Tensor, x_mark: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let (batch, seq, _) = x.dims3()?;
        match x_mark.dims() {
            [b, s, _] if *b == batch && *s == seq => {}
            dims => bail!(
                "calendar covariates {dims:?} do not line up with series of shape {:?}",
                x.dims()
            ),
        }
        if seq > self.config.max_len {
            bail!(
                "sequence length {seq} exceeds positional table of {} positions",
                self.config.max_len
            );
        }

        let values = policy.cast_for_matmul(&self.value.forward(x, policy)?)?;
        let positions = policy.cast_for_matmul(&self.positions.narrow(0, 0, seq)?.unsqueeze(0)?)?;
        let calendar = policy.cast_for_matmul(&self.temporal.forward(x_mark, policy)?)?;
        let summed = values.broadcast_add(&positions)?.add(&calendar)?;
        log::debug!(
            "data embedding batch={batch} seq={seq} c_in={} d_model={}",
            x.dim(2)?,
            summed.dim(2)?
        );
        self.dropout.forward(&policy.cast_to_storage(&summed)?, policy)
    }
}
