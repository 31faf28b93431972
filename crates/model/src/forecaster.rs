//! Multi-head attention forecaster.
//!
//! `(batch, seq, series)` windows are projected to `d_model`, given a
//! sinusoidal position signal, passed through one sequence-first self
//! attention layer and projected down to `output_dim` values per step. When a
//! forecast length is configured, a learned `seq_len -> output_seq_len` map
//! over the time axis produces the horizon, optionally squashed by a bounded
//! activation.

use attention::{ExactAttention, MultiHeadAttention, MultiHeadAttentionConfig};
use candle_core::{bail, DType, Device, Result, Tensor};
use embedding::{SinusoidalPositionalEncoding, DEFAULT_MAX_LEN};
use layers::{
    activations::{Activation, ActivationKind},
    checks,
    dtypes::PrecisionPolicy,
    linear::{Linear, LinearConfig, LinearInit, LinearLayer},
};

use crate::config::ForecasterConfig;

/// Simple multi-head attention forecasting model.
#[derive(Debug)]
pub struct AttentionForecaster {
    config: ForecasterConfig,
    policy: PrecisionPolicy,
    input_proj: Linear,
    positional: SinusoidalPositionalEncoding,
    attention: MultiHeadAttention,
    output_proj: Linear,
    horizon: Option<Horizon>,
}

/// Time-axis remap plus its optional activation.
#[derive(Debug)]
struct Horizon {
    remap: Linear,
    activation: Option<ActivationKind>,
}

impl AttentionForecaster {
    /// Builds every layer; parameters are stored in `dtype`.
    pub fn new(config: ForecasterConfig, device: &Device, dtype: DType) -> Result<Self> {
        config.validate()?;
        let policy = PrecisionPolicy::from_parameter_dtype(dtype);
        let init = LinearInit::FanInUniform;

        let input_proj = Linear::with_init(
            LinearConfig::new(config.n_time_series, config.d_model),
            &init,
            device,
            dtype,
        )?;
        let positional = SinusoidalPositionalEncoding::new(
            config.d_model,
            DEFAULT_MAX_LEN,
            config.dropout,
            config.seed,
            device,
            dtype,
        )?;
        let attention_config = MultiHeadAttentionConfig {
            dropout_p: config.dropout,
            seq_first: true,
            init: LinearInit::XavierUniform,
            ..MultiHeadAttentionConfig::new(config.d_model, config.n_heads)
        };
        let attention = MultiHeadAttention::new(
            attention_config,
            Box::new(ExactAttention::new()),
            device,
            dtype,
        )?;
        let output_proj = Linear::with_init(
            LinearConfig::new(config.d_model, config.output_dim),
            &init,
            device,
            dtype,
        )?;

        let horizon = match config.output_seq_len {
            Some(len) => Some(Horizon {
                remap: Linear::with_init(LinearConfig::new(config.seq_len, len), &init, device, dtype)?,
                activation: config.final_activation,
            }),
            None => {
                if let Some(kind) = config.final_activation {
                    log::warn!(
                        "final activation `{kind}` is ignored without an output_seq_len"
                    );
                }
                None
            }
        };

        let model = Self {
            config,
            policy,
            input_proj,
            positional,
            attention,
            output_proj,
            horizon,
        };
        log::info!(
            "attention forecaster: series={} seq_len={} horizon={:?} d_model={} heads={} output_dim={} params={}",
            model.config.n_time_series,
            model.config.seq_len,
            model.config.output_seq_len,
            model.config.d_model,
            model.config.n_heads,
            model.config.output_dim,
            model.num_parameters()
        );
        Ok(model)
    }

    pub fn config(&self) -> &ForecasterConfig {
        &self.config
    }

    /// Toggles dropout in the positional encoding and the attention layer.
    pub fn set_training(&self, training: bool) {
        self.positional.set_training(training);
        self.attention.set_training(training);
    }

    pub fn num_parameters(&self) -> usize {
        let horizon = self
            .horizon
            .as_ref()
            .map_or(0, |horizon| horizon.remap.num_parameters());
        self.input_proj.num_parameters()
            + self.attention.num_parameters()
            + self.output_proj.num_parameters()
            + horizon
    }

    /// Forecasts from `x (batch, seq, series)`.
    ///
    /// Returns `(batch, horizon)` for a single output per step, or
    /// `(batch, horizon, output_dim)` otherwise, where `horizon` is
    /// `output_seq_len` when set and the input length when not. `mask` is
    /// forwarded to the attention kernel unchanged.
    ///
    /// With a remap the input must have exactly `seq_len` steps. Without one,
    /// any length up to [`DEFAULT_MAX_LEN`] is accepted and `seq_len` is not
    /// consulted.
    pub fn forward(&self, x: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        checks::expect_rank("forecaster.input", x, 3)?;
        checks::expect_last_dim("forecaster.input", x, self.config.n_time_series)?;
        let (batch, seq_len, _) = x.dims3()?;
        if self.horizon.is_some() && seq_len != self.config.seq_len {
            bail!(
                "forecaster expects {} input steps to remap, got {seq_len}",
                self.config.seq_len
            );
        }
        log::debug!("forecaster forward batch={batch} seq={seq_len} mask={}", mask.is_some());

        let policy = &self.policy;
        let hidden = self.input_proj.forward(x, policy)?;
        let hidden = self.positional.forward(&hidden, policy)?;
        let hidden = hidden.transpose(0, 1)?.contiguous()?;
        let attended = self.attention.forward(&hidden, &hidden, &hidden, mask, policy)?;
        // (seq, batch, output_dim)
        let projected = self.output_proj.forward(&attended, policy)?;

        let output_dim = self.config.output_dim;
        match &self.horizon {
            Some(horizon) => {
                let steps = projected.permute((1, 2, 0))?.contiguous()?;
                let mut out = horizon.remap.forward(&steps, policy)?;
                if let Some(activation) = horizon.activation {
                    out = activation.forward(&out, policy)?;
                }
                if output_dim > 1 {
                    out.transpose(1, 2)?.contiguous()
                } else {
                    out.squeeze(1)
                }
            }
            None => {
                let out = projected.transpose(0, 1)?.contiguous()?;
                if output_dim > 1 {
                    Ok(out)
                } else {
                    out.squeeze(2)
                }
            }
        }
    }
}
