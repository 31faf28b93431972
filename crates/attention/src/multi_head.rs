//! Multi-head attention layer.
//!
//! Queries, keys and values are projected separately, split into heads,
//! handed to an [`Attention`] kernel and merged back through an output
//! projection. Inputs are `(batch, seq, d_model)` unless `seq_first` is set,
//! in which case they are `(seq, batch, d_model)` and the output follows the
//! same layout.

use std::{
    fmt,
    sync::atomic::{AtomicBool, Ordering},
};

use candle_core::{bail, DType, Device, Error, Result, Tensor};
use layers::{
    checks,
    dtypes::PrecisionPolicy,
    linear::{Linear, LinearConfig, LinearInit, LinearLayer},
};

use crate::core::{Attention, Config};

/// Shape and behaviour of a [`MultiHeadAttention`] layer.
#[derive(Debug, Clone, PartialEq)]
pub struct MultiHeadAttentionConfig {
    pub d_model: usize,
    pub n_heads: usize,
    /// Per-head query/key width; `d_model / n_heads` when unset.
    pub d_keys: Option<usize>,
    /// Per-head value width; `d_model / n_heads` when unset.
    pub d_values: Option<usize>,
    /// Dropout on attention weights, training mode only.
    pub dropout_p: f32,
    pub causal: bool,
    /// Merge heads by reinterpreting `(batch, heads, seq, d)` as
    /// `(batch, seq, heads * d)` without transposing back first.
    pub mix: bool,
    pub seq_first: bool,
    /// Initialisation of the four projections.
    pub init: LinearInit,
}

impl MultiHeadAttentionConfig {
    pub fn new(d_model: usize, n_heads: usize) -> Self {
        Self {
            d_model,
            n_heads,
            d_keys: None,
            d_values: None,
            dropout_p: 0.0,
            causal: false,
            mix: false,
            seq_first: false,
            init: LinearInit::FanInUniform,
        }
    }

    /// Checks head arithmetic and the dropout range.
    pub fn validate(&self) -> Result<()> {
        if self.d_model == 0 || self.n_heads == 0 {
            bail!(
                "d_model ({}) and n_heads ({}) must be positive",
                self.d_model,
                self.n_heads
            );
        }
        if (self.d_keys.is_none() || self.d_values.is_none()) && self.d_model % self.n_heads != 0 {
            bail!(
                "d_model ({}) must be divisible by n_heads ({})",
                self.d_model,
                self.n_heads
            );
        }
        if matches!(self.d_keys, Some(0)) || matches!(self.d_values, Some(0)) {
            bail!("per-head widths must be positive");
        }
        if !(0.0..1.0).contains(&self.dropout_p) {
            bail!("attention dropout must be in [0, 1), got {}", self.dropout_p);
        }
        Ok(())
    }

    pub fn key_dim(&self) -> usize {
        self.d_keys.unwrap_or(self.d_model / self.n_heads.max(1))
    }

    pub fn value_dim(&self) -> usize {
        self.d_values.unwrap_or(self.d_model / self.n_heads.max(1))
    }
}

/// Projected multi-head attention around a pluggable kernel.
pub struct MultiHeadAttention {
    config: MultiHeadAttentionConfig,
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    kernel: Box<dyn Attention>,
    training: AtomicBool,
}

impl fmt::Debug for MultiHeadAttention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiHeadAttention")
            .field("kernel", &self.kernel.name())
            .field("d_model", &self.config.d_model)
            .field("n_heads", &self.config.n_heads)
            .field("mix", &self.config.mix)
            .field("causal", &self.config.causal)
            .finish()
    }
}

impl MultiHeadAttention {
    /// Builds the projections and takes ownership of `kernel`.
    pub fn new(
        config: MultiHeadAttentionConfig,
        kernel: Box<dyn Attention>,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        config.validate()?;
        let heads = config.n_heads;
        let key_width = config.key_dim() * heads;
        let value_width = config.value_dim() * heads;
        let proj = |input: usize, output: usize| {
            Linear::with_init(LinearConfig::new(input, output), &config.init, device, dtype)
        };
        Ok(Self {
            q_proj: proj(config.d_model, key_width)?,
            k_proj: proj(config.d_model, key_width)?,
            v_proj: proj(config.d_model, value_width)?,
            out_proj: proj(value_width, config.d_model)?,
            kernel,
            config,
            training: AtomicBool::new(true),
        })
    }

    pub fn config(&self) -> &MultiHeadAttentionConfig {
        &self.config
    }

    pub fn kernel_name(&self) -> &'static str {
        self.kernel.name()
    }

    pub fn set_training(&self, training: bool) {
        self.training.store(training, Ordering::Relaxed);
    }

    pub fn num_parameters(&self) -> usize {
        [&self.q_proj, &self.k_proj, &self.v_proj, &self.out_proj]
            .iter()
            .map(|proj| proj.num_parameters())
            .sum()
    }

    /// Attention output in the input layout.
    pub fn forward(
        &self,
        queries: &Tensor,
        keys: &Tensor,
        values: &Tensor,
        mask: Option<&Tensor>,
        policy: &PrecisionPolicy,
    ) -> Result<Tensor> {
        Ok(self
            .forward_with_weights(queries, keys, values, mask, policy, false)?
            .0)
    }

    /// Attention output plus, when requested, the `(batch, heads, q, k)` weights.
    pub fn forward_with_weights(
        &self,
        queries: &Tensor,
        keys: &Tensor,
        values: &Tensor,
        mask: Option<&Tensor>,
        policy: &PrecisionPolicy,
        return_weights: bool,
    ) -> Result<(Tensor, Option<Tensor>)> {
        let (queries, keys, values) = if self.config.seq_first {
            (
                queries.transpose(0, 1)?,
                keys.transpose(0, 1)?,
                values.transpose(0, 1)?,
            )
        } else {
            (queries.clone(), keys.clone(), values.clone())
        };
        let d_model = self.config.d_model;
        checks::expect_batch_seq_hidden("attention.queries", &queries, d_model)?;
        checks::expect_batch_seq_hidden("attention.keys", &keys, d_model)?;
        checks::expect_batch_seq_hidden("attention.values", &values, d_model)?;
        let (batch, q_len, _) = queries.dims3()?;
        let (k_batch, k_len, _) = keys.dims3()?;
        if k_batch != batch || values.dims()[..2] != keys.dims()[..2] {
            bail!(
                "attention inputs disagree: queries {:?}, keys {:?}, values {:?}",
                queries.dims(),
                keys.dims(),
                values.dims()
            );
        }

        let heads = self.config.n_heads;
        let q = self.split_heads(&self.q_proj.forward(&queries, policy)?, self.config.key_dim())?;
        let k = self.split_heads(&self.k_proj.forward(&keys, policy)?, self.config.key_dim())?;
        let v = self.split_heads(&self.v_proj.forward(&values, policy)?, self.config.value_dim())?;

        let dropout_p = self.config.dropout_p;
        let kernel_config = Config {
            dropout_p: (self.training.load(Ordering::Relaxed) && dropout_p > 0.0).then_some(dropout_p),
            causal: self.config.causal,
            scale: None,
        };
        log::debug!(
            "multi_head kernel={} b={batch} q={q_len} k={k_len} heads={heads} mix={}",
            self.kernel.name(),
            self.config.mix
        );
        let output = self
            .kernel
            .attend_with_weights(&q, &k, &v, mask, &kernel_config, return_weights)
            .map_err(Error::from)?;

        let merged = self.merge_heads(&output.context, batch, q_len)?;
        let projected = self.out_proj.forward(&merged, policy)?;
        let projected = if self.config.seq_first {
            projected.transpose(0, 1)?.contiguous()?
        } else {
            projected
        };
        Ok((projected, output.weights))
    }

    fn split_heads(&self, tensor: &Tensor, head_dim: usize) -> Result<Tensor> {
        let (batch, seq, _) = tensor.dims3()?;
        tensor
            .reshape((batch, seq, self.config.n_heads, head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    fn merge_heads(&self, context: &Tensor, batch: usize, seq: usize) -> Result<Tensor> {
        let width = self.config.n_heads * self.config.value_dim();
        if self.config.mix {
            context.contiguous()?.reshape((batch, seq, width))
        } else {
            context.transpose(1, 2)?.contiguous()?.reshape((batch, seq, width))
        }
    }
}
