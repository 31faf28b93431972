//! Normalisation layers bundled with unified shape and dtype handling.
//!
//! [`LayerNorm`] normalises the trailing axis of any tensor. [`BatchNorm1d`]
//! normalises each channel of a `(batch, channels, time)` tensor over the
//! batch and time axes and tracks running statistics for inference. Both
//! promote statistics to [`PrecisionPolicy::cast_for_reduction`] before
//! casting the output back.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Mutex,
};

use candle_core::{DType, Device, Error, Result, Tensor, D};

use crate::{checks, dtypes::PrecisionPolicy};

/// Configuration shared by all normalisation layers.
#[derive(Debug, Clone, PartialEq)]
pub struct NormConfig {
    /// Size of the axis being normalised (hidden size or channel count).
    pub hidden_size: usize,
    /// Numeric stabiliser added to the variance.
    pub epsilon: f64,
}

impl NormConfig {
    pub fn new(hidden_size: usize) -> Self {
        Self {
            hidden_size,
            epsilon: 1e-5,
        }
    }
}

/// Shared interface for normalisation layers.
pub trait NormalizationLayer: Send + Sync {
    /// Returns the configuration so callers can check shape compatibility.
    fn config(&self) -> &NormConfig;

    /// Applies the normalisation.
    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor>;
}

fn check_affine(name: &str, tensor: &Tensor, size: usize) -> Result<()> {
    checks::expect_shape(name, tensor, &[size])?;
    checks::expect_dtype_in(name, tensor, checks::FLOAT_DTYPES)
}

/// LayerNorm with learnable scale and bias over the last axis.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    config: NormConfig,
    weight: Tensor,
    bias: Tensor,
}

impl LayerNorm {
    /// Constructs a LayerNorm from explicit affine parameters.
    pub fn new(weight: Tensor, bias: Tensor, config: NormConfig) -> Result<Self> {
        check_affine("norm.weight", &weight, config.hidden_size)?;
        check_affine("norm.bias", &bias, config.hidden_size)?;
        Ok(Self {
            config,
            weight,
            bias,
        })
    }

    /// Unit scale and zero bias, the usual starting point.
    pub fn identity(hidden_size: usize, device: &Device, dtype: DType) -> Result<Self> {
        Self::new(
            Tensor::ones(hidden_size, dtype, device)?,
            Tensor::zeros(hidden_size, dtype, device)?,
            NormConfig::new(hidden_size),
        )
    }

    pub fn num_parameters(&self) -> usize {
        2 * self.config.hidden_size
    }
}

impl NormalizationLayer for LayerNorm {
    fn config(&self) -> &NormConfig {
        &self.config
    }

    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_last_dim("norm.input", hidden, self.config.hidden_size)?;

        let hidden_size = self.config.hidden_size as f64;
        let compute = policy.cast_for_reduction(hidden)?;
        let mean = (compute.sum_keepdim(D::Minus1)? / hidden_size)?;
        let centered = compute.broadcast_sub(&mean)?;
        let variance = (centered.sqr()?.sum_keepdim(D::Minus1)? / hidden_size)?;
        let denom = (variance + self.config.epsilon)?.sqrt()?;
        let normalized = centered.broadcast_div(&denom)?.to_dtype(policy.compute())?;

        let weight = self.weight.to_dtype(normalized.dtype())?;
        let bias = self.bias.to_dtype(normalized.dtype())?;
        let output = normalized.broadcast_mul(&weight)?.broadcast_add(&bias)?;
        policy.cast_to_storage(&output)
    }
}

/// Batch normalisation over `(batch, channels, time)` inputs.
///
/// Training mode normalises with the statistics of the current batch and
/// folds them into running estimates (`momentum` weighting the new batch,
/// unbiased variance). Inference mode uses the running estimates.
#[derive(Debug)]
pub struct BatchNorm1d {
    config: NormConfig,
    momentum: f64,
    weight: Tensor,
    bias: Tensor,
    running: Mutex<(Tensor, Tensor)>,
    training: AtomicBool,
}

impl BatchNorm1d {
    /// Creates a batch norm with unit scale, zero shift and momentum `0.1`.
    pub fn new(channels: usize, device: &Device, dtype: DType) -> Result<Self> {
        if channels == 0 {
            return Err(Error::Msg("batch norm needs at least one channel".into()));
        }
        Ok(Self {
            config: NormConfig::new(channels),
            momentum: 0.1,
            weight: Tensor::ones(channels, dtype, device)?,
            bias: Tensor::zeros(channels, dtype, device)?,
            running: Mutex::new((
                Tensor::zeros(channels, DType::F32, device)?,
                Tensor::ones(channels, DType::F32, device)?,
            )),
            training: AtomicBool::new(true),
        })
    }

    pub fn set_training(&self, training: bool) {
        self.training.store(training, Ordering::Relaxed);
    }

    pub fn num_parameters(&self) -> usize {
        2 * self.config.hidden_size
    }

    /// Snapshot of `(running_mean, running_var)`, both `f32`.
    pub fn running_stats(&self) -> Result<(Tensor, Tensor)> {
        let guard = self
            .running
            .lock()
            .map_err(|_| Error::Msg("batch norm statistics mutex poisoned".into()))?;
        Ok(guard.clone())
    }

    fn batch_stats(&self, compute: &Tensor) -> Result<(Tensor, Tensor)> {
        let (batch, _, len) = compute.dims3()?;
        let mean = compute.mean_keepdim(0)?.mean_keepdim(2)?;
        let variance = compute
            .broadcast_sub(&mean)?
            .sqr()?
            .mean_keepdim(0)?
            .mean_keepdim(2)?;

        let count = (batch * len) as f64;
        let unbiased = if count > 1.0 {
            variance.affine(count / (count - 1.0), 0.0)?
        } else {
            variance.clone()
        };
        let mut guard = self
            .running
            .lock()
            .map_err(|_| Error::Msg("batch norm statistics mutex poisoned".into()))?;
        let m = self.momentum;
        let new_mean = guard
            .0
            .affine(1.0 - m, 0.0)?
            .add(&mean.flatten_all()?.to_dtype(DType::F32)?.affine(m, 0.0)?)?;
        let new_var = guard
            .1
            .affine(1.0 - m, 0.0)?
            .add(&unbiased.flatten_all()?.to_dtype(DType::F32)?.affine(m, 0.0)?)?;
        *guard = (new_mean, new_var);
        Ok((mean, variance))
    }
}

impl NormalizationLayer for BatchNorm1d {
    fn config(&self) -> &NormConfig {
        &self.config
    }

    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_rank("batch_norm.input", hidden, 3)?;
        let channels = self.config.hidden_size;
        if hidden.dim(1)? != channels {
            return Err(Error::Msg(format!(
                "batch_norm.input: expected {channels} channels, got shape {:?}",
                hidden.dims()
            )));
        }

        let compute = policy.cast_for_reduction(hidden)?;
        let (mean, variance) = if self.training.load(Ordering::Relaxed) {
            self.batch_stats(&compute)?
        } else {
            let (mean, var) = self.running_stats()?;
            (
                mean.to_dtype(compute.dtype())?.reshape((1, channels, 1))?,
                var.to_dtype(compute.dtype())?.reshape((1, channels, 1))?,
            )
        };
        let denom = (variance + self.config.epsilon)?.sqrt()?;
        let normalized = compute
            .broadcast_sub(&mean)?
            .broadcast_div(&denom)?
            .to_dtype(policy.compute())?;

        let weight = self
            .weight
            .to_dtype(normalized.dtype())?
            .reshape((1, channels, 1))?;
        let bias = self
            .bias
            .to_dtype(normalized.dtype())?
            .reshape((1, channels, 1))?;
        policy.cast_to_storage(&normalized.broadcast_mul(&weight)?.broadcast_add(&bias)?)
    }
}
