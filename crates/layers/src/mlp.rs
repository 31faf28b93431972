//! Position-wise feed-forward blocks built on top of projections and activations.
//!
//! A feed-forward block expands the trailing axis to `intermediate_size`,
//! applies the activation and dropout, contracts back to `hidden_size` and
//! applies dropout again. It is equivalent to a pair of kernel-size-one
//! convolutions over the time axis.

use candle_core::{DType, Device, Error, Result, Tensor};

use crate::{
    activations::{Activation, ActivationKind},
    dropout::Dropout,
    dtypes::PrecisionPolicy,
    linear::{Linear, LinearConfig, LinearInit, LinearLayer},
};

/// Configuration shared by feed-forward networks.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedForwardConfig {
    /// Model hidden size.
    pub hidden_size: usize,
    /// Width of the activation space.
    pub intermediate_size: usize,
    /// Activation applied between projections.
    pub activation: ActivationKind,
    /// Dropout after the activation and after the output projection.
    pub dropout_p: f32,
}

impl FeedForwardConfig {
    pub fn new(hidden_size: usize, intermediate_size: usize, activation: ActivationKind) -> Self {
        Self {
            hidden_size,
            intermediate_size,
            activation,
            dropout_p: 0.0,
        }
    }
}

/// Shared interface for feed-forward stacks.
pub trait FeedForwardLayer: Send + Sync {
    /// Configuration metadata used during block assembly.
    fn config(&self) -> &FeedForwardConfig;

    /// Performs the forward pass through the MLP.
    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor>;
}

/// Two-projection MLP.
#[derive(Debug)]
pub struct FeedForward {
    config: FeedForwardConfig,
    up: Linear,
    down: Linear,
    inner_dropout: Dropout,
    output_dropout: Dropout,
}

impl FeedForward {
    /// Builds the block with fan-in uniform projections and seeded dropout.
    pub fn new(config: FeedForwardConfig, seed: u64, device: &Device, dtype: DType) -> Result<Self> {
        if config.hidden_size == 0 || config.intermediate_size == 0 {
            return Err(Error::Msg(format!(
                "feed-forward sizes must be positive, got {config:?}"
            )));
        }
        let init = LinearInit::FanInUniform;
        let up = Linear::with_init(
            LinearConfig::new(config.hidden_size, config.intermediate_size),
            &init,
            device,
            dtype,
        )?;
        let down = Linear::with_init(
            LinearConfig::new(config.intermediate_size, config.hidden_size),
            &init,
            device,
            dtype,
        )?;
        Ok(Self {
            inner_dropout: Dropout::new(config.dropout_p, seed)?,
            output_dropout: Dropout::new(config.dropout_p, seed.wrapping_add(1))?,
            config,
            up,
            down,
        })
    }

    pub fn set_training(&self, training: bool) {
        self.inner_dropout.set_training(training);
        self.output_dropout.set_training(training);
    }

    pub fn num_parameters(&self) -> usize {
        self.up.num_parameters() + self.down.num_parameters()
    }
}

impl FeedForwardLayer for FeedForward {
    fn config(&self) -> &FeedForwardConfig {
        &self.config
    }

    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let expanded = self.up.forward(hidden, policy)?;
        let activated = self.config.activation.forward(&expanded, policy)?;
        let activated = self.inner_dropout.forward(&activated, policy)?;
        let contracted = self.down.forward(&activated, policy)?;
        self.output_dropout.forward(&contracted, policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preserves_hidden_layout() -> Result<()> {
        let device = Device::Cpu;
        let config = FeedForwardConfig::new(8, 32, ActivationKind::Gelu);
        let mlp = FeedForward::new(config, 0, &device, DType::F32)?;
        let input = Tensor::randn(0f32, 1.0, (2, 5, 8), &device)?;
        let output = mlp.forward(&input, &PrecisionPolicy::default())?;
        assert_eq!(output.dims(), &[2, 5, 8]);
        assert_eq!(mlp.num_parameters(), 8 * 32 + 32 + 32 * 8 + 8);
        Ok(())
    }

    #[test]
    fn inference_is_deterministic() -> Result<()> {
        let device = Device::Cpu;
        let config = FeedForwardConfig {
            dropout_p: 0.3,
            ..FeedForwardConfig::new(4, 16, ActivationKind::Relu)
        };
        let mlp = FeedForward::new(config, 11, &device, DType::F32)?;
        mlp.set_training(false);
        let input = Tensor::randn(0f32, 1.0, (1, 3, 4), &device)?;
        let policy = PrecisionPolicy::default();
        let a = mlp.forward(&input, &policy)?;
        let b = mlp.forward(&input, &policy)?;
        let diff = a.sub(&b)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert_eq!(diff, 0.0);
        Ok(())
    }
}
