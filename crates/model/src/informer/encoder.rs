//! Informer encoder: attention layers interleaved with distilling convolutions.

use attention::MultiHeadAttention;
use candle_core::{DType, Device, Result, Tensor};
use layers::{
    activations::ActivationKind,
    checks,
    conv::{max_pool1d, Conv1d, Conv1dConfig},
    dtypes::PrecisionPolicy,
    linear::LinearInit,
    mlp::{FeedForward, FeedForwardConfig, FeedForwardLayer},
    norm::{BatchNorm1d, LayerNorm, NormalizationLayer},
    residual::Residual,
};

/// Self-attention followed by a position-wise feed-forward block, post-norm.
#[derive(Debug)]
pub struct EncoderLayer {
    attention: MultiHeadAttention,
    attention_residual: Residual,
    norm1: LayerNorm,
    feed_forward: FeedForward,
    norm2: LayerNorm,
}

impl EncoderLayer {
    pub fn new(
        attention: MultiHeadAttention,
        d_ff: usize,
        dropout: f32,
        activation: ActivationKind,
        seed: u64,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let d_model = attention.config().d_model;
        let feed_forward = FeedForward::new(
            FeedForwardConfig {
                dropout_p: dropout,
                ..FeedForwardConfig::new(d_model, d_ff, activation)
            },
            seed.wrapping_add(1),
            device,
            dtype,
        )?;
        Ok(Self {
            attention,
            attention_residual: Residual::new(dropout, seed)?,
            norm1: LayerNorm::identity(d_model, device, dtype)?,
            feed_forward,
            norm2: LayerNorm::identity(d_model, device, dtype)?,
        })
    }

    pub fn set_training(&self, training: bool) {
        self.attention.set_training(training);
        self.attention_residual.set_training(training);
        self.feed_forward.set_training(training);
    }

    pub fn num_parameters(&self) -> usize {
        self.attention.num_parameters()
            + self.feed_forward.num_parameters()
            + self.norm1.num_parameters()
            + self.norm2.num_parameters()
    }

    /// Maps `(batch, seq, d_model)` to the same shape, with optional weights.
    pub fn forward(
        &self,
        x: &Tensor,
        mask: Option<&Tensor>,
        policy: &PrecisionPolicy,
        return_weights: bool,
    ) -> Result<(Tensor, Option<Tensor>)> {
        let (attended, weights) = self
            .attention
            .forward_with_weights(x, x, x, mask, policy, return_weights)?;
        let x = self.attention_residual.add(&attended, x, policy)?;
        let x = self.norm1.forward(&x, policy)?;
        let y = self.feed_forward.forward(&x, policy)?;
        let summed = policy.cast_for_matmul(&x)?.add(&policy.cast_for_matmul(&y)?)?;
        let out = self.norm2.forward(&policy.cast_to_storage(&summed)?, policy)?;
        Ok((out, weights))
    }
}

/// Circular convolution, batch norm, ELU and a stride-2 max pool.
///
/// Sequence length goes from `L` to `(L - 1) / 2 + 1`.
#[derive(Debug)]
pub struct DistilLayer {
    conv: Conv1d,
    norm: BatchNorm1d,
}

impl DistilLayer {
    pub fn new(channels: usize, device: &Device, dtype: DType) -> Result<Self> {
        let conv = Conv1d::with_init(
            Conv1dConfig::circular(channels, channels, 3),
            &LinearInit::FanInUniform,
            device,
            dtype,
        )?;
        Ok(Self {
            conv,
            norm: BatchNorm1d::new(channels, device, dtype)?,
        })
    }

    pub fn set_training(&self, training: bool) {
        self.norm.set_training(training);
    }

    pub fn num_parameters(&self) -> usize {
        self.conv.num_parameters() + self.norm.num_parameters()
    }

    pub fn output_len(len: usize) -> usize {
        len.saturating_sub(1) / 2 + 1
    }

    pub fn forward(&self, x: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_rank("distil.input", x, 3)?;
        let channels_first = x.transpose(1, 2)?.contiguous()?;
        let convolved = self.conv.forward(&channels_first, policy)?;
        let normalized = self.norm.forward(&convolved, policy)?;
        let activated = policy.cast_to_storage(&policy.cast_for_matmul(&normalized)?.elu(1.0)?)?;
        let pooled = max_pool1d(&activated, 3, 2, 1)?;
        pooled.transpose(1, 2)?.contiguous()
    }
}

/// Stack of [`EncoderLayer`]s with optional distilling between them.
#[derive(Debug)]
pub struct Encoder {
    layers: Vec<EncoderLayer>,
    distil: Vec<DistilLayer>,
    norm: LayerNorm,
}

impl Encoder {
    /// `distil` must be empty or hold one layer fewer than `layers`.
    pub fn new(
        layers: Vec<EncoderLayer>,
        distil: Vec<DistilLayer>,
        d_model: usize,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        if !distil.is_empty() && distil.len() + 1 != layers.len() {
            candle_core::bail!(
                "encoder with {} attention layers needs {} distilling layers, got {}",
                layers.len(),
                layers.len().saturating_sub(1),
                distil.len()
            );
        }
        Ok(Self {
            layers,
            distil,
            norm: LayerNorm::identity(d_model, device, dtype)?,
        })
    }

    pub fn set_training(&self, training: bool) {
        self.layers.iter().for_each(|layer| layer.set_training(training));
        self.distil.iter().for_each(|layer| layer.set_training(training));
    }

    pub fn num_parameters(&self) -> usize {
        self.layers.iter().map(EncoderLayer::num_parameters).sum::<usize>()
            + self.distil.iter().map(DistilLayer::num_parameters).sum::<usize>()
            + self.norm.num_parameters()
    }

    /// Encodes `(batch, seq, d_model)`, returning per-layer attention maps
    /// when `return_weights` is set.
    ///
    /// `mask` only applies to the first layer when distilling shortens the
    /// sequence.
    pub fn forward(
        &self,
        x: &Tensor,
        mask: Option<&Tensor>,
        policy: &PrecisionPolicy,
        return_weights: bool,
    ) -> Result<(Tensor, Vec<Tensor>)> {
        let mut hidden = x.clone();
        let mut maps = Vec::new();
        if self.distil.is_empty() {
            for layer in &self.layers {
                let (next, weights) = layer.forward(&hidden, mask, policy, return_weights)?;
                hidden = next;
                maps.extend(weights);
            }
        } else {
            let mut layer_mask = mask;
            for (layer, distil) in self.layers.iter().zip(&self.distil) {
                let (next, weights) = layer.forward(&hidden, layer_mask, policy, return_weights)?;
                hidden = distil.forward(&next, policy)?;
                maps.extend(weights);
                layer_mask = None;
            }
            if let Some(last) = self.layers.last() {
                let (next, weights) = last.forward(&hidden, None, policy, return_weights)?;
                hidden = next;
                maps.extend(weights);
            }
        }
        log::debug!("encoder output {:?}", hidden.dims());
        Ok((self.norm.forward(&hidden, policy)?, maps))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distilling_halves_sequence() -> Result<()> {
        let device = Device::Cpu;
        let layer = DistilLayer::new(6, &device, DType::F32)?;
        let policy = PrecisionPolicy::default();
        for len in [20usize, 11, 2, 1] {
            let x = Tensor::randn(0f32, 1.0, (2, len, 6), &device)?;
            let out = layer.forward(&x, &policy)?;
            assert_eq!(out.dims(), &[2, DistilLayer::output_len(len), 6]);
        }
        assert_eq!(DistilLayer::output_len(20), 10);
        assert_eq!(DistilLayer::output_len(11), 6);
        Ok(())
    }

    #[test]
    fn inference_uses_running_statistics() -> Result<()> {
        let device = Device::Cpu;
        let layer = DistilLayer::new(4, &device, DType::F32)?;
        layer.set_training(false);
        let policy = PrecisionPolicy::default();
        let x = Tensor::randn(0f32, 1.0, (1, 8, 4), &device)?;
        let a = layer.forward(&x, &policy)?;
        let b = layer.forward(&x, &policy)?;
        assert_eq!(a.sub(&b)?.abs()?.max_all()?.to_vec0::<f32>()?, 0.0);
        Ok(())
    }
}
