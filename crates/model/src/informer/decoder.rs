//! Informer decoder.

use attention::MultiHeadAttention;
use candle_core::{bail, DType, Device, Result, Tensor};
use layers::{
    activations::ActivationKind,
    dtypes::PrecisionPolicy,
    mlp::{FeedForward, FeedForwardConfig, FeedForwardLayer},
    norm::{LayerNorm, NormalizationLayer},
    residual::Residual,
};

/// Masked self-attention, cross-attention over the encoder output, then a
/// feed-forward block. Each sub-block is followed by a residual add and a
/// layer norm.
#[derive(Debug)]
pub struct DecoderLayer {
    self_attention: MultiHeadAttention,
    self_residual: Residual,
    norm1: LayerNorm,
    cross_attention: MultiHeadAttention,
    cross_residual: Residual,
    norm2: LayerNorm,
    feed_forward: FeedForward,
    norm3: LayerNorm,
}

impl DecoderLayer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        self_attention: MultiHeadAttention,
        cross_attention: MultiHeadAttention,
        d_ff: usize,
        dropout: f32,
        activation: ActivationKind,
        seed: u64,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let d_model = self_attention.config().d_model;
        if cross_attention.config().d_model != d_model {
            bail!(
                "cross-attention width {} differs from self-attention width {d_model}",
                cross_attention.config().d_model
            );
        }
        let feed_forward = FeedForward::new(
            FeedForwardConfig {
                dropout_p: dropout,
                ..FeedForwardConfig::new(d_model, d_ff, activation)
            },
            seed.wrapping_add(2),
            device,
            dtype,
        )?;
        Ok(Self {
            self_attention,
            self_residual: Residual::new(dropout, seed)?,
            norm1: LayerNorm::identity(d_model, device, dtype)?,
            cross_attention,
            cross_residual: Residual::new(dropout, seed.wrapping_add(1))?,
            norm2: LayerNorm::identity(d_model, device, dtype)?,
            feed_forward,
            norm3: LayerNorm::identity(d_model, device, dtype)?,
        })
    }

    pub fn set_training(&self, training: bool) {
        self.self_attention.set_training(training);
        self.self_residual.set_training(training);
        self.cross_attention.set_training(training);
        self.cross_residual.set_training(training);
        self.feed_forward.set_training(training);
    }

    pub fn num_parameters(&self) -> usize {
        self.self_attention.num_parameters()
            + self.cross_attention.num_parameters()
            + self.feed_forward.num_parameters()
            + 3 * self.norm1.num_parameters()
    }

    /// `x (batch, dec_len, d_model)` attends to itself and to
    /// `cross (batch, enc_len, d_model)`.
    pub fn forward(
        &self,
        x: &Tensor,
        cross: &Tensor,
        self_mask: Option<&Tensor>,
        cross_mask: Option<&Tensor>,
        policy: &PrecisionPolicy,
    ) -> Result<Tensor> {
        let attended = self.self_attention.forward(x, x, x, self_mask, policy)?;
        let x = self.norm1.forward(&self.self_residual.add(&attended, x, policy)?, policy)?;

        let attended = self
            .cross_attention
            .forward(&x, cross, cross, cross_mask, policy)?;
        let x = self.norm2.forward(&self.cross_residual.add(&attended, &x, policy)?, policy)?;

        let y = self.feed_forward.forward(&x, policy)?;
        let summed = policy.cast_for_matmul(&x)?.add(&policy.cast_for_matmul(&y)?)?;
        self.norm3.forward(&policy.cast_to_storage(&summed)?, policy)
    }
}

/// Stack of [`DecoderLayer`]s with a final layer norm.
#[derive(Debug)]
pub struct Decoder {
    layers: Vec<DecoderLayer>,
    norm: LayerNorm,
}

impl Decoder {
    pub fn new(layers: Vec<DecoderLayer>, d_model: usize, device: &Device, dtype: DType) -> Result<Self> {
        Ok(Self {
            layers,
            norm: LayerNorm::identity(d_model, device, dtype)?,
        })
    }

    pub fn set_training(&self, training: bool) {
        self.layers.iter().for_each(|layer| layer.set_training(training));
    }

    pub fn num_parameters(&self) -> usize {
        self.layers.iter().map(DecoderLayer::num_parameters).sum::<usize>() + self.norm.num_parameters()
    }

    pub fn forward(
        &self,
        x: &Tensor,
        cross: &Tensor,
        self_mask: Option<&Tensor>,
        cross_mask: Option<&Tensor>,
        policy: &PrecisionPolicy,
    ) -> Result<Tensor> {
        let mut hidden = x.clone();
        for layer in &self.layers {
            hidden = layer.forward(&hidden, cross, self_mask, cross_mask, policy)?;
        }
        self.norm.forward(&hidden, policy)
    }
}
