use attention::{
    Attention, ExactAttention, MultiHeadAttention, MultiHeadAttentionConfig, ProbSparseAttention,
};
use candle_core::{bail, DType, Device, Result, Tensor};
use embedding::{DataEmbedding, DataEmbeddingConfig, DEFAULT_MAX_LEN};
use layers::{
    checks,
    dtypes::PrecisionPolicy,
    linear::{Linear, LinearConfig, LinearInit, LinearLayer},
};

use super::{
    decoder::{Decoder, DecoderLayer},
    encoder::{DistilLayer, Encoder, EncoderLayer},
};
use crate::config::{AttentionKind, InformerConfig};

/// Encoder/decoder forecaster with ProbSparse attention and distilling.
#[derive(Debug)]
pub struct Informer {
    config: InformerConfig,
    policy: PrecisionPolicy,
    enc_embedding: DataEmbedding,
    dec_embedding: DataEmbedding,
    encoder: Encoder,
    decoder: Decoder,
    projection: Linear,
}

impl Informer {
    pub fn new(config: InformerConfig, device: &Device, dtype: DType) -> Result<Self> {
        config.validate()?;
        let policy = PrecisionPolicy::from_parameter_dtype(dtype);
        let d_model = config.d_model;
        // Every stochastic component draws from its own stream.
        let mut next_seed = {
            let mut counter = config.seed.wrapping_mul(1_000);
            move || {
                counter = counter.wrapping_add(1);
                counter
            }
        };

        let embedding_config = |c_in: usize| DataEmbeddingConfig {
            temporal_kind: config.embed,
            temp_depth: config.temp_depth,
            dropout_p: config.dropout,
            max_len: DEFAULT_MAX_LEN,
            ..DataEmbeddingConfig::new(c_in, d_model)
        };
        let enc_embedding =
            DataEmbedding::new(embedding_config(config.enc_in), next_seed(), device, dtype)?;
        let dec_embedding =
            DataEmbedding::new(embedding_config(config.dec_in), next_seed(), device, dtype)?;

        let attention_layer = |kernel: Box<dyn Attention>, causal: bool, mix: bool| {
            let layer_config = MultiHeadAttentionConfig {
                dropout_p: config.dropout,
                causal,
                mix,
                ..MultiHeadAttentionConfig::new(d_model, config.n_heads)
            };
            MultiHeadAttention::new(layer_config, kernel, device, dtype)
        };

        let mut encoder_layers = Vec::with_capacity(config.e_layers);
        for _ in 0..config.e_layers {
            let kernel = self_attention_kernel(&config, next_seed());
            encoder_layers.push(EncoderLayer::new(
                attention_layer(kernel, false, false)?,
                config.d_ff,
                config.dropout,
                config.activation,
                next_seed(),
                device,
                dtype,
            )?);
        }
        let distil_layers = if config.distil {
            (1..config.e_layers)
                .map(|_| DistilLayer::new(d_model, device, dtype))
                .collect::<Result<Vec<_>>>()?
        } else {
            Vec::new()
        };
        let encoder = Encoder::new(encoder_layers, distil_layers, d_model, device, dtype)?;

        let mut decoder_layers = Vec::with_capacity(config.d_layers);
        for _ in 0..config.d_layers {
            let kernel = self_attention_kernel(&config, next_seed());
            decoder_layers.push(DecoderLayer::new(
                attention_layer(kernel, true, config.mix)?,
                attention_layer(Box::new(ExactAttention::new()), false, false)?,
                config.d_ff,
                config.dropout,
                config.activation,
                next_seed(),
                device,
                dtype,
            )?);
        }
        let decoder = Decoder::new(decoder_layers, d_model, device, dtype)?;

        let projection = Linear::with_init(
            LinearConfig::new(d_model, config.c_out),
            &LinearInit::FanInUniform,
            device,
            dtype,
        )?;

        let model = Self {
            config,
            policy,
            enc_embedding,
            dec_embedding,
            encoder,
            decoder,
            projection,
        };
        log::info!(
            "informer: attn={} e_layers={} d_layers={} d_model={} heads={} distil={} mix={} params={}",
            model.config.attn,
            model.config.e_layers,
            model.config.d_layers,
            model.config.d_model,
            model.config.n_heads,
            model.config.distil,
            model.config.mix,
            model.num_parameters()
        );
        Ok(model)
    }

    pub fn config(&self) -> &InformerConfig {
        &self.config
    }

    pub fn set_training(&self, training: bool) {
        self.enc_embedding.set_training(training);
        self.dec_embedding.set_training(training);
        self.encoder.set_training(training);
        self.decoder.set_training(training);
    }

    pub fn num_parameters(&self) -> usize {
        self.enc_embedding.num_parameters()
            + self.dec_embedding.num_parameters()
            + self.encoder.num_parameters()
            + self.decoder.num_parameters()
            + self.projection.num_parameters()
    }

    /// Forecasts `(batch, out_len, c_out)`.
    pub fn forward(
        &self,
        x_enc: &Tensor,
        x_mark_enc: &Tensor,
        x_dec: &Tensor,
        x_mark_dec: &Tensor,
    ) -> Result<Tensor> {
        self.forward_with_masks(x_enc, x_mark_enc, x_dec, x_mark_dec, None, None, None)
    }

    /// Like [`Informer::forward`] with explicit masks for the encoder
    /// self-attention, decoder self-attention and decoder cross-attention.
    #[allow(clippy::too_many_arguments)]
    pub fn forward_with_masks(
        &self,
        x_enc: &Tensor,
        x_mark_enc: &Tensor,
        x_dec: &Tensor,
        x_mark_dec: &Tensor,
        enc_self_mask: Option<&Tensor>,
        dec_self_mask: Option<&Tensor>,
        dec_enc_mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let masks = [enc_self_mask, dec_self_mask, dec_enc_mask];
        Ok(self
            .run(x_enc, x_mark_enc, x_dec, x_mark_dec, masks, false)?
            .0)
    }

    /// Forecast plus the encoder attention maps, one `(batch, heads, L, L)`
    /// tensor per encoder layer. The maps are empty unless
    /// `output_attention` is enabled.
    pub fn forward_with_attention(
        &self,
        x_enc: &Tensor,
        x_mark_enc: &Tensor,
        x_dec: &Tensor,
        x_mark_dec: &Tensor,
    ) -> Result<(Tensor, Vec<Tensor>)> {
        let return_weights = self.config.output_attention;
        if !return_weights {
            log::debug!("output_attention is disabled; no attention maps are collected");
        }
        self.run(x_enc, x_mark_enc, x_dec, x_mark_dec, [None; 3], return_weights)
    }

    fn run(
        &self,
        x_enc: &Tensor,
        x_mark_enc: &Tensor,
        x_dec: &Tensor,
        x_mark_dec: &Tensor,
        [enc_self_mask, dec_self_mask, dec_enc_mask]: [Option<&Tensor>; 3],
        return_weights: bool,
    ) -> Result<(Tensor, Vec<Tensor>)> {
        checks::expect_rank("informer.x_enc", x_enc, 3)?;
        checks::expect_last_dim("informer.x_enc", x_enc, self.config.enc_in)?;
        checks::expect_rank("informer.x_dec", x_dec, 3)?;
        checks::expect_last_dim("informer.x_dec", x_dec, self.config.dec_in)?;
        let dec_len = x_dec.dim(1)?;
        let out_len = self.config.out_len;
        if dec_len < out_len {
            bail!("decoder input has {dec_len} steps, fewer than out_len {out_len}");
        }
        if x_enc.dim(0)? != x_dec.dim(0)? {
            bail!(
                "encoder batch {} differs from decoder batch {}",
                x_enc.dim(0)?,
                x_dec.dim(0)?
            );
        }

        let policy = &self.policy;
        let enc_in = self.enc_embedding.forward(x_enc, x_mark_enc, policy)?;
        let (enc_out, maps) = self
            .encoder
            .forward(&enc_in, enc_self_mask, policy, return_weights)?;

        let dec_in = self.dec_embedding.forward(x_dec, x_mark_dec, policy)?;
        let dec_out = self
            .decoder
            .forward(&dec_in, &enc_out, dec_self_mask, dec_enc_mask, policy)?;
        let projected = self.projection.forward(&dec_out, policy)?;
        log::debug!(
            "informer forward enc={:?} memory={:?} dec={:?}",
            x_enc.dims(),
            enc_out.dims(),
            projected.dims()
        );
        let forecast = projected.narrow(1, dec_len - out_len, out_len)?.contiguous()?;
        Ok((forecast, maps))
    }
}

fn self_attention_kernel(config: &InformerConfig, seed: u64) -> Box<dyn Attention> {
    match config.attn {
        AttentionKind::Prob => Box::new(ProbSparseAttention::new(config.factor, seed)),
        AttentionKind::Full => Box::new(ExactAttention::new()),
    }
}
