//! Builds a model from a [`ModelDefinition`].

use candle_core::{Device, Result, Tensor};
use embedding::TemporalFeature;

use crate::{
    config::{ModelDefinition, ModelKind},
    forecaster::AttentionForecaster,
    informer::Informer,
};

/// Any model a definition file can describe.
#[derive(Debug)]
pub enum FloodModel {
    AttentionForecaster(AttentionForecaster),
    Informer(Informer),
}

impl FloodModel {
    pub fn build(definition: &ModelDefinition, device: &Device) -> Result<Self> {
        definition.validate()?;
        let dtype = definition.dtype();
        match &definition.model {
            ModelKind::AttentionForecaster(config) => Ok(FloodModel::AttentionForecaster(
                AttentionForecaster::new(config.clone(), device, dtype)?,
            )),
            ModelKind::Informer(config) => Ok(FloodModel::Informer(Informer::new(
                config.clone(),
                device,
                dtype,
            )?)),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FloodModel::AttentionForecaster(_) => "attention_forecaster",
            FloodModel::Informer(_) => "informer",
        }
    }

    pub fn set_training(&self, training: bool) {
        match self {
            FloodModel::AttentionForecaster(model) => model.set_training(training),
            FloodModel::Informer(model) => model.set_training(training),
        }
    }

    pub fn num_parameters(&self) -> usize {
        match self {
            FloodModel::AttentionForecaster(model) => model.num_parameters(),
            FloodModel::Informer(model) => model.num_parameters(),
        }
    }

    /// Runs one inference pass on standard-normal inputs of batch `batch`
    /// and returns the forecast.
    pub fn smoke_forward(&self, batch: usize, device: &Device) -> Result<Tensor> {
        self.set_training(false);
        match self {
            FloodModel::AttentionForecaster(model) => {
                let config = model.config();
                let x = Tensor::randn(0f32, 1.0, (batch, config.seq_len, config.n_time_series), device)?;
                model.forward(&x, None)
            }
            FloodModel::Informer(model) => {
                let config = model.config();
                let dec_len = config.decoder_len();
                let x_enc = Tensor::randn(0f32, 1.0, (batch, config.seq_len, config.enc_in), device)?;
                let x_dec = Tensor::randn(0f32, 1.0, (batch, dec_len, config.dec_in), device)?;
                let mark_enc = calendar_marks(batch, config.seq_len, config.temp_depth, device)?;
                let mark_dec = calendar_marks(batch, dec_len, config.temp_depth, device)?;
                model.forward(&x_enc, &mark_enc, &x_dec, &mark_dec)
            }
        }
    }
}

/// Hourly calendar covariates `(batch, seq, depth)` starting at midnight,
/// January 1st.
pub fn calendar_marks(batch: usize, seq: usize, depth: usize, device: &Device) -> Result<Tensor> {
    let mut data = Vec::with_capacity(batch * seq * depth);
    for _ in 0..batch {
        for step in 0..seq {
            let day = step / 24;
            for feature in TemporalFeature::ALL.iter().take(depth) {
                let value = match feature {
                    TemporalFeature::Month => 1 + day / 28 % 12,
                    TemporalFeature::Day => 1 + day % 28,
                    TemporalFeature::Weekday => day % 7,
                    TemporalFeature::Hour => step % 24,
                    TemporalFeature::Minute => 0,
                };
                data.push(value as f32);
            }
        }
    }
    Tensor::from_vec(data, (batch, seq, depth), device)
}
