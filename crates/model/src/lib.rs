//! Forecasting models assembled from the `layers`, `attention` and
//! `embedding` crates.

pub mod config;
pub mod forecaster;
pub mod informer;
pub mod registry;

pub use config::{
    AttentionKind, ConfigError, ForecasterConfig, InformerConfig, ModelDefinition, ModelKind,
    Precision,
};
pub use forecaster::AttentionForecaster;
pub use informer::Informer;
pub use registry::FloodModel;
