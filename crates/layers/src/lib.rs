//! Building blocks for the forecasting models.
//!
//! Every layer here is assembled from Candle primitives and follows the
//! precision rules of [`dtypes::PrecisionPolicy`]: parameters live in the
//! storage dtype, matmuls and activations run in the compute dtype, and
//! outputs are cast back before they leave the layer.

pub mod activations;
pub mod checks;
pub mod conv;
pub mod dropout;
pub mod dtypes;
pub mod linear;
pub mod mlp;
pub mod norm;
pub mod residual;

use thiserror::Error;

pub use activations::{Activation, ActivationKind};
pub use conv::{max_pool1d, Conv1d, Conv1dConfig, PaddingMode};
pub use dropout::Dropout;
pub use dtypes::PrecisionPolicy;
pub use linear::{Linear, LinearConfig, LinearInit, LinearLayer};
pub use mlp::{FeedForward, FeedForwardConfig, FeedForwardLayer};
pub use norm::{BatchNorm1d, LayerNorm, NormConfig, NormalizationLayer};
pub use residual::Residual;

/// Errors raised while resolving layer configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LayerError {
    /// The activation name is not part of the supported registry.
    #[error("unknown activation `{0}`")]
    UnknownActivation(String),
}
