//! Activation registry for feed-forward stacks and forecast heads.
//!
//! [`ActivationKind`] is a closed enumeration: configuration files name an
//! activation once, it is resolved to a variant at load time, and the forward
//! pass dispatches with a `match`. Inputs of any rank are accepted and the
//! output keeps the input layout, except [`ActivationKind::Softmax`] which
//! normalises along the last axis.
//!
//! # Formulas
//!
//! * **GELU** uses the erf form `0.5 * x * (1 + erf(x / sqrt(2)))`.
//! * **SiLU / Swish** computes `x * sigmoid(x)`.
//! * **Softplus** is evaluated as `relu(x) + ln(1 + exp(-|x|))` so large
//!   inputs do not overflow.
//! * **ELU** uses `alpha = 1`.

use std::{fmt, str::FromStr};

use candle_core::{Result, Tensor};
use serde::{Deserialize, Serialize};

use crate::{dtypes::PrecisionPolicy, LayerError};

/// Identifies a supported non-linearity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationKind {
    /// Identity function.
    Identity,
    /// Rectified linear unit.
    #[serde(alias = "ReLU")]
    Relu,
    /// Gaussian error linear unit (erf form).
    #[serde(alias = "GELU")]
    Gelu,
    /// SiLU, also known as swish.
    #[serde(alias = "swish", alias = "Swish")]
    Silu,
    /// Logistic sigmoid, bounded to `(0, 1)`.
    #[serde(alias = "Sigmoid")]
    Sigmoid,
    /// Hyperbolic tangent, bounded to `(-1, 1)`.
    #[serde(alias = "Tanh")]
    Tanh,
    /// Smooth approximation of ReLU, bounded below by zero.
    #[serde(alias = "Softplus")]
    Softplus,
    /// Exponential linear unit.
    #[serde(alias = "ELU")]
    Elu,
    /// Softmax over the last axis.
    #[serde(alias = "Softmax")]
    Softmax,
}

/// Common interface shared by activation functions.
pub trait Activation: Send + Sync {
    /// Returns the [`ActivationKind`] for introspection.
    fn kind(&self) -> ActivationKind;

    /// Applies the activation using the precision rules in `policy`.
    fn forward(&self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor>;
}

impl ActivationKind {
    /// Every supported activation, in registry order.
    pub const ALL: [ActivationKind; 9] = [
        ActivationKind::Identity,
        ActivationKind::Relu,
        ActivationKind::Gelu,
        ActivationKind::Silu,
        ActivationKind::Sigmoid,
        ActivationKind::Tanh,
        ActivationKind::Softplus,
        ActivationKind::Elu,
        ActivationKind::Softmax,
    ];

    /// Canonical configuration name.
    pub fn name(&self) -> &'static str {
        match self {
            ActivationKind::Identity => "identity",
            ActivationKind::Relu => "relu",
            ActivationKind::Gelu => "gelu",
            ActivationKind::Silu => "silu",
            ActivationKind::Sigmoid => "sigmoid",
            ActivationKind::Tanh => "tanh",
            ActivationKind::Softplus => "softplus",
            ActivationKind::Elu => "elu",
            ActivationKind::Softmax => "softmax",
        }
    }

    /// Whether the output range is bounded on at least one side.
    ///
    /// GELU and SiLU dip slightly below zero but have a finite minimum, so
    /// only the identity is unbounded.
    pub fn is_bounded(&self) -> bool {
        !matches!(self, ActivationKind::Identity)
    }

    fn apply(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            ActivationKind::Identity => Ok(x.clone()),
            ActivationKind::Relu => x.relu(),
            ActivationKind::Gelu => x.gelu_erf(),
            ActivationKind::Silu => x.silu(),
            ActivationKind::Sigmoid => candle_nn::ops::sigmoid(&x.contiguous()?),
            ActivationKind::Tanh => x.tanh(),
            ActivationKind::Softplus => {
                let tail = (x.abs()?.neg()?.exp()? + 1.0)?.log()?;
                x.relu()?.add(&tail)
            }
            ActivationKind::Elu => x.elu(1.0),
            ActivationKind::Softmax => candle_nn::ops::softmax_last_dim(&x.contiguous()?),
        }
    }
}

impl Activation for ActivationKind {
    fn kind(&self) -> ActivationKind {
        *self
    }

    fn forward(&self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        if *self == ActivationKind::Identity {
            return policy.cast_to_storage(input);
        }
        let compute = policy.cast_for_matmul(input)?;
        policy.cast_to_storage(&self.apply(&compute)?)
    }
}

impl fmt::Display for ActivationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ActivationKind {
    type Err = LayerError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "identity" | "linear" => Ok(ActivationKind::Identity),
            "relu" => Ok(ActivationKind::Relu),
            "gelu" => Ok(ActivationKind::Gelu),
            "silu" | "swish" => Ok(ActivationKind::Silu),
            "sigmoid" => Ok(ActivationKind::Sigmoid),
            "tanh" => Ok(ActivationKind::Tanh),
            "softplus" => Ok(ActivationKind::Softplus),
            "elu" => Ok(ActivationKind::Elu),
            "softmax" => Ok(ActivationKind::Softmax),
            _ => Err(LayerError::UnknownActivation(s.to_string())),
        }
    }
}
