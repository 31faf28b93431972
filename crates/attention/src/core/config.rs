//! Configuration options shared by all attention implementations.
//!
//! The [`Config`] struct captures per-call knobs such as dropout and causal
//! masking that callers can tune without swapping implementations.

/// Configuration driving attention behaviour.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Config {
    /// Probability for dropout applied to attention weights during training.
    ///
    /// When `None`, dropout is disabled and the computation is deterministic.
    pub dropout_p: Option<f32>,
    /// Whether query `i` is prevented from attending to keys after `i`.
    pub causal: bool,
    /// Score scale; defaults to `1 / sqrt(head_dim)`.
    pub scale: Option<f32>,
}

impl Config {
    /// Configuration with the causal flag set.
    pub fn causal() -> Self {
        Self {
            causal: true,
            ..Self::default()
        }
    }

    pub(crate) fn scale_for(&self, head_dim: usize) -> f64 {
        match self.scale {
            Some(scale) => f64::from(scale),
            None => 1.0 / (head_dim as f64).sqrt(),
        }
    }
}
