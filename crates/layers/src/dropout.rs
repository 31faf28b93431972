//! Seeded inverted dropout with an explicit training switch.
//!
//! Masks are drawn from a per-layer 64-bit LCG so two models built with the
//! same seeds drop the same elements. In inference mode (or with probability
//! zero) the input passes through untouched, which is what makes forecasts
//! reproducible once [`Dropout::set_training`] has been switched off.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
};

use candle_core::{Error, Result, Tensor};

use crate::dtypes::PrecisionPolicy;

/// Dropout policy resolved from an optional probability.
#[derive(Debug)]
pub enum DropoutMode {
    /// Dropout never fires.
    Disabled,
    /// Dropout is active with the supplied probability and RNG.
    Enabled { probability: f32, rng: Mutex<Lcg64> },
}

impl DropoutMode {
    /// Builds a mode from a probability; `0.0` disables dropout.
    pub fn from_probability(probability: f32, seed: u64) -> Result<Self> {
        if !(0.0..1.0).contains(&probability) {
            return Err(Error::Msg(format!(
                "dropout probability must be in [0, 1), got {probability}"
            )));
        }
        if probability == 0.0 {
            Ok(DropoutMode::Disabled)
        } else {
            Ok(DropoutMode::Enabled {
                probability,
                rng: Mutex::new(Lcg64::new(seed)),
            })
        }
    }
}

/// Inverted dropout layer.
pub struct Dropout {
    mode: DropoutMode,
    training: AtomicBool,
}

impl fmt::Debug for Dropout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dropout")
            .field("probability", &self.probability())
            .field("training", &self.is_training())
            .finish()
    }
}

impl Dropout {
    /// Creates a dropout layer in training mode.
    pub fn new(probability: f32, seed: u64) -> Result<Self> {
        Ok(Self {
            mode: DropoutMode::from_probability(probability, seed)?,
            training: AtomicBool::new(true),
        })
    }

    /// A layer that never drops anything.
    pub fn disabled() -> Self {
        Self {
            mode: DropoutMode::Disabled,
            training: AtomicBool::new(true),
        }
    }

    /// Configured drop probability.
    pub fn probability(&self) -> f32 {
        match &self.mode {
            DropoutMode::Disabled => 0.0,
            DropoutMode::Enabled { probability, .. } => *probability,
        }
    }

    /// Enables or disables dropout based on training mode.
    pub fn set_training(&self, training: bool) {
        self.training.store(training, Ordering::Relaxed);
    }

    /// Whether the layer is currently in training mode.
    pub fn is_training(&self) -> bool {
        self.training.load(Ordering::Relaxed)
    }

    /// Applies dropout, scaling kept activations by `1 / (1 - p)`.
    pub fn forward(&self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let (probability, rng) = match &self.mode {
            DropoutMode::Enabled { probability, rng } if self.is_training() => (*probability, rng),
            _ => return Ok(input.clone()),
        };
        let keep_prob = 1.0 - probability;
        let total = input.elem_count();
        let mask_data = {
            let mut rng = rng
                .lock()
                .map_err(|_| Error::Msg("dropout RNG mutex poisoned".into()))?;
            (0..total)
                .map(|_| {
                    if rng.next_f32() < keep_prob {
                        1.0 / keep_prob
                    } else {
                        0.0
                    }
                })
                .collect::<Vec<f32>>()
        };
        let compute = policy.cast_for_matmul(input)?;
        let mask = Tensor::from_vec(mask_data, input.dims(), input.device())?
            .to_dtype(compute.dtype())?;
        policy.cast_to_storage(&compute.mul(&mask)?)
    }
}

/// Simple 64-bit linear congruential generator for deterministic masks.
#[derive(Debug, Clone)]
pub struct Lcg64 {
    state: u64,
}

impl Lcg64 {
    /// Seeds the generator.
    pub fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        // Knuth's MMIX multiplier.
        self.state = self
            .state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.state
    }

    /// Uniform sample in `[0, 1)`.
    pub fn next_f32(&mut self) -> f32 {
        const SCALE: f64 = 1.0 / ((1u64 << 53) as f64);
        let bits = self.next_u64() >> 11;
        (bits as f64 * SCALE) as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn dropout_preserves_expectation() -> Result<()> {
        let dropout = Dropout::new(0.25, 123)?;
        let input = Tensor::ones((4, 8, 16), DType::F32, &Device::Cpu)?;
        let dropped = dropout.forward(&input, &PrecisionPolicy::default())?;

        let values = dropped.flatten_all()?.to_vec1::<f32>()?;
        let zeros = values.iter().filter(|v| **v == 0.0).count();
        let mean = values.iter().sum::<f32>() / values.len() as f32;
        assert!(zeros > 0);
        assert!((mean - 1.0).abs() < 0.1);
        Ok(())
    }

    #[test]
    fn inference_mode_is_identity() -> Result<()> {
        let dropout = Dropout::new(0.5, 0)?;
        dropout.set_training(false);
        let input = Tensor::randn(0f32, 1.0, (2, 3, 4), &Device::Cpu)?;
        let out = dropout.forward(&input, &PrecisionPolicy::default())?;
        let diff = input.sub(&out)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert_eq!(diff, 0.0);
        Ok(())
    }

    #[test]
    fn equal_seeds_give_equal_masks() -> Result<()> {
        let input = Tensor::ones((3, 5, 7), DType::F32, &Device::Cpu)?;
        let policy = PrecisionPolicy::default();
        let a = Dropout::new(0.3, 7)?.forward(&input, &policy)?;
        let b = Dropout::new(0.3, 7)?.forward(&input, &policy)?;
        let diff = a.sub(&b)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert_eq!(diff, 0.0);
        Ok(())
    }

    #[test]
    fn invalid_probability_is_rejected() {
        assert!(Dropout::new(1.0, 0).is_err());
        assert!(Dropout::new(-0.1, 0).is_err());
        assert_eq!(Dropout::disabled().probability(), 0.0);
    }
}
