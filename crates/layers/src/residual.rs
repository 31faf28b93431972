//! Post-norm residual connections.
//!
//! Branch outputs go through dropout and are added to the residual path; the
//! caller applies the normalisation afterwards. Both tensors must share shape
//! and dtype.

use candle_core::{Result, Tensor};

use crate::{checks, dropout::Dropout, dtypes::PrecisionPolicy};

/// Residual add with dropout on the transformed branch.
#[derive(Debug)]
pub struct Residual {
    dropout: Dropout,
}

impl Residual {
    /// Creates a residual helper with a deterministic dropout seed.
    pub fn new(dropout_p: f32, seed: u64) -> Result<Self> {
        Ok(Self {
            dropout: Dropout::new(dropout_p, seed)?,
        })
    }

    /// Enables or disables dropout based on training mode.
    pub fn set_training(&self, training: bool) {
        self.dropout.set_training(training);
    }

    /// Computes `residual + dropout(branch)`.
    pub fn add(&self, branch: &Tensor, residual: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_shape("residual.branch", branch, residual.dims())?;
        checks::expect_same_dtype("residual.branch", branch, "residual.input", residual)?;

        let branch = policy.cast_for_matmul(&self.dropout.forward(branch, policy)?)?;
        let residual = policy.cast_for_matmul(residual)?;
        policy.cast_to_storage(&branch.add(&residual)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn add_preserves_shape_and_dtype() -> Result<()> {
        let device = Device::Cpu;
        let dtype = DType::F16;
        let residual = Residual::new(0.0, 0)?;
        let left = Tensor::randn(0f32, 1.0, (2, 4, 8), &device)?.to_dtype(dtype)?;
        let right = Tensor::randn(0f32, 1.0, (2, 4, 8), &device)?.to_dtype(dtype)?;
        let out = residual.add(&left, &right, &PrecisionPolicy::from_parameter_dtype(dtype))?;
        assert_eq!(out.dims(), &[2, 4, 8]);
        assert_eq!(out.dtype(), dtype);
        Ok(())
    }

    #[test]
    fn inference_add_is_exact() -> Result<()> {
        let device = Device::Cpu;
        let residual = Residual::new(0.5, 3)?;
        residual.set_training(false);
        let branch = Tensor::full(0.2f32, (1, 1, 3), &device)?;
        let parent = Tensor::full(1.0f32, (1, 1, 3), &device)?;
        let out = residual.add(&branch, &parent, &PrecisionPolicy::default())?;
        let values = out.flatten_all()?.to_vec1::<f32>()?;
        assert!(values.iter().all(|v| (*v - 1.2).abs() < 1e-6));
        Ok(())
    }

    #[test]
    fn shape_mismatch_is_rejected() -> Result<()> {
        let device = Device::Cpu;
        let residual = Residual::new(0.0, 0)?;
        let branch = Tensor::zeros((1, 2, 3), DType::F32, &device)?;
        let parent = Tensor::zeros((1, 3, 3), DType::F32, &device)?;
        assert!(residual
            .add(&branch, &parent, &PrecisionPolicy::default())
            .is_err());
        Ok(())
    }
}
