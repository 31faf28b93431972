//! Precision policy shared by every layer.
//!
//! Forecasting parameters may be stored in `f16`/`bf16`, but projections,
//! activations and statistics (layer norm, batch norm, softmax) are evaluated
//! in at least `f32`. [`PrecisionPolicy`] centralises those casts so layers do
//! not each decide on their own.

use candle_core::{DType, Result, Tensor};

/// Describes how tensors are cast during the phases of a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrecisionPolicy {
    storage: DType,
    compute: DType,
}

impl PrecisionPolicy {
    /// Constructs a policy from explicit dtype selections.
    pub fn new(storage: DType, compute: DType) -> Self {
        Self { storage, compute }
    }

    /// Builds a policy from the parameter storage dtype, promoting half types.
    pub fn from_parameter_dtype(storage: DType) -> Self {
        let compute = match storage {
            DType::F16 | DType::BF16 => DType::F32,
            other => other,
        };
        Self::new(storage, compute)
    }

    /// Dtype used to store parameters and layer outputs.
    pub fn storage(&self) -> DType {
        self.storage
    }

    /// Dtype used for matmuls, activations and reductions.
    pub fn compute(&self) -> DType {
        self.compute
    }

    /// Whether storage and compute dtypes differ.
    pub fn is_mixed_precision(&self) -> bool {
        self.storage != self.compute
    }

    /// Casts a tensor to the compute dtype ahead of a matmul or activation.
    pub fn cast_for_matmul(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.compute)
    }

    /// Casts a tensor to the dtype used for statistics.
    pub fn cast_for_reduction(&self, tensor: &Tensor) -> Result<Tensor> {
        let reduction = match self.compute {
            DType::F64 => DType::F64,
            _ => DType::F32,
        };
        cast_tensor(tensor, reduction)
    }

    /// Casts a tensor back to the storage dtype.
    pub fn cast_to_storage(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.storage)
    }

    /// Comparison tolerance appropriate for values held in the storage dtype.
    pub fn storage_epsilon(&self) -> f32 {
        epsilon_for(self.storage)
    }
}

impl Default for PrecisionPolicy {
    fn default() -> Self {
        Self::from_parameter_dtype(DType::F32)
    }
}

fn cast_tensor(tensor: &Tensor, dtype: DType) -> Result<Tensor> {
    if tensor.dtype() == dtype {
        Ok(tensor.clone())
    } else {
        tensor.to_dtype(dtype)
    }
}

fn epsilon_for(dtype: DType) -> f32 {
    match dtype {
        DType::BF16 => 2e-2,
        DType::F16 => 5e-3,
        DType::F32 => 1e-5,
        DType::F64 => 1e-7,
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn half_storage_promotes_compute() {
        let policy = PrecisionPolicy::from_parameter_dtype(DType::BF16);
        assert_eq!(policy.storage(), DType::BF16);
        assert_eq!(policy.compute(), DType::F32);
        assert!(policy.is_mixed_precision());
        assert!(!PrecisionPolicy::default().is_mixed_precision());
    }

    #[test]
    fn storage_round_trip_stays_within_epsilon() -> Result<()> {
        let device = Device::Cpu;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F16);
        let levels = Tensor::from_vec(vec![0.25f32, -1.5, 4.0], (3,), &device)?;
        let stored = policy.cast_to_storage(&levels)?;
        assert_eq!(stored.dtype(), DType::F16);

        let restored = policy.cast_for_matmul(&stored)?.to_vec1::<f32>()?;
        for (orig, rest) in levels.to_vec1::<f32>()?.iter().zip(restored.iter()) {
            assert!((orig - rest).abs() <= policy.storage_epsilon());
        }
        Ok(())
    }
}
