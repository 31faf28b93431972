//! Value (token) embedding for continuous series.
//!
//! Each time step's feature vector is mixed with its neighbours through a
//! circular convolution of width three, mapping `c_in` series to `d_model`
//! channels while keeping the sequence length.

use candle_core::{bail, DType, Device, Result, Tensor};
use layers::{
    checks,
    conv::{Conv1d, Conv1dConfig},
    dtypes::PrecisionPolicy,
    linear::LinearInit,
};

/// Kernel width of the value convolution.
pub const VALUE_KERNEL: usize = 3;

/// Circular convolution from `(batch, seq, c_in)` to `(batch, seq, d_model)`.
#[derive(Debug, Clone)]
pub struct ValueEmbedding {
    conv: Conv1d,
}

impl ValueEmbedding {
    /// Kaiming-normal (fan-in, leaky-ReLU gain) kernel initialisation.
    pub fn new(c_in: usize, d_model: usize, device: &Device, dtype: DType) -> Result<Self> {
        if c_in == 0 || d_model == 0 {
            bail!("value embedding needs c_in ({c_in}) and d_model ({d_model}) > 0");
        }
        let conv = Conv1d::with_init(
            Conv1dConfig::circular(c_in, d_model, VALUE_KERNEL),
            &LinearInit::KaimingNormal { negative_slope: 0.0 },
            device,
            dtype,
        )?;
        Ok(Self { conv })
    }

    pub fn conv(&self) -> &Conv1d {
        &self.conv
    }

    pub fn conv_mut(&mut self) -> &mut Conv1d {
        &mut self.conv
    }

    pub fn num_parameters(&self) -> usize {
        self.conv.num_parameters()
    }

    pub fn forward(&self, x: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_batch_seq_hidden("value_embedding.input", x, self.conv.config().in_channels)?;
        let channels_first = x.transpose(1, 2)?.contiguous()?;
        self.conv
            .forward(&channels_first, policy)?
            .transpose(1, 2)?
            .contiguous()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_series_to_model_width() -> Result<()> {
        let device = Device::Cpu;
        let embed = ValueEmbedding::new(3, 16, &device, DType::F32)?;
        let x = Tensor::randn(0f32, 1.0, (2, 20, 3), &device)?;
        let out = embed.forward(&x, &PrecisionPolicy::default())?;
        assert_eq!(out.dims(), &[2, 20, 16]);
        assert_eq!(embed.num_parameters(), 16 * 3 * 3 + 16);
        Ok(())
    }

    #[test]
    fn wraps_around_sequence_ends() -> Result<()> {
        let device = Device::Cpu;
        let mut embed = ValueEmbedding::new(1, 1, &device, DType::F32)?;
        // Only look at the previous step.
        let kernel = Tensor::from_vec(vec![1f32, 0., 0.], (1, 1, 3), &device)?;
        embed.conv_mut().copy_weight_from(&kernel)?;
        let x = Tensor::from_vec(vec![1f32, 2., 3.], (1, 3, 1), &device)?;
        let out = embed.forward(&x, &PrecisionPolicy::default())?;
        assert_eq!(out.flatten_all()?.to_vec1::<f32>()?, vec![3., 1., 2.]);
        Ok(())
    }
}
