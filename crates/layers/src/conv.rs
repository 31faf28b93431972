//! One-dimensional convolution and pooling over `(batch, channels, time)`.
//!
//! Convolutions run stride 1 with symmetric padding, either zero filled or
//! circular (the sequence wraps around so the first step sees the last one).
//! Kernels are stored as `(out_channels, in_channels, kernel_size)`.

use candle_core::{DType, Device, Error, Result, Tensor};

use crate::{checks, dtypes::PrecisionPolicy, linear::LinearInit};

/// How the time axis is padded before the kernel slides over it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PaddingMode {
    /// Pad with zeros.
    #[default]
    Zeros,
    /// Wrap the sequence around.
    Circular,
}

/// Shape and padding parameters for a [`Conv1d`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conv1dConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel_size: usize,
    /// Steps added on each side of the time axis.
    pub padding: usize,
    pub padding_mode: PaddingMode,
    pub bias: bool,
}

impl Conv1dConfig {
    /// Length-preserving circular convolution with an odd kernel.
    pub fn circular(in_channels: usize, out_channels: usize, kernel_size: usize) -> Self {
        Self {
            in_channels,
            out_channels,
            kernel_size,
            padding: kernel_size / 2,
            padding_mode: PaddingMode::Circular,
            bias: true,
        }
    }

    /// Number of trainable scalars.
    pub fn num_parameters(&self) -> usize {
        let bias = if self.bias { self.out_channels } else { 0 };
        self.out_channels * self.in_channels * self.kernel_size + bias
    }

    /// Output length for an input of `len` steps.
    pub fn output_len(&self, len: usize) -> Option<usize> {
        (len + 2 * self.padding).checked_sub(self.kernel_size).map(|n| n + 1)
    }
}

/// Learnable 1-D convolution.
#[derive(Debug, Clone)]
pub struct Conv1d {
    config: Conv1dConfig,
    weight: Tensor,
    bias: Option<Tensor>,
}

impl Conv1d {
    /// Samples parameters with `init`, using `in_channels * kernel_size` as fan-in.
    pub fn with_init(
        config: Conv1dConfig,
        init: &LinearInit,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        if config.in_channels == 0 || config.out_channels == 0 || config.kernel_size == 0 {
            return Err(Error::Msg(format!(
                "conv1d dimensions must be positive, got {config:?}"
            )));
        }
        let fan_in = config.in_channels * config.kernel_size;
        let fan_out = config.out_channels * config.kernel_size;
        let weight = init.sample_weight(
            (config.out_channels, config.in_channels, config.kernel_size),
            fan_in,
            fan_out,
            device,
            dtype,
        )?;
        let bias = if config.bias {
            Some(init.sample_bias(config.out_channels, fan_in, device, dtype)?)
        } else {
            None
        };
        Ok(Self {
            config,
            weight,
            bias,
        })
    }

    pub fn config(&self) -> &Conv1dConfig {
        &self.config
    }

    pub fn weight(&self) -> Tensor {
        self.weight.clone()
    }

    pub fn num_parameters(&self) -> usize {
        self.config.num_parameters()
    }

    /// Replaces the kernel after validating its shape.
    pub fn copy_weight_from(&mut self, value: &Tensor) -> Result<()> {
        checks::expect_shape(
            "conv1d.weight",
            value,
            &[
                self.config.out_channels,
                self.config.in_channels,
                self.config.kernel_size,
            ],
        )?;
        self.weight = value.to_dtype(self.weight.dtype())?;
        Ok(())
    }

    /// Convolves `(batch, in_channels, time)` into `(batch, out_channels, time')`.
    pub fn forward(&self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_rank("conv1d.input", input, 3)?;
        let (_, channels, len) = input.dims3()?;
        if channels != self.config.in_channels {
            return Err(Error::Msg(format!(
                "conv1d.input: expected {} channels, got shape {:?}",
                self.config.in_channels,
                input.dims()
            )));
        }
        if self.config.output_len(len).is_none() {
            return Err(Error::Msg(format!(
                "conv1d.input: sequence of {len} steps is shorter than kernel {}",
                self.config.kernel_size
            )));
        }

        let compute = policy.cast_for_matmul(input)?;
        let (padded, padding) = match self.config.padding_mode {
            PaddingMode::Circular => (circular_pad(&compute, self.config.padding)?, 0),
            PaddingMode::Zeros => (compute, self.config.padding),
        };
        let weight = policy.cast_for_matmul(&self.weight)?;
        let mut output = padded.contiguous()?.conv1d(&weight, padding, 1, 1, 1)?;
        if let Some(bias) = &self.bias {
            let bias = policy
                .cast_for_matmul(bias)?
                .reshape((1, self.config.out_channels, 1))?;
            output = output.broadcast_add(&bias)?;
        }
        policy.cast_to_storage(&output)
    }
}

/// Wraps `padding` steps of the time axis around both ends.
pub fn circular_pad(input: &Tensor, padding: usize) -> Result<Tensor> {
    if padding == 0 {
        return Ok(input.clone());
    }
    let len = input.dim(2)?;
    if padding > len {
        return Err(Error::Msg(format!(
            "circular padding {padding} exceeds sequence length {len}"
        )));
    }
    let head = input.narrow(2, len - padding, padding)?;
    let tail = input.narrow(2, 0, padding)?;
    Tensor::cat(&[&head, input, &tail], 2)
}

/// Max-pools the time axis of `(batch, channels, time)`; padded steps never win.
pub fn max_pool1d(input: &Tensor, kernel: usize, stride: usize, padding: usize) -> Result<Tensor> {
    checks::expect_rank("max_pool1d.input", input, 3)?;
    let (batch, channels, len) = input.dims3()?;
    if kernel == 0 || stride == 0 || padding * 2 > kernel {
        return Err(Error::Msg(format!(
            "max_pool1d: invalid kernel {kernel} / stride {stride} / padding {padding}"
        )));
    }
    if len + 2 * padding < kernel {
        return Err(Error::Msg(format!(
            "max_pool1d: sequence of {len} steps is shorter than kernel {kernel}"
        )));
    }
    let padded = if padding > 0 {
        let fill = Tensor::full(f32::NEG_INFINITY, (batch, channels, padding), input.device())?
            .to_dtype(input.dtype())?;
        Tensor::cat(&[&fill, input, &fill], 2)?
    } else {
        input.clone()
    };
    padded
        .unsqueeze(2)?
        .max_pool2d_with_stride((1, kernel), (1, stride))?
        .squeeze(2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn circular_pad_wraps_both_ends() -> Result<()> {
        let input = Tensor::from_vec(vec![1f32, 2., 3., 4.], (1, 1, 4), &Device::Cpu)?;
        let padded = circular_pad(&input, 1)?;
        assert_eq!(padded.flatten_all()?.to_vec1::<f32>()?, vec![4., 1., 2., 3., 4., 1.]);
        Ok(())
    }

    #[test]
    fn circular_conv_preserves_length_and_wraps() -> Result<()> {
        let device = Device::Cpu;
        let mut config = Conv1dConfig::circular(1, 1, 3);
        config.bias = false;
        let mut conv = Conv1d::with_init(config, &LinearInit::FanInUniform, &device, DType::F32)?;
        conv.copy_weight_from(&Tensor::ones((1, 1, 3), DType::F32, &device)?)?;

        let input = Tensor::from_vec(vec![1f32, 2., 3., 4.], (1, 1, 4), &device)?;
        let output = conv.forward(&input, &PrecisionPolicy::default())?;
        assert_eq!(output.dims(), &[1, 1, 4]);
        // Each step sums itself with its circular neighbours.
        assert_eq!(output.flatten_all()?.to_vec1::<f32>()?, vec![7., 6., 9., 8.]);
        Ok(())
    }

    #[test]
    fn zero_padding_differs_at_edges() -> Result<()> {
        let device = Device::Cpu;
        let config = Conv1dConfig {
            padding_mode: PaddingMode::Zeros,
            bias: false,
            ..Conv1dConfig::circular(1, 1, 3)
        };
        let mut conv = Conv1d::with_init(config, &LinearInit::FanInUniform, &device, DType::F32)?;
        conv.copy_weight_from(&Tensor::ones((1, 1, 3), DType::F32, &device)?)?;
        let input = Tensor::from_vec(vec![1f32, 2., 3., 4.], (1, 1, 4), &device)?;
        let output = conv.forward(&input, &PrecisionPolicy::default())?;
        assert_eq!(output.flatten_all()?.to_vec1::<f32>()?, vec![3., 6., 9., 7.]);
        Ok(())
    }

    #[test]
    fn conv_rejects_channel_mismatch() -> Result<()> {
        let device = Device::Cpu;
        let conv = Conv1d::with_init(
            Conv1dConfig::circular(3, 8, 3),
            &LinearInit::KaimingNormal { negative_slope: 0.01 },
            &device,
            DType::F32,
        )?;
        let input = Tensor::zeros((2, 4, 10), DType::F32, &device)?;
        assert!(conv.forward(&input, &PrecisionPolicy::default()).is_err());
        Ok(())
    }

    #[test]
    fn max_pool_halves_length() -> Result<()> {
        let device = Device::Cpu;
        for (len, expected) in [(20usize, 10usize), (10, 5), (5, 3), (1, 1)] {
            let input = Tensor::randn(0f32, 1.0, (2, 4, len), &device)?;
            let pooled = max_pool1d(&input, 3, 2, 1)?;
            assert_eq!(pooled.dims(), &[2, 4, expected], "len {len}");
        }
        Ok(())
    }

    #[test]
    fn max_pool_ignores_padding() -> Result<()> {
        let input = Tensor::from_vec(vec![-5f32, -3., -1., -2.], (1, 1, 4), &Device::Cpu)?;
        let pooled = max_pool1d(&input, 3, 2, 1)?;
        assert_eq!(pooled.flatten_all()?.to_vec1::<f32>()?, vec![-3., -1.]);
        Ok(())
    }
}
