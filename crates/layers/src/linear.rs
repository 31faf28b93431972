//! Linear and affine projection helpers.
//!
//! A [`Linear`] maps the trailing axis of its input from `input_dim` to
//! `output_dim`; every leading axis is treated as a batch axis, so the same
//! layer serves `(batch, seq, features)`, `(seq, batch, features)` and
//! `(batch, channels, time)` layouts alike. Weights are stored as
//! `(output_dim, input_dim)` and cast to [`PrecisionPolicy::compute`] for the
//! matmul. Initialisation policies mirror the usual recipes (Glorot, Kaiming
//! and the uniform fan-in default used by most deep-learning frameworks).

use candle_core::{DType, Device, Error, Result, Shape, Tensor};

use crate::{checks, dtypes::PrecisionPolicy};

/// Configuration shared by dense projection layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearConfig {
    /// Incoming feature dimension.
    pub input_dim: usize,
    /// Output feature dimension.
    pub output_dim: usize,
    /// Whether a learnable bias vector is applied.
    pub bias: bool,
}

impl LinearConfig {
    /// Creates a configuration for a biased projection.
    pub fn new(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            output_dim,
            bias: true,
        }
    }

    /// Same projection without a bias term.
    pub fn without_bias(input_dim: usize, output_dim: usize) -> Self {
        Self {
            bias: false,
            ..Self::new(input_dim, output_dim)
        }
    }

    /// Number of trainable scalars held by the layer.
    pub fn num_parameters(&self) -> usize {
        let bias = if self.bias { self.output_dim } else { 0 };
        self.input_dim * self.output_dim + bias
    }
}

/// Shared interface for affine projections.
pub trait LinearLayer: Send + Sync {
    /// Returns the static configuration used to validate inputs.
    fn config(&self) -> &LinearConfig;

    /// Applies the projection over the trailing axis.
    fn forward(&self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor>;
}

/// Supported weight initialisation policies.
#[derive(Debug, Clone, PartialEq)]
pub enum LinearInit {
    /// `U(-1/sqrt(fan_in), 1/sqrt(fan_in))` for weights and bias.
    FanInUniform,
    /// Xavier/Glorot uniform initialisation, zero bias.
    XavierUniform,
    /// Xavier/Glorot normal initialisation, zero bias.
    XavierNormal,
    /// Kaiming/He uniform initialisation, zero bias.
    KaimingUniform { negative_slope: f64 },
    /// Kaiming/He normal initialisation (fan-in mode), zero bias.
    KaimingNormal { negative_slope: f64 },
}

impl LinearInit {
    /// Samples a weight tensor of `shape` given the fan-in/fan-out of the layer.
    ///
    /// Convolutions pass `in_channels * kernel_size` as `fan_in`.
    pub fn sample_weight(
        &self,
        shape: impl Into<Shape>,
        fan_in: usize,
        fan_out: usize,
        device: &Device,
        dtype: DType,
    ) -> Result<Tensor> {
        let shape = shape.into();
        let (fan_in, fan_out) = (fan_in.max(1) as f64, fan_out.max(1) as f64);
        let weight = match self {
            LinearInit::FanInUniform => {
                let bound = 1.0 / fan_in.sqrt();
                Tensor::rand(-bound as f32, bound as f32, shape, device)?
            }
            LinearInit::XavierUniform => {
                let bound = (6.0 / (fan_in + fan_out)).sqrt();
                Tensor::rand(-bound as f32, bound as f32, shape, device)?
            }
            LinearInit::XavierNormal => {
                let std = (2.0 / (fan_in + fan_out)).sqrt();
                Tensor::randn(0f32, std as f32, shape, device)?
            }
            LinearInit::KaimingUniform { negative_slope } => {
                let gain = (2.0 / (1.0 + negative_slope.powi(2))).sqrt();
                let bound = 3f64.sqrt() * gain / fan_in.sqrt();
                Tensor::rand(-bound as f32, bound as f32, shape, device)?
            }
            LinearInit::KaimingNormal { negative_slope } => {
                let gain = (2.0 / (1.0 + negative_slope.powi(2))).sqrt();
                let std = gain / fan_in.sqrt();
                Tensor::randn(0f32, std as f32, shape, device)?
            }
        };
        weight.to_dtype(dtype)
    }

    /// Samples the bias vector matching this policy.
    pub fn sample_bias(
        &self,
        size: usize,
        fan_in: usize,
        device: &Device,
        dtype: DType,
    ) -> Result<Tensor> {
        match self {
            LinearInit::FanInUniform => {
                let bound = 1.0 / (fan_in.max(1) as f64).sqrt();
                Tensor::rand(-bound as f32, bound as f32, size, device)?.to_dtype(dtype)
            }
            _ => Tensor::zeros(size, dtype, device),
        }
    }
}

/// Dense affine projection with optional bias and mixed-precision aware forward pass.
#[derive(Debug, Clone)]
pub struct Linear {
    config: LinearConfig,
    weight: Tensor,
    bias: Option<Tensor>,
}

impl Linear {
    /// Constructs a linear layer from pre-existing parameters.
    pub fn new(config: LinearConfig, weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        Self::validate_weight(&config, &weight)?;
        Self::validate_bias(&config, bias.as_ref())?;
        Ok(Self {
            config,
            weight,
            bias,
        })
    }

    /// Builds a linear layer with randomly initialised parameters following `init`.
    pub fn with_init(
        config: LinearConfig,
        init: &LinearInit,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let weight = init.sample_weight(
            (config.output_dim, config.input_dim),
            config.input_dim,
            config.output_dim,
            device,
            dtype,
        )?;
        let bias = if config.bias {
            Some(init.sample_bias(config.output_dim, config.input_dim, device, dtype)?)
        } else {
            None
        };
        Self::new(config, weight, bias)
    }

    /// Returns a clone of the weight tensor shaped `(output_dim, input_dim)`.
    pub fn weight(&self) -> Tensor {
        self.weight.clone()
    }

    /// Returns a clone of the bias tensor if present.
    pub fn bias(&self) -> Option<Tensor> {
        self.bias.clone()
    }

    /// Number of trainable scalars.
    pub fn num_parameters(&self) -> usize {
        self.config.num_parameters()
    }

    /// Replaces the weight after validating shape, casting to the stored dtype.
    pub fn copy_weight_from(&mut self, value: &Tensor) -> Result<()> {
        Self::validate_weight(&self.config, value)?;
        self.weight = value.to_dtype(self.weight.dtype())?;
        Ok(())
    }

    /// Replaces the bias after validating shape.
    pub fn copy_bias_from(&mut self, value: &Tensor) -> Result<()> {
        let dtype = match &self.bias {
            Some(existing) => existing.dtype(),
            None => return Err(Error::Msg("layer has no bias to copy into".into())),
        };
        Self::validate_bias(&self.config, Some(value))?;
        self.bias = Some(value.to_dtype(dtype)?);
        Ok(())
    }

    fn validate_weight(config: &LinearConfig, weight: &Tensor) -> Result<()> {
        checks::expect_shape(
            "linear.weight",
            weight,
            &[config.output_dim, config.input_dim],
        )?;
        checks::expect_dtype_in("linear.weight", weight, checks::FLOAT_DTYPES)
    }

    fn validate_bias(config: &LinearConfig, bias: Option<&Tensor>) -> Result<()> {
        match (config.bias, bias) {
            (true, Some(tensor)) => {
                checks::expect_shape("linear.bias", tensor, &[config.output_dim])?;
                checks::expect_dtype_in("linear.bias", tensor, checks::FLOAT_DTYPES)
            }
            (false, Some(_)) => Err(Error::Msg("bias provided but config disables bias".into())),
            (true, None) => Err(Error::Msg("config expects bias but none supplied".into())),
            (false, None) => Ok(()),
        }
    }

    fn validate_input(&self, input: &Tensor) -> Result<()> {
        if input.rank() < 2 {
            return Err(Error::Msg(format!(
                "linear expects input shaped [.., {}] with rank >= 2, got {:?}",
                self.config.input_dim,
                input.dims()
            )));
        }
        checks::expect_last_dim("linear.input", input, self.config.input_dim)?;
        if input.elem_count() == 0 {
            return Err(Error::Msg("linear input must not be empty".into()));
        }
        Ok(())
    }
}

impl LinearLayer for Linear {
    fn config(&self) -> &LinearConfig {
        &self.config
    }

    fn forward(&self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        self.validate_input(input)?;

        let mut out_dims = input.dims().to_vec();
        let rows = input.elem_count() / self.config.input_dim;
        if let Some(last) = out_dims.last_mut() {
            *last = self.config.output_dim;
        }

        let flat = policy
            .cast_for_matmul(input)?
            .reshape((rows, self.config.input_dim))?;
        let weight = policy.cast_for_matmul(&self.weight)?;
        let mut output = flat.matmul(&weight.t()?)?;

        if let Some(bias) = &self.bias {
            output = output.broadcast_add(&policy.cast_for_matmul(bias)?)?;
        }

        policy.cast_to_storage(&output.reshape(out_dims)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn reference_linear(input: &Tensor, weight: &Tensor, bias: &Tensor) -> Result<Tensor> {
        let (batch, seq, hidden) = input.dims3()?;
        input
            .reshape((batch * seq, hidden))?
            .matmul(&weight.t()?)?
            .broadcast_add(bias)?
            .reshape((batch, seq, weight.dims()[0]))
    }

    fn std_dev(tensor: &Tensor) -> Result<f64> {
        let values = tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let n = values.len() as f64;
        let mean = values.iter().map(|v| f64::from(*v)).sum::<f64>() / n;
        let var = values
            .iter()
            .map(|v| (f64::from(*v) - mean).powi(2))
            .sum::<f64>()
            / n;
        Ok(var.sqrt())
    }

    #[test]
    fn forward_matches_reference_across_dtypes() -> Result<()> {
        let device = Device::Cpu;
        let config = LinearConfig::new(6, 4);
        let weight = Tensor::randn(0f32, 0.1, (4, 6), &device)?;
        let bias = Tensor::randn(0f32, 0.05, 4, &device)?;
        let input = Tensor::randn(0f32, 1.0, (2, 5, 6), &device)?;
        let reference = reference_linear(&input, &weight, &bias)?;

        for dtype in [DType::F32, DType::F16, DType::BF16] {
            let linear = Linear::new(
                config.clone(),
                weight.to_dtype(dtype)?,
                Some(bias.to_dtype(dtype)?),
            )?;
            let policy = PrecisionPolicy::from_parameter_dtype(dtype);
            let output = linear.forward(&input.to_dtype(dtype)?, &policy)?;
            assert_eq!(output.dims(), &[2, 5, 4]);
            assert_eq!(output.dtype(), dtype);

            let diff = output
                .to_dtype(DType::F32)?
                .sub(&reference)?
                .abs()?
                .max_all()?
                .to_vec0::<f32>()?;
            let tol = match dtype {
                DType::F16 => 1e-2,
                DType::BF16 => 3e-2,
                _ => 1e-5,
            };
            assert!(diff <= tol, "max diff {diff} for {dtype:?}");
        }
        Ok(())
    }

    #[test]
    fn projects_trailing_axis_of_permuted_input() -> Result<()> {
        let device = Device::Cpu;
        let linear = Linear::with_init(
            LinearConfig::new(10, 15),
            &LinearInit::FanInUniform,
            &device,
            DType::F32,
        )?;
        // (batch, time, channels) viewed as (batch, channels, time)
        let input = Tensor::randn(0f32, 1.0, (2, 10, 3), &device)?.permute((0, 2, 1))?;
        let output = linear.forward(&input, &PrecisionPolicy::default())?;
        assert_eq!(output.dims(), &[2, 3, 15]);
        Ok(())
    }

    #[test]
    fn rejects_mismatched_feature_axis() -> Result<()> {
        let device = Device::Cpu;
        let linear = Linear::with_init(
            LinearConfig::new(5, 8),
            &LinearInit::XavierUniform,
            &device,
            DType::F32,
        )?;
        let input = Tensor::zeros((2, 10, 4), DType::F32, &device)?;
        let err = linear
            .forward(&input, &PrecisionPolicy::default())
            .unwrap_err();
        assert!(err.to_string().contains("expected last dim 5"));
        Ok(())
    }

    #[test]
    fn xavier_normal_stats_are_reasonable() -> Result<()> {
        let device = Device::Cpu;
        let linear = Linear::with_init(
            LinearConfig::new(128, 64),
            &LinearInit::XavierNormal,
            &device,
            DType::F32,
        )?;
        let expected = (2.0f64 / (128.0 + 64.0)).sqrt();
        let std = std_dev(&linear.weight())?;
        assert!((std - expected).abs() < expected * 0.25);
        let bias = linear.bias().unwrap().abs()?.max_all()?.to_vec0::<f32>()?;
        assert_eq!(bias, 0.0);
        Ok(())
    }

    #[test]
    fn fan_in_uniform_bounds_weights_and_bias() -> Result<()> {
        let device = Device::Cpu;
        let linear = Linear::with_init(
            LinearConfig::new(16, 32),
            &LinearInit::FanInUniform,
            &device,
            DType::F32,
        )?;
        let bound = 0.25f32 + 1e-6;
        let max_w = linear.weight().abs()?.max_all()?.to_vec0::<f32>()?;
        let max_b = linear.bias().unwrap().abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(max_w <= bound);
        assert!(max_b <= bound);
        Ok(())
    }

    #[test]
    fn copied_weights_drive_forward() -> Result<()> {
        let device = Device::Cpu;
        let mut linear = Linear::with_init(
            LinearConfig::without_bias(3, 2),
            &LinearInit::XavierUniform,
            &device,
            DType::F32,
        )?;
        linear.copy_weight_from(&Tensor::ones((2, 3), DType::F32, &device)?)?;
        assert!(linear.copy_bias_from(&Tensor::zeros(2, DType::F32, &device)?).is_err());

        let input = Tensor::from_vec(vec![1f32, 2., 3.], (1, 3), &device)?;
        let output = linear.forward(&input, &PrecisionPolicy::default())?;
        assert_eq!(output.to_vec2::<f32>()?, vec![vec![6.0, 6.0]]);
        Ok(())
    }
}
