//! Serializable model definitions.
//!
//! A definition file names the architecture with a `model` tag and carries
//! its hyperparameters alongside a storage `precision`:
//!
//! ```toml
//! model = "attention_forecaster"
//! precision = "f32"
//! n_time_series = 5
//! seq_len = 10
//! ```
//!
//! TOML and JSON are both accepted; the format is picked from the file
//! extension. Every hyperparameter except the input/output widths has a
//! default.

use std::{fmt, fs, path::Path, str::FromStr};

use candle_core::DType;
use embedding::TemporalEmbeddingKind;
use layers::activations::ActivationKind;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures while loading or validating a model definition.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse TOML config: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("failed to write TOML config: {0}")]
    TomlWrite(#[from] toml::ser::Error),
    #[error("failed to parse JSON config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported config format: {0}")]
    Format(String),
    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

impl From<ConfigError> for candle_core::Error {
    fn from(err: ConfigError) -> Self {
        candle_core::Error::Msg(err.to_string())
    }
}

/// Storage precision for model parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    #[default]
    F32,
    F16,
    Bf16,
}

impl Precision {
    pub fn dtype(self) -> DType {
        match self {
            Precision::F32 => DType::F32,
            Precision::F16 => DType::F16,
            Precision::Bf16 => DType::BF16,
        }
    }
}

/// Attention kernel used by the Informer encoder and decoder self-attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttentionKind {
    /// ProbSparse attention.
    #[default]
    Prob,
    /// Exact scaled dot-product attention.
    Full,
}

impl fmt::Display for AttentionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttentionKind::Prob => f.write_str("prob"),
            AttentionKind::Full => f.write_str("full"),
        }
    }
}

impl FromStr for AttentionKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "prob" => Ok(AttentionKind::Prob),
            "full" => Ok(AttentionKind::Full),
            other => Err(ConfigError::Invalid(vec![format!(
                "unknown attention kind `{other}`"
            )])),
        }
    }
}

/// Hyperparameters of [`crate::AttentionForecaster`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecasterConfig {
    /// Number of input series `M`.
    pub n_time_series: usize,
    #[serde(default = "default_seq_len")]
    pub seq_len: usize,
    /// Forecast length; `None` keeps the input length.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_seq_len: Option<usize>,
    #[serde(default = "default_forecaster_d_model")]
    pub d_model: usize,
    #[serde(default = "default_n_heads")]
    pub n_heads: usize,
    #[serde(default = "default_forecaster_dropout")]
    pub dropout: f32,
    #[serde(default = "default_output_dim")]
    pub output_dim: usize,
    /// Activation applied after the sequence remap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_activation: Option<ActivationKind>,
    #[serde(default)]
    pub seed: u64,
}

impl ForecasterConfig {
    pub fn new(n_time_series: usize) -> Self {
        Self {
            n_time_series,
            seq_len: default_seq_len(),
            output_seq_len: None,
            d_model: default_forecaster_d_model(),
            n_heads: default_n_heads(),
            dropout: default_forecaster_dropout(),
            output_dim: default_output_dim(),
            final_activation: None,
            seed: 0,
        }
    }

    /// Checks every constraint and reports all violations together.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        positive(&mut errors, "n_time_series", self.n_time_series);
        positive(&mut errors, "seq_len", self.seq_len);
        positive(&mut errors, "d_model", self.d_model);
        positive(&mut errors, "n_heads", self.n_heads);
        positive(&mut errors, "output_dim", self.output_dim);
        if let Some(len) = self.output_seq_len {
            positive(&mut errors, "output_seq_len", len);
        }
        divisible(&mut errors, self.d_model, self.n_heads);
        probability(&mut errors, "dropout", self.dropout);
        if let Some(kind) = self.final_activation {
            if !kind.is_bounded() {
                errors.push(format!("final_activation `{kind}` is not a bounded activation"));
            }
        }
        finish(errors)
    }
}

/// Hyperparameters of [`crate::Informer`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InformerConfig {
    /// Encoder input series.
    pub enc_in: usize,
    /// Decoder input series.
    pub dec_in: usize,
    /// Output series.
    pub c_out: usize,
    pub seq_len: usize,
    /// Known steps at the start of the decoder input.
    pub label_len: usize,
    /// Forecast horizon.
    pub out_len: usize,
    #[serde(default = "default_factor")]
    pub factor: usize,
    #[serde(default = "default_informer_d_model")]
    pub d_model: usize,
    #[serde(default = "default_n_heads")]
    pub n_heads: usize,
    #[serde(default = "default_e_layers")]
    pub e_layers: usize,
    #[serde(default = "default_d_layers")]
    pub d_layers: usize,
    #[serde(default = "default_informer_d_model")]
    pub d_ff: usize,
    #[serde(default)]
    pub dropout: f32,
    #[serde(default)]
    pub attn: AttentionKind,
    #[serde(default)]
    pub embed: TemporalEmbeddingKind,
    /// Calendar columns read from the covariate tensors.
    #[serde(default = "default_temp_depth")]
    pub temp_depth: usize,
    #[serde(default = "default_activation")]
    pub activation: ActivationKind,
    #[serde(default)]
    pub output_attention: bool,
    #[serde(default = "default_true")]
    pub distil: bool,
    #[serde(default = "default_true")]
    pub mix: bool,
    #[serde(default)]
    pub seed: u64,
}

impl InformerConfig {
    pub fn new(
        enc_in: usize,
        dec_in: usize,
        c_out: usize,
        seq_len: usize,
        label_len: usize,
        out_len: usize,
    ) -> Self {
        Self {
            enc_in,
            dec_in,
            c_out,
            seq_len,
            label_len,
            out_len,
            factor: default_factor(),
            d_model: default_informer_d_model(),
            n_heads: default_n_heads(),
            e_layers: default_e_layers(),
            d_layers: default_d_layers(),
            d_ff: default_informer_d_model(),
            dropout: 0.0,
            attn: AttentionKind::Prob,
            embed: TemporalEmbeddingKind::Fixed,
            temp_depth: default_temp_depth(),
            activation: default_activation(),
            output_attention: false,
            distil: true,
            mix: true,
            seed: 0,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        positive(&mut errors, "enc_in", self.enc_in);
        positive(&mut errors, "dec_in", self.dec_in);
        positive(&mut errors, "c_out", self.c_out);
        positive(&mut errors, "seq_len", self.seq_len);
        positive(&mut errors, "out_len", self.out_len);
        positive(&mut errors, "factor", self.factor);
        positive(&mut errors, "d_model", self.d_model);
        positive(&mut errors, "n_heads", self.n_heads);
        positive(&mut errors, "e_layers", self.e_layers);
        positive(&mut errors, "d_layers", self.d_layers);
        positive(&mut errors, "d_ff", self.d_ff);
        divisible(&mut errors, self.d_model, self.n_heads);
        probability(&mut errors, "dropout", self.dropout);
        if !(1..=5).contains(&self.temp_depth) {
            errors.push(format!(
                "temp_depth must be between 1 and 5, got {}",
                self.temp_depth
            ));
        }
        finish(errors)
    }

    /// Length of the decoder input, `label_len + out_len`.
    pub fn decoder_len(&self) -> usize {
        self.label_len + self.out_len
    }
}

/// Architecture selected by a definition file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum ModelKind {
    AttentionForecaster(ForecasterConfig),
    Informer(InformerConfig),
}

impl ModelKind {
    pub fn name(&self) -> &'static str {
        match self {
            ModelKind::AttentionForecaster(_) => "attention_forecaster",
            ModelKind::Informer(_) => "informer",
        }
    }
}

/// Top-level contents of a model definition file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDefinition {
    #[serde(flatten)]
    pub model: ModelKind,
    #[serde(default)]
    pub precision: Precision,
}

impl ModelDefinition {
    pub fn new(model: ModelKind) -> Self {
        Self {
            model,
            precision: Precision::default(),
        }
    }

    /// Loads and validates a TOML or JSON definition.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let definition: ModelDefinition = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(ConfigError::Format(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };
        definition.validate()?;
        Ok(definition)
    }

    /// Writes the definition, choosing the format from the extension.
    pub fn to_path(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let contents = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::to_string_pretty(self)?,
            Some("toml") | Some("tml") | None => toml::to_string(self)?,
            Some(other) => {
                return Err(ConfigError::Format(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };
        fs::write(path, contents)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match &self.model {
            ModelKind::AttentionForecaster(config) => config.validate(),
            ModelKind::Informer(config) => config.validate(),
        }
    }

    pub fn dtype(&self) -> DType {
        self.precision.dtype()
    }
}

fn positive(errors: &mut Vec<String>, name: &str, value: usize) {
    if value == 0 {
        errors.push(format!("{name} must be greater than zero"));
    }
}

fn divisible(errors: &mut Vec<String>, d_model: usize, n_heads: usize) {
    if n_heads > 0 && d_model % n_heads != 0 {
        errors.push(format!(
            "d_model ({d_model}) must be divisible by n_heads ({n_heads})"
        ));
    }
}

fn probability(errors: &mut Vec<String>, name: &str, value: f32) {
    if !(0.0..1.0).contains(&value) {
        errors.push(format!("{name} must be in [0, 1), got {value}"));
    }
}

fn finish(errors: Vec<String>) -> Result<(), ConfigError> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::Invalid(errors))
    }
}

fn default_seq_len() -> usize {
    10
}

fn default_forecaster_d_model() -> usize {
    128
}

fn default_n_heads() -> usize {
    8
}

fn default_forecaster_dropout() -> f32 {
    0.1
}

fn default_output_dim() -> usize {
    1
}

fn default_factor() -> usize {
    5
}

fn default_informer_d_model() -> usize {
    512
}

fn default_e_layers() -> usize {
    3
}

fn default_d_layers() -> usize {
    2
}

fn default_temp_depth() -> usize {
    4
}

fn default_activation() -> ActivationKind {
    ActivationKind::Gelu
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forecaster_defaults() {
        let config = ForecasterConfig::new(5);
        assert_eq!(config.seq_len, 10);
        assert_eq!(config.d_model, 128);
        assert_eq!(config.n_heads, 8);
        assert_eq!(config.output_dim, 1);
        assert!(config.output_seq_len.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validation_reports_every_problem() {
        let config = ForecasterConfig {
            d_model: 10,
            n_heads: 3,
            dropout: 1.5,
            final_activation: Some(ActivationKind::Identity),
            ..ForecasterConfig::new(0)
        };
        match config.validate() {
            Err(ConfigError::Invalid(errors)) => {
                assert_eq!(errors.len(), 4, "{errors:?}");
                assert!(errors.iter().any(|e| e.contains("divisible")));
            }
            other => panic!("expected validation failure, got {other:?}"),
        }
    }

    #[test]
    fn swish_and_gelu_are_accepted_as_final_activation() -> Result<(), ConfigError> {
        for name in ["swish", "gelu", "relu", "sigmoid"] {
            let source = format!(
                "n_time_series = 3\noutput_seq_len = 4\nfinal_activation = \"{name}\"\n"
            );
            let config: ForecasterConfig = toml::from_str(&source)?;
            assert!(config.final_activation.is_some());
            config.validate()?;
        }
        Ok(())
    }

    #[test]
    fn informer_defaults_follow_reference_setup() {
        let config = InformerConfig::new(3, 3, 3, 20, 20, 20);
        assert_eq!(config.factor, 5);
        assert_eq!(config.d_model, 512);
        assert_eq!(config.e_layers, 3);
        assert_eq!(config.d_layers, 2);
        assert_eq!(config.attn, AttentionKind::Prob);
        assert!(config.distil && config.mix && !config.output_attention);
        assert_eq!(config.decoder_len(), 40);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn tagged_toml_selects_architecture() -> Result<(), ConfigError> {
        let source = r#"
            model = "informer"
            precision = "bf16"
            enc_in = 7
            dec_in = 7
            c_out = 1
            seq_len = 96
            label_len = 48
            out_len = 24
            attn = "full"
            embed = "learned"
        "#;
        let definition: ModelDefinition = toml::from_str(source)?;
        assert_eq!(definition.dtype(), DType::BF16);
        match definition.model {
            ModelKind::Informer(config) => {
                assert_eq!(config.attn, AttentionKind::Full);
                assert_eq!(config.embed, TemporalEmbeddingKind::Learned);
                assert_eq!(config.n_heads, 8);
            }
            other => panic!("unexpected model {}", other.name()),
        }
        Ok(())
    }

    #[test]
    fn attention_kind_parses_case_insensitively() {
        assert_eq!("PROB".parse::<AttentionKind>().ok(), Some(AttentionKind::Prob));
        assert!("sparse".parse::<AttentionKind>().is_err());
    }
}
