//! Calendar covariate embeddings.
//!
//! Covariates arrive as `(batch, seq, n_fields)` floats whose columns are, in
//! order, month, day, weekday, hour and minute bucket. Values are truncated to
//! integers and looked up in one table per field; the first `depth` fields
//! are used and their embeddings summed. Tables are either fixed sinusoids or
//! learnable `N(0, 1)` matrices.

use std::{fmt, str::FromStr};

use candle_core::{bail, DType, Device, Error, Result, Tensor};
use layers::dtypes::PrecisionPolicy;
use serde::{Deserialize, Serialize};

use crate::positional::sinusoid_table;

/// One calendar field and its vocabulary size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TemporalFeature {
    Month,
    Day,
    Weekday,
    Hour,
    Minute,
}

impl TemporalFeature {
    /// Fields in column order.
    pub const ALL: [TemporalFeature; 5] = [
        TemporalFeature::Month,
        TemporalFeature::Day,
        TemporalFeature::Weekday,
        TemporalFeature::Hour,
        TemporalFeature::Minute,
    ];

    /// Number of distinct values, i.e. rows of the lookup table.
    pub fn cardinality(self) -> usize {
        match self {
            TemporalFeature::Month => 13,
            TemporalFeature::Day => 32,
            TemporalFeature::Weekday => 7,
            TemporalFeature::Hour => 24,
            TemporalFeature::Minute => 4,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TemporalFeature::Month => "month",
            TemporalFeature::Day => "day",
            TemporalFeature::Weekday => "weekday",
            TemporalFeature::Hour => "hour",
            TemporalFeature::Minute => "minute",
        }
    }
}

/// How calendar tables are produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemporalEmbeddingKind {
    /// Non-trainable sinusoid tables.
    #[default]
    Fixed,
    /// Trainable tables drawn from `N(0, 1)`.
    Learned,
}

impl fmt::Display for TemporalEmbeddingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TemporalEmbeddingKind::Fixed => f.write_str("fixed"),
            TemporalEmbeddingKind::Learned => f.write_str("learned"),
        }
    }
}

impl FromStr for TemporalEmbeddingKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(TemporalEmbeddingKind::Fixed),
            "learned" | "learnable" => Ok(TemporalEmbeddingKind::Learned),
            other => Err(Error::Msg(format!("unknown temporal embedding `{other}`"))),
        }
    }
}

/// Sum of per-field calendar embeddings.
#[derive(Debug, Clone)]
pub struct TemporalEmbedding {
    kind: TemporalEmbeddingKind,
    d_model: usize,
    tables: Vec<(TemporalFeature, Tensor)>,
}

impl TemporalEmbedding {
    /// Uses the first `depth` fields (1 to 5).
    pub fn new(
        d_model: usize,
        depth: usize,
        kind: TemporalEmbeddingKind,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        if depth == 0 || depth > TemporalFeature::ALL.len() {
            bail!(
                "temporal depth must be between 1 and {}, got {depth}",
                TemporalFeature::ALL.len()
            );
        }
        let tables = TemporalFeature::ALL[..depth]
            .iter()
            .map(|&feature| {
                let rows = feature.cardinality();
                let table = match kind {
                    TemporalEmbeddingKind::Fixed => sinusoid_table(rows, d_model, device)?,
                    TemporalEmbeddingKind::Learned => {
                        Tensor::randn(0f32, 1.0, (rows, d_model), device)?
                    }
                };
                Ok((feature, table.to_dtype(dtype)?))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            kind,
            d_model,
            tables,
        })
    }

    pub fn kind(&self) -> TemporalEmbeddingKind {
        self.kind
    }

    pub fn depth(&self) -> usize {
        self.tables.len()
    }

    /// Trainable scalars; fixed tables contribute nothing.
    pub fn num_parameters(&self) -> usize {
        match self.kind {
            TemporalEmbeddingKind::Fixed => 0,
            TemporalEmbeddingKind::Learned => self
                .tables
                .iter()
                .map(|(feature, _)| feature.cardinality() * self.d_model)
                .sum(),
        }
    }

    /// Embeds `(batch, seq, n_fields)` covariates into `(batch, seq, d_model)`.
    pub fn forward(&self, x_mark: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let (batch, seq, fields) = x_mark.dims3().map_err(|_| {
            Error::Msg(format!(
                "temporal.input: expected (batch, seq, fields), got {:?}",
                x_mark.dims()
            ))
        })?;
        if fields < self.depth() {
            bail!(
                "temporal.input: {} calendar fields required, got {fields}",
                self.depth()
            );
        }

        let marks = x_mark.to_dtype(DType::F32)?.to_dtype(DType::I64)?;
        let mut total: Option<Tensor> = None;
        for (column, (feature, table)) in self.tables.iter().enumerate() {
            let ids = marks.narrow(2, column, 1)?.flatten_all()?;
            check_range(*feature, &ids)?;
            let embedded = policy
                .cast_for_matmul(&table.index_select(&ids, 0)?)?
                .reshape((batch, seq, self.d_model))?;
            total = Some(match total {
                Some(acc) => acc.add(&embedded)?,
                None => embedded,
            });
        }
        log::debug!(
            "temporal embedding batch={batch} seq={seq} features={}",
            self.tables.len()
        );
        match total {
            Some(sum) => policy.cast_to_storage(&sum),
            None => bail!("temporal embedding has no tables"),
        }
    }
}

fn check_range(feature: TemporalFeature, ids: &Tensor) -> Result<()> {
    if ids.elem_count() == 0 {
        return Ok(());
    }
    let min = ids.min_all()?.to_scalar::<i64>()?;
    let max = ids.max_all()?.to_scalar::<i64>()?;
    let limit = feature.cardinality() as i64;
    if min < 0 || max >= limit {
        bail!(
            "{} covariate out of range: values span [{min}, {max}], expected [0, {limit})",
            feature.name()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marks(rows: &[[f32; 4]]) -> Result<Tensor> {
        let flat: Vec<f32> = rows.iter().flatten().copied().collect();
        Tensor::from_vec(flat, (1, rows.len(), 4), &Device::Cpu)
    }

    #[test]
    fn fixed_tables_sum_field_sinusoids() -> Result<()> {
        let device = Device::Cpu;
        let embed = TemporalEmbedding::new(6, 4, TemporalEmbeddingKind::Fixed, &device, DType::F32)?;
        let x = marks(&[[3.0, 15.0, 2.0, 23.0]])?;
        let out = embed.forward(&x, &PrecisionPolicy::default())?;
        assert_eq!(out.dims(), &[1, 1, 6]);

        let mut expected = Tensor::zeros(6, DType::F32, &device)?;
        for (feature, idx) in TemporalFeature::ALL[..4].iter().zip([3usize, 15, 2, 23]) {
            let table = sinusoid_table(feature.cardinality(), 6, &device)?;
            expected = expected.add(&table.get(idx)?)?;
        }
        let diff = out.flatten_all()?.sub(&expected)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(diff < 1e-6);
        assert_eq!(embed.num_parameters(), 0);
        Ok(())
    }

    #[test]
    fn fractional_covariates_are_truncated() -> Result<()> {
        let device = Device::Cpu;
        let embed = TemporalEmbedding::new(4, 2, TemporalEmbeddingKind::Learned, &device, DType::F32)?;
        let policy = PrecisionPolicy::default();
        let a = embed.forward(&marks(&[[5.0, 9.0, 0.0, 0.0]])?, &policy)?;
        let b = embed.forward(&marks(&[[5.7, 9.2, 0.0, 0.0]])?, &policy)?;
        let diff = a.sub(&b)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert_eq!(diff, 0.0);
        assert_eq!(embed.num_parameters(), (13 + 32) * 4);
        Ok(())
    }

    #[test]
    fn out_of_range_covariates_are_rejected() -> Result<()> {
        let embed = TemporalEmbedding::new(4, 4, TemporalEmbeddingKind::Fixed, &Device::Cpu, DType::F32)?;
        let err = embed
            .forward(&marks(&[[1.0, 1.0, 7.0, 0.0]])?, &PrecisionPolicy::default())
            .unwrap_err();
        assert!(err.to_string().contains("weekday covariate out of range"));
        Ok(())
    }

    #[test]
    fn too_few_fields_is_an_error() -> Result<()> {
        let embed = TemporalEmbedding::new(4, 5, TemporalEmbeddingKind::Fixed, &Device::Cpu, DType::F32)?;
        assert!(embed
            .forward(&marks(&[[1.0, 1.0, 1.0, 1.0]])?, &PrecisionPolicy::default())
            .is_err());
        assert!(TemporalEmbedding::new(4, 6, TemporalEmbeddingKind::Fixed, &Device::Cpu, DType::F32).is_err());
        Ok(())
    }

    #[test]
    fn kind_parses_from_config_names() {
        assert_eq!("fixed".parse::<TemporalEmbeddingKind>().ok(), Some(TemporalEmbeddingKind::Fixed));
        assert_eq!("Learned".parse::<TemporalEmbeddingKind>().ok(), Some(TemporalEmbeddingKind::Learned));
        assert!("timef".parse::<TemporalEmbeddingKind>().is_err());
    }
}
