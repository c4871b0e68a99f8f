//! Score normalizers
//!
//! A normalizer maps raw, metric-specific scores onto a comparable [0, 1]
//! scale. It starts unfitted; [`Normalizer::fit`] returns a new fitted
//! instance and never mutates the receiver. Every fitted model is monotonic
//! non-decreasing, so a single metric ranks identically before and after
//! normalization.

use crate::loess;
use crate::{Error, Result, Slot};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NormalizerType {
    #[default]
    Identity,
    Percentile,
    Loess,
}

impl FromStr for NormalizerType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "identity" => Ok(NormalizerType::Identity),
            "percentile" => Ok(NormalizerType::Percentile),
            "loess" => Ok(NormalizerType::Loess),
            other => Err(Error::config(format!("unknown normalizer type '{}'", other))),
        }
    }
}

impl std::fmt::Display for NormalizerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NormalizerType::Identity => "identity",
            NormalizerType::Percentile => "percentile",
            NormalizerType::Loess => "loess",
        };
        f.write_str(name)
    }
}

/// How the percentile normalizer treats the sample boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PercentileConvention {
    /// `(#{s <= x} - 1) / (n - 1)`: a unique sample minimum maps to 0.0 and
    /// the maximum to 1.0
    #[default]
    Rank,
    /// `#{s <= x} / n`: the empirical CDF of the sample
    Fraction,
}

/// Fitted parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum NormalizerModel {
    Identity,
    Percentile {
        sorted: Vec<f32>,
        convention: PercentileConvention,
    },
    Loess {
        knots_x: Vec<f64>,
        knots_y: Vec<f64>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Normalizer {
    kind: NormalizerType,
    #[serde(default)]
    convention: PercentileConvention,
    model: Option<NormalizerModel>,
}

/// Live, swappable normalizer for one metric
pub type NormalizerSlot = Slot<Normalizer>;

impl Normalizer {
    /// Unfitted normalizer of the given type
    #[must_use]
    pub fn new(kind: NormalizerType) -> Self {
        Self {
            kind,
            convention: PercentileConvention::default(),
            model: None,
        }
    }

    #[must_use]
    pub fn with_convention(mut self, convention: PercentileConvention) -> Self {
        self.convention = convention;
        self
    }

    /// Fitted identity normalizer; needs no sample
    #[must_use]
    pub fn identity() -> Self {
        Self {
            kind: NormalizerType::Identity,
            convention: PercentileConvention::default(),
            model: Some(NormalizerModel::Identity),
        }
    }

    #[inline]
    pub fn kind(&self) -> NormalizerType {
        self.kind
    }

    #[inline]
    pub fn convention(&self) -> PercentileConvention {
        self.convention
    }

    #[inline]
    pub fn is_fitted(&self) -> bool {
        self.model.is_some()
    }

    pub fn model(&self) -> Option<&NormalizerModel> {
        self.model.as_ref()
    }

    /// Fit a new normalizer of the same type and convention from raw scores
    ///
    /// Non-finite scores are ignored; a sample with no finite score is an error.
    pub fn fit(&self, sample: &[f32]) -> Result<Normalizer> {
        let mut sorted: Vec<f32> = sample.iter().copied().filter(|s| s.is_finite()).collect();
        if sorted.is_empty() {
            return Err(Error::Normalization(format!(
                "cannot fit {} normalizer on an empty sample",
                self.kind
            )));
        }
        sorted.sort_by(f32::total_cmp);

        let model = match self.kind {
            NormalizerType::Identity => NormalizerModel::Identity,
            NormalizerType::Percentile => NormalizerModel::Percentile {
                sorted,
                convention: self.convention,
            },
            NormalizerType::Loess => {
                let (knots_x, knots_y) = loess::fit_knots(
                    &sorted,
                    loess::DEFAULT_BANDWIDTH,
                    loess::DEFAULT_ROBUSTNESS_ITERS,
                );
                NormalizerModel::Loess { knots_x, knots_y }
            }
        };

        Ok(Normalizer {
            kind: self.kind,
            convention: self.convention,
            model: Some(model),
        })
    }

    pub fn normalize(&self, raw: f32) -> Result<f32> {
        let model = self
            .model
            .as_ref()
            .ok_or_else(|| Error::NotFitted(format!("{} normalizer", self.kind)))?;

        Ok(model.apply(raw))
    }
}

impl NormalizerModel {
    /// Map a raw score through the fitted model
    pub fn apply(&self, raw: f32) -> f32 {
        match self {
            NormalizerModel::Identity => raw,
            NormalizerModel::Percentile { sorted, convention } => percentile(sorted, *convention, raw),
            NormalizerModel::Loess { knots_x, knots_y } => {
                loess::evaluate(knots_x, knots_y, f64::from(raw)) as f32
            }
        }
    }
}

fn percentile(sorted: &[f32], convention: PercentileConvention, raw: f32) -> f32 {
    let n = sorted.len();
    let at_or_below = sorted.partition_point(|&s| s <= raw);
    match convention {
        PercentileConvention::Fraction => at_or_below as f32 / n as f32,
        PercentileConvention::Rank if n == 1 => {
            if at_or_below == 1 { 1.0 } else { 0.0 }
        }
        PercentileConvention::Rank => {
            let rank = at_or_below.saturating_sub(1) as f32;
            (rank / (n - 1) as f32).clamp(0.0, 1.0)
        }
    }
}
