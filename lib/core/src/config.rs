//! Engine configuration
//!
//! Loaded from a JSON file. Field names are snake_case; the camelCase
//! spellings (`metricName`, `maxResultMatrixCells`, ...) are accepted as
//! aliases.

use crate::metric::{EnsembleMode, EnsembleSpec, MetricKind, Scorer};
use crate::normalizer::{NormalizerType, PercentileConvention};
use crate::{Error, Result};
use ahash::AHashSet;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_MAX_RESULT_MATRIX_CELLS: usize = 1_000_000;
pub const DEFAULT_MAX_RESULTS: usize = 10_000;

/// Which raw scores train a metric's normalizer during a build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildMode {
    /// Scores of random concept pairs
    #[default]
    Similarity,
    /// Scores of each sampled concept against its top neighbours
    Cosimilarity,
    Both,
}

impl BuildMode {
    pub fn samples_pairs(self) -> bool {
        matches!(self, BuildMode::Similarity | BuildMode::Both)
    }

    pub fn samples_neighbours(self) -> bool {
        matches!(self, BuildMode::Cosimilarity | BuildMode::Both)
    }
}

/// One metric in the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricConfig {
    pub name: String,
    pub kind: MetricKind,
    /// Scoring function; defaults to cosine for vector metrics and Jaccard
    /// for link and category metrics
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scorer: Option<Scorer>,
    /// Falls back to the top-level `normalizer_type`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normalizer: Option<NormalizerType>,
    /// JSON-lines feature file used by `build`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<PathBuf>,
    /// Ensemble members; falls back to the top-level `ensemble_weights`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weights: Option<EnsembleSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<EnsembleMode>,
}

impl MetricConfig {
    pub fn new(name: impl Into<String>, kind: MetricKind) -> Self {
        Self {
            name: name.into(),
            kind,
            scorer: None,
            normalizer: None,
            features: None,
            weights: None,
            mode: None,
        }
    }

    pub fn with_scorer(mut self, scorer: Scorer) -> Self {
        self.scorer = Some(scorer);
        self
    }

    pub fn with_normalizer(mut self, normalizer: NormalizerType) -> Self {
        self.normalizer = Some(normalizer);
        self
    }

    pub fn with_features(mut self, path: impl Into<PathBuf>) -> Self {
        self.features = Some(path.into());
        self
    }

    pub fn with_weights(mut self, weights: EnsembleSpec) -> Self {
        self.weights = Some(weights);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Worker threads in the build pool
    pub workers: usize,
    /// Raw scores drawn per sampling strategy when fitting a normalizer
    #[serde(alias = "sampleSize")]
    pub sample_size: usize,
    /// Neighbours taken per sampled concept in cosimilarity mode
    pub neighbours: usize,
    pub seed: u64,
    #[serde(alias = "cancelCheckInterval")]
    pub cancel_check_interval: usize,
    /// Published versions kept per matrix; older ones are pruned
    #[serde(alias = "keepVersions")]
    pub keep_versions: usize,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            sample_size: 10_000,
            neighbours: 10,
            seed: 42,
            cancel_check_interval: 256,
            keep_versions: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SrConfig {
    /// Metric used when a query names none
    #[serde(alias = "metricName")]
    pub metric_name: String,
    pub language: String,
    #[serde(alias = "normalizerType")]
    pub normalizer_type: NormalizerType,
    #[serde(alias = "ensembleWeights")]
    pub ensemble_weights: EnsembleSpec,
    #[serde(alias = "featureMatrixLocation")]
    pub feature_matrix_location: PathBuf,
    #[serde(alias = "buildMode")]
    pub build_mode: BuildMode,
    #[serde(alias = "maxResultMatrixCells")]
    pub max_result_matrix_cells: usize,
    #[serde(alias = "maxResults")]
    pub max_results: usize,
    /// Drop the query concept from its own mostSimilar results
    #[serde(alias = "excludeQuery")]
    pub exclude_query: bool,
    #[serde(alias = "ensembleMode")]
    pub ensemble_mode: EnsembleMode,
    #[serde(alias = "percentileConvention")]
    pub percentile_convention: PercentileConvention,
    pub metrics: Vec<MetricConfig>,
    pub build: BuildConfig,
}

impl Default for SrConfig {
    fn default() -> Self {
        Self {
            metric_name: String::new(),
            language: "simple".to_string(),
            normalizer_type: NormalizerType::default(),
            ensemble_weights: EnsembleSpec::default(),
            feature_matrix_location: PathBuf::from("./dat/sr"),
            build_mode: BuildMode::default(),
            max_result_matrix_cells: DEFAULT_MAX_RESULT_MATRIX_CELLS,
            max_results: DEFAULT_MAX_RESULTS,
            exclude_query: false,
            ensemble_mode: EnsembleMode::default(),
            percentile_convention: PercentileConvention::default(),
            metrics: Vec::new(),
            build: BuildConfig::default(),
        }
    }
}

impl SrConfig {
    /// Read and validate a JSON configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: SrConfig = serde_json::from_str(&text)
            .map_err(|e| Error::config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let config: SrConfig =
            serde_json::from_str(text).map_err(|e| Error::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn metric(&self, name: &str) -> Option<&MetricConfig> {
        self.metrics.iter().find(|m| m.name == name)
    }

    /// Normalizer type for a metric, falling back to the global default
    pub fn normalizer_for(&self, metric: &MetricConfig) -> NormalizerType {
        metric.normalizer.unwrap_or(self.normalizer_type)
    }

    /// Members of an ensemble metric
    pub fn weights_for<'a>(&'a self, metric: &'a MetricConfig) -> &'a EnsembleSpec {
        metric.weights.as_ref().unwrap_or(&self.ensemble_weights)
    }

    pub fn mode_for<'a>(&'a self, metric: &'a MetricConfig) -> &'a EnsembleMode {
        metric.mode.as_ref().unwrap_or(&self.ensemble_mode)
    }

    pub fn validate(&self) -> Result<()> {
        if self.language.trim().is_empty() {
            return Err(Error::config("language must not be empty"));
        }
        if self.max_result_matrix_cells == 0 {
            return Err(Error::config("max_result_matrix_cells must be positive"));
        }
        if self.max_results == 0 {
            return Err(Error::config("max_results must be positive"));
        }
        if self.build.workers == 0 {
            return Err(Error::config("build.workers must be positive"));
        }
        if self.build.cancel_check_interval == 0 {
            return Err(Error::config("build.cancel_check_interval must be positive"));
        }

        let mut names = AHashSet::with_capacity(self.metrics.len());
        for metric in &self.metrics {
            if metric.name.trim().is_empty() {
                return Err(Error::config("metric name must not be empty"));
            }
            if !names.insert(metric.name.as_str()) {
                return Err(Error::config(format!("metric '{}' is defined twice", metric.name)));
            }
            match metric.kind {
                MetricKind::Ensemble => {
                    let weights = self.weights_for(metric);
                    weights.validate()?;
                    for (member, _) in weights.weights() {
                        match self.metric(member) {
                            None => {
                                return Err(Error::config(format!(
                                    "ensemble '{}' references unknown metric '{}'",
                                    metric.name, member
                                )))
                            }
                            Some(m) if m.kind == MetricKind::Ensemble => {
                                return Err(Error::config(format!(
                                    "ensemble '{}' cannot contain ensemble '{}'",
                                    metric.name, member
                                )))
                            }
                            Some(_) => {}
                        }
                    }
                }
                kind => {
                    if let Some(scorer) = metric.scorer {
                        if !kind.supports(scorer) {
                            return Err(Error::config(format!(
                                "metric '{}' of kind {} cannot use scorer {}",
                                metric.name, kind, scorer
                            )));
                        }
                    }
                }
            }
        }

        if !self.metric_name.is_empty() && self.metric(&self.metric_name).is_none() {
            return Err(Error::config(format!(
                "metric_name '{}' is not among the configured metrics",
                self.metric_name
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"{
        "metricName": "ensemble",
        "language": "simple",
        "normalizerType": "percentile",
        "ensembleWeights": [["word2vec", 0.25], ["esa", 0.45], ["outlink", 0.12]],
        "featureMatrixLocation": "/tmp/sr",
        "buildMode": "both",
        "maxResultMatrixCells": 500,
        "metrics": [
            {"name": "esa", "kind": "vector", "features": "esa.jsonl"},
            {"name": "word2vec", "kind": "vector", "normalizer": "loess"},
            {"name": "outlink", "kind": "link", "scorer": "milne_witten"},
            {"name": "ensemble", "kind": "ensemble"}
        ],
        "build": {"workers": 4, "seed": 7}
    }"#;

    #[test]
    fn test_parse_camel_case() {
        let config = SrConfig::from_json(CONFIG).unwrap();
        assert_eq!(config.metric_name, "ensemble");
        assert_eq!(config.normalizer_type, NormalizerType::Percentile);
        assert_eq!(config.build_mode, BuildMode::Both);
        assert_eq!(config.max_result_matrix_cells, 500);
        assert_eq!(config.max_results, DEFAULT_MAX_RESULTS);
        assert!(!config.exclude_query);
        assert_eq!(config.build.workers, 4);
        assert_eq!(config.build.cancel_check_interval, 256);
        let (name, coefficient) = &config.ensemble_weights.weights()[1];
        assert_eq!(name, "esa");
        assert!((coefficient - 0.45).abs() < 1e-6);

        let w2v = config.metric("word2vec").unwrap();
        assert_eq!(config.normalizer_for(w2v), NormalizerType::Loess);
        let esa = config.metric("esa").unwrap();
        assert_eq!(config.normalizer_for(esa), NormalizerType::Percentile);
        assert_eq!(config.metric("outlink").unwrap().scorer, Some(Scorer::MilneWitten));
    }

    #[test]
    fn test_unknown_ensemble_member() {
        let text = CONFIG.replace(r#"["outlink", 0.12]"#, r#"["inlink", 0.18]"#);
        assert!(matches!(SrConfig::from_json(&text), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_invalid_combinations() {
        let text = CONFIG.replace(r#""kind": "link", "scorer": "milne_witten""#, r#""kind": "category", "scorer": "milne_witten""#);
        assert!(SrConfig::from_json(&text).is_err());

        let text = CONFIG.replace(r#""normalizerType": "percentile""#, r#""normalizerType": "zscore""#);
        assert!(SrConfig::from_json(&text).is_err());

        let text = CONFIG.replace(r#""metricName": "ensemble""#, r#""metricName": "missing""#);
        assert!(SrConfig::from_json(&text).is_err());
    }

    #[test]
    fn test_defaults() {
        let config = SrConfig::from_json("{}").unwrap();
        assert_eq!(config.max_result_matrix_cells, DEFAULT_MAX_RESULT_MATRIX_CELLS);
        assert_eq!(config.normalizer_type, NormalizerType::Identity);
        assert_eq!(config.build_mode, BuildMode::Similarity);
        assert_eq!(config.ensemble_mode, EnsembleMode::Exact);
    }
}
