//! Metrics: the polymorphic scorers behind every query
//!
//! Three variants read a single feature matrix and differ only in their
//! scoring function. The ensemble variant combines normalized scores of
//! matrix-backed members. All variants return raw scores; normalization of a
//! metric's own output happens in the query engine.

pub mod ensemble;
pub mod matrix_metric;

pub use ensemble::{
    Contribution, EnsembleMember, EnsembleMetric, EnsembleMode, EnsembleSpec, ExplainedScore,
};
pub use matrix_metric::{MatrixMetric, Scorer};

use crate::filter::Filter;
use crate::matrix::{MatrixKey, MatrixSlot};
use crate::normalizer::NormalizerModel;
use crate::{ConceptId, Error, FeatureVector, Result};
use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Vector,
    Link,
    Category,
    Ensemble,
}

impl MetricKind {
    pub fn default_scorer(self) -> Option<Scorer> {
        match self {
            MetricKind::Vector => Some(Scorer::Cosine),
            MetricKind::Link | MetricKind::Category => Some(Scorer::Jaccard),
            MetricKind::Ensemble => None,
        }
    }

    pub fn supports(self, scorer: Scorer) -> bool {
        match self {
            MetricKind::Vector => scorer == Scorer::Cosine,
            MetricKind::Link => true,
            MetricKind::Category => scorer != Scorer::MilneWitten,
            MetricKind::Ensemble => false,
        }
    }
}

impl FromStr for MetricKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "vector" => Ok(MetricKind::Vector),
            "link" => Ok(MetricKind::Link),
            "category" => Ok(MetricKind::Category),
            "ensemble" => Ok(MetricKind::Ensemble),
            other => Err(Error::config(format!("unknown metric kind '{}'", other))),
        }
    }
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            MetricKind::Vector => "vector",
            MetricKind::Link => "link",
            MetricKind::Category => "category",
            MetricKind::Ensemble => "ensemble",
        })
    }
}

/// Per-metric feature vectors standing in for a concept without an id
#[derive(Debug, Clone, Default)]
pub struct ProbeVectors {
    by_metric: AHashMap<String, FeatureVector>,
}

impl ProbeVectors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, metric: impl Into<String>, vector: FeatureVector) {
        self.by_metric.insert(metric.into(), vector);
    }

    pub fn get(&self, metric: &str) -> Option<&FeatureVector> {
        self.by_metric.get(metric)
    }

    pub fn len(&self) -> usize {
        self.by_metric.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_metric.is_empty()
    }

    pub fn metrics(&self) -> impl Iterator<Item = &str> {
        self.by_metric.keys().map(String::as_str)
    }
}

/// What a query is keyed by
#[derive(Debug, Clone, Copy)]
pub enum Probe<'a> {
    Concept(ConceptId),
    Vectors(&'a ProbeVectors),
}

impl Probe<'_> {
    pub fn concept(&self) -> Option<ConceptId> {
        match self {
            Probe::Concept(id) => Some(*id),
            Probe::Vectors(_) => None,
        }
    }
}

impl std::fmt::Display for Probe<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Probe::Concept(id) => write!(f, "concept {}", id),
            Probe::Vectors(v) => write!(f, "probe over {} metric(s)", v.len()),
        }
    }
}

#[derive(Debug)]
pub enum Metric {
    Vector(MatrixMetric),
    Link(MatrixMetric),
    Category(MatrixMetric),
    Ensemble(EnsembleMetric),
}

impl Metric {
    /// Matrix-backed metric of the given kind; `scorer` falls back to the kind's default
    pub fn matrix(
        kind: MetricKind,
        key: MatrixKey,
        slot: Arc<MatrixSlot>,
        scorer: Option<Scorer>,
    ) -> Result<Self> {
        let wrap: fn(MatrixMetric) -> Metric = match kind {
            MetricKind::Vector => Metric::Vector,
            MetricKind::Link => Metric::Link,
            MetricKind::Category => Metric::Category,
            MetricKind::Ensemble => {
                return Err(Error::config(format!("metric {} of kind ensemble is not matrix-backed", key)))
            }
        };
        let scorer = scorer.or_else(|| kind.default_scorer()).unwrap_or(Scorer::Cosine);
        if !kind.supports(scorer) {
            return Err(Error::config(format!(
                "metric {} of kind {} cannot use scorer {}",
                key, kind, scorer
            )));
        }
        Ok(wrap(MatrixMetric::new(key, slot, scorer)))
    }

    pub fn name(&self) -> &str {
        match self {
            Metric::Vector(m) | Metric::Link(m) | Metric::Category(m) => &m.key().metric,
            Metric::Ensemble(e) => e.name(),
        }
    }

    pub fn language(&self) -> &str {
        match self {
            Metric::Vector(m) | Metric::Link(m) | Metric::Category(m) => &m.key().language,
            Metric::Ensemble(e) => e.language(),
        }
    }

    pub fn kind(&self) -> MetricKind {
        match self {
            Metric::Vector(_) => MetricKind::Vector,
            Metric::Link(_) => MetricKind::Link,
            Metric::Category(_) => MetricKind::Category,
            Metric::Ensemble(_) => MetricKind::Ensemble,
        }
    }

    pub fn as_matrix(&self) -> Option<&MatrixMetric> {
        match self {
            Metric::Vector(m) | Metric::Link(m) | Metric::Category(m) => Some(m),
            Metric::Ensemble(_) => None,
        }
    }

    pub fn as_ensemble(&self) -> Option<&EnsembleMetric> {
        match self {
            Metric::Ensemble(e) => Some(e),
            _ => None,
        }
    }

    /// NotBuilt unless every backing matrix has been published
    pub fn ensure_built(&self) -> Result<()> {
        match self {
            Metric::Vector(m) | Metric::Link(m) | Metric::Category(m) => m.snapshot().map(|_| ()),
            Metric::Ensemble(e) => e.ensure_built(),
        }
    }

    pub fn is_built(&self) -> bool {
        self.ensure_built().is_ok()
    }

    /// Whether any backing matrix knows the concept
    pub fn contains(&self, id: ConceptId) -> Result<bool> {
        match self {
            Metric::Vector(m) | Metric::Link(m) | Metric::Category(m) => {
                Ok(m.snapshot()?.contains(id))
            }
            Metric::Ensemble(e) => e.contains(id),
        }
    }

    pub fn similarity(&self, a: ConceptId, b: ConceptId) -> Result<f32> {
        self.probe_similarity(&Probe::Concept(a), b)
    }

    pub fn probe_similarity(&self, probe: &Probe<'_>, b: ConceptId) -> Result<f32> {
        match self {
            Metric::Vector(m) | Metric::Link(m) | Metric::Category(m) => m.probe_similarity(probe, b),
            Metric::Ensemble(e) => e.probe_similarity(probe, b),
        }
    }

    /// Raw top-k, best first, ties broken by ascending id
    pub fn most_similar(
        &self,
        probe: &Probe<'_>,
        k: usize,
        filter: Option<&dyn Filter>,
    ) -> Result<Vec<(ConceptId, f32)>> {
        match self {
            Metric::Vector(m) | Metric::Link(m) | Metric::Category(m) => {
                m.most_similar(probe, k, filter)
            }
            Metric::Ensemble(e) => e.most_similar(probe, k, filter),
        }
    }

    /// Top-k ranked by a fitted normalizer model, ties broken by ascending
    /// id; returns raw scores
    pub fn most_similar_ranked(
        &self,
        probe: &Probe<'_>,
        k: usize,
        filter: Option<&dyn Filter>,
        rank: &NormalizerModel,
    ) -> Result<Vec<(ConceptId, f32)>> {
        match self {
            Metric::Vector(m) | Metric::Link(m) | Metric::Category(m) => {
                m.most_similar_ranked(probe, k, filter, rank)
            }
            Metric::Ensemble(e) => e.most_similar_ranked(probe, k, filter, rank),
        }
    }

    /// Raw row-major scores for every (row, col) pair
    pub fn cosimilarity(&self, rows: &[ConceptId], cols: &[ConceptId]) -> Result<Vec<f32>> {
        match self {
            Metric::Vector(m) | Metric::Link(m) | Metric::Category(m) => m.cosimilarity(rows, cols),
            Metric::Ensemble(e) => e.cosimilarity(rows, cols),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scorer_combinations() {
        let key = MatrixKey::new("outlink", "simple");
        let slot = Arc::new(MatrixSlot::empty());

        let link = Metric::matrix(MetricKind::Link, key.clone(), slot.clone(), None).unwrap();
        assert_eq!(link.as_matrix().unwrap().scorer(), Scorer::Jaccard);
        assert!(Metric::matrix(MetricKind::Link, key.clone(), slot.clone(), Some(Scorer::MilneWitten)).is_ok());

        assert!(matches!(
            Metric::matrix(MetricKind::Vector, key.clone(), slot.clone(), Some(Scorer::Jaccard)),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            Metric::matrix(MetricKind::Category, key.clone(), slot.clone(), Some(Scorer::MilneWitten)),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            Metric::matrix(MetricKind::Ensemble, key, slot, None),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_unbuilt_metric() {
        let metric = Metric::matrix(
            MetricKind::Vector,
            MatrixKey::new("word2vec", "simple"),
            Arc::new(MatrixSlot::empty()),
            None,
        )
        .unwrap();
        assert!(!metric.is_built());
        assert_eq!(metric.name(), "word2vec");
        assert!(matches!(
            metric.cosimilarity(&[ConceptId(1)], &[ConceptId(2)]),
            Err(Error::NotBuilt { .. })
        ));
    }
}
