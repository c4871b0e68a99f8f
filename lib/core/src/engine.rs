//! Query engine: the runtime façade over the registry
//!
//! Every query is validated in a fixed order before any scoring starts:
//! the metric must be registered, the request must fit the configured
//! capacity, normalizers must be fitted, matrices must be built and the
//! concept ids must be known. Raw metric scores are then passed through the
//! metric's normalizer and shaped into result types.

use crate::config::{SrConfig, DEFAULT_MAX_RESULTS, DEFAULT_MAX_RESULT_MATRIX_CELLS};
use crate::filter::{Both, ExcludeOne, Filter};
use crate::metric::{ExplainedScore, Metric, MetricKind, Probe, ProbeVectors};
use crate::normalizer::{Normalizer, NormalizerType};
use crate::registry::{MetricEntry, Registry};
use crate::result::{CosimilarityMatrix, ResultList, SimilarityResult};
use crate::{ConceptId, Error, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Request-size ceilings and result shaping options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueryLimits {
    pub max_result_matrix_cells: usize,
    pub max_results: usize,
    pub exclude_query: bool,
}

impl Default for QueryLimits {
    fn default() -> Self {
        Self {
            max_result_matrix_cells: DEFAULT_MAX_RESULT_MATRIX_CELLS,
            max_results: DEFAULT_MAX_RESULTS,
            exclude_query: false,
        }
    }
}

impl From<&SrConfig> for QueryLimits {
    fn from(config: &SrConfig) -> Self {
        Self {
            max_result_matrix_cells: config.max_result_matrix_cells,
            max_results: config.max_results,
            exclude_query: config.exclude_query,
        }
    }
}

/// Query counters exposed by the HTTP metrics endpoint
#[derive(Debug, Default)]
struct QueryStats {
    similarity: AtomicU64,
    most_similar: AtomicU64,
    cosimilarity: AtomicU64,
    errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueryStatsSnapshot {
    pub similarity: u64,
    pub most_similar: u64,
    pub cosimilarity: u64,
    pub errors: u64,
}

/// Status of one registered metric
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricStatus {
    pub language: String,
    pub name: String,
    pub kind: MetricKind,
    pub built: bool,
    pub version: Option<u64>,
    pub concepts: usize,
    pub normalizer: NormalizerType,
    pub fitted: bool,
}

pub struct QueryEngine {
    registry: Arc<Registry>,
    limits: QueryLimits,
    stats: QueryStats,
}

impl QueryEngine {
    pub fn new(registry: Arc<Registry>, limits: QueryLimits) -> Self {
        Self {
            registry,
            limits,
            stats: QueryStats::default(),
        }
    }

    pub fn from_config(registry: Arc<Registry>, config: &SrConfig) -> Self {
        Self::new(registry, QueryLimits::from(config))
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn limits(&self) -> QueryLimits {
        self.limits
    }

    pub fn similarity(
        &self,
        language: &str,
        metric: &str,
        a: ConceptId,
        b: ConceptId,
    ) -> Result<SimilarityResult> {
        self.stats.similarity.fetch_add(1, Ordering::Relaxed);
        self.track(self.run_similarity(language, metric, &Probe::Concept(a), b))
    }

    /// Similarity between a probe (e.g. a phrase) and a concept
    pub fn probe_similarity(
        &self,
        language: &str,
        metric: &str,
        probe: &ProbeVectors,
        b: ConceptId,
    ) -> Result<SimilarityResult> {
        self.stats.similarity.fetch_add(1, Ordering::Relaxed);
        self.track(self.run_similarity(language, metric, &Probe::Vectors(probe), b))
    }

    pub fn most_similar(
        &self,
        language: &str,
        metric: &str,
        id: ConceptId,
        k: usize,
        filter: Option<&dyn Filter>,
    ) -> Result<ResultList> {
        self.stats.most_similar.fetch_add(1, Ordering::Relaxed);
        self.track(self.run_most_similar(language, metric, &Probe::Concept(id), k, filter))
    }

    pub fn most_similar_probe(
        &self,
        language: &str,
        metric: &str,
        probe: &ProbeVectors,
        k: usize,
        filter: Option<&dyn Filter>,
    ) -> Result<ResultList> {
        self.stats.most_similar.fetch_add(1, Ordering::Relaxed);
        self.track(self.run_most_similar(language, metric, &Probe::Vectors(probe), k, filter))
    }

    pub fn cosimilarity(
        &self,
        language: &str,
        metric: &str,
        rows: &[ConceptId],
        cols: &[ConceptId],
    ) -> Result<CosimilarityMatrix> {
        self.stats.cosimilarity.fetch_add(1, Ordering::Relaxed);
        self.track(self.run_cosimilarity(language, metric, rows, cols))
    }

    /// Per-member breakdown of an ensemble score
    pub fn explain(
        &self,
        language: &str,
        metric: &str,
        a: ConceptId,
        b: ConceptId,
    ) -> Result<ExplainedScore> {
        let entry = self.registry.get(language, metric)?;
        let ensemble = entry.metric().as_ensemble().ok_or_else(|| {
            Error::config(format!("metric '{}' is not an ensemble", metric))
        })?;
        self.prepare(&entry)?;
        ensemble.explain(&Probe::Concept(a), b)
    }

    pub fn stats(&self) -> QueryStatsSnapshot {
        QueryStatsSnapshot {
            similarity: self.stats.similarity.load(Ordering::Relaxed),
            most_similar: self.stats.most_similar.load(Ordering::Relaxed),
            cosimilarity: self.stats.cosimilarity.load(Ordering::Relaxed),
            errors: self.stats.errors.load(Ordering::Relaxed),
        }
    }

    /// Build and normalizer state of every registered metric
    pub fn status(&self) -> Vec<MetricStatus> {
        self.registry
            .languages()
            .into_iter()
            .flat_map(|language| self.registry.entries(&language))
            .map(|entry| {
                let matrix = entry.metric().as_matrix().and_then(|m| m.snapshot().ok());
                MetricStatus {
                    language: entry.metric().language().to_string(),
                    name: entry.metric().name().to_string(),
                    kind: entry.metric().kind(),
                    built: entry.metric().is_built(),
                    version: matrix.as_ref().map(|m| m.version()),
                    concepts: matrix.as_ref().map_or(0, |m| m.len()),
                    normalizer: entry.template().kind(),
                    fitted: entry.normalizer().load().is_some_and(|n| n.is_fitted()),
                }
            })
            .collect()
    }

    fn track<T>(&self, result: Result<T>) -> Result<T> {
        if result.is_err() {
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Normalizer fitted, then matrices built
    fn prepare(&self, entry: &MetricEntry) -> Result<Arc<Normalizer>> {
        let normalizer = entry
            .normalizer()
            .load()
            .filter(|n| n.is_fitted())
            .ok_or_else(|| Error::NotFitted(format!("normalizer for {}", entry.key())))?;
        if let Some(ensemble) = entry.metric().as_ensemble() {
            ensemble.ensure_fitted()?;
        }
        entry.metric().ensure_built()?;
        Ok(normalizer)
    }

    fn check_known(metric: &Metric, probe: &Probe<'_>) -> Result<()> {
        if let Some(id) = probe.concept() {
            Self::check_concept(metric, id)?;
        }
        Ok(())
    }

    fn check_concept(metric: &Metric, id: ConceptId) -> Result<()> {
        if metric.contains(id)? {
            Ok(())
        } else {
            Err(Error::not_found(format!("concept {} in {}", id, metric.name())))
        }
    }

    fn run_similarity(
        &self,
        language: &str,
        metric: &str,
        probe: &Probe<'_>,
        b: ConceptId,
    ) -> Result<SimilarityResult> {
        let entry = self.registry.get(language, metric)?;
        let normalizer = self.prepare(&entry)?;
        Self::check_known(entry.metric(), probe)?;
        Self::check_concept(entry.metric(), b)?;

        let raw = entry.metric().probe_similarity(probe, b)?;
        Ok(SimilarityResult {
            id: b,
            raw,
            normalized: normalizer.normalize(raw)?,
        })
    }

    fn run_most_similar(
        &self,
        language: &str,
        metric: &str,
        probe: &Probe<'_>,
        k: usize,
        filter: Option<&dyn Filter>,
    ) -> Result<ResultList> {
        let entry = self.registry.get(language, metric)?;
        if k > self.limits.max_results {
            return Err(Error::CapacityExceeded {
                requested: k,
                limit: self.limits.max_results,
            });
        }
        let normalizer = self.prepare(&entry)?;
        Self::check_known(entry.metric(), probe)?;

        let exclude = match (self.limits.exclude_query, probe.concept()) {
            (true, Some(id)) => Some(ExcludeOne(id)),
            _ => None,
        };
        let combined;
        let filter: Option<&dyn Filter> = match (&exclude, filter) {
            (Some(exclude), Some(filter)) => {
                combined = Both(exclude, filter);
                Some(&combined)
            }
            (Some(exclude), None) => Some(exclude),
            (None, filter) => filter,
        };

        let model = normalizer
            .model()
            .ok_or_else(|| Error::NotFitted(format!("normalizer for {}", entry.key())))?;
        let raw = entry.metric().most_similar_ranked(probe, k, filter, model)?;
        let results = raw
            .into_iter()
            .map(|(id, raw)| {
                Ok(SimilarityResult {
                    id,
                    raw,
                    normalized: normalizer.normalize(raw)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(ResultList::ranked(results, k))
    }

    fn run_cosimilarity(
        &self,
        language: &str,
        metric: &str,
        rows: &[ConceptId],
        cols: &[ConceptId],
    ) -> Result<CosimilarityMatrix> {
        let entry = self.registry.get(language, metric)?;
        let cells = rows.len().saturating_mul(cols.len());
        if cells > self.limits.max_result_matrix_cells {
            return Err(Error::CapacityExceeded {
                requested: cells,
                limit: self.limits.max_result_matrix_cells,
            });
        }
        let normalizer = self.prepare(&entry)?;
        for &id in rows.iter().chain(cols) {
            Self::check_concept(entry.metric(), id)?;
        }

        let raw = entry.metric().cosimilarity(rows, cols)?;
        let normalized = raw
            .into_iter()
            .map(|score| normalizer.normalize(score))
            .collect::<Result<Vec<_>>>()?;
        Ok(CosimilarityMatrix::new(rows.to_vec(), cols.to_vec(), normalized))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::CandidateFilter;
    use crate::matrix::{FeatureMatrix, MatrixKey};
    use crate::normalizer::PercentileConvention;
    use crate::{Concept, FeatureVector};

    fn fv(pairs: &[(u32, f32)]) -> FeatureVector {
        FeatureVector::new(pairs.iter().copied())
    }

    /// A={t1:1,t2:1}, B={t1:1,t2:0.5}, C={t3:1} as concepts 1, 2, 3
    fn abc_registry(normalizer: NormalizerType, convention: PercentileConvention) -> Arc<Registry> {
        let registry = Registry::new();
        let key = MatrixKey::new("esa", "simple");
        let entry = registry
            .register_matrix_metric(
                key.clone(),
                MetricKind::Vector,
                None,
                Normalizer::new(normalizer).with_convention(convention),
                None,
            )
            .unwrap();
        let matrix = FeatureMatrix::new(
            key,
            1,
            vec![
                (Concept::new(1u32), fv(&[(1, 1.0), (2, 1.0)])),
                (Concept::new(2u32), fv(&[(1, 1.0), (2, 0.5)])),
                (Concept::new(3u32), fv(&[(3, 1.0)])),
            ],
        )
        .unwrap();
        entry.matrix_slot().unwrap().publish(Arc::new(matrix));
        Arc::new(registry)
    }

    fn fit_on_b_and_c(registry: &Registry) {
        let entry = registry.get("simple", "esa").unwrap();
        let metric = entry.metric();
        let sample = [
            metric.similarity(ConceptId(1), ConceptId(2)).unwrap(),
            metric.similarity(ConceptId(1), ConceptId(3)).unwrap(),
        ];
        let fitted = entry.template().fit(&sample).unwrap();
        entry.normalizer().publish(Arc::new(fitted));
    }

    fn engine(registry: Arc<Registry>, exclude_query: bool) -> QueryEngine {
        QueryEngine::new(
            registry,
            QueryLimits {
                exclude_query,
                ..QueryLimits::default()
            },
        )
    }

    #[test]
    fn test_scenario_raw_scores() {
        let engine = engine(abc_registry(NormalizerType::Identity, PercentileConvention::Rank), true);
        let ab = engine.similarity("simple", "esa", ConceptId(1), ConceptId(2)).unwrap();
        assert!((ab.raw - 0.948_683_3).abs() < 1e-6);
        assert_eq!(ab.raw, ab.normalized);

        let results = engine.most_similar("simple", "esa", ConceptId(1), 2, None).unwrap();
        assert_eq!(results.ids(), vec![ConceptId(2), ConceptId(3)]);
        assert_eq!(results.get(1).unwrap().raw, 0.0);
    }

    #[test]
    fn test_scenario_percentile_rank() {
        let registry = abc_registry(NormalizerType::Percentile, PercentileConvention::Rank);
        fit_on_b_and_c(&registry);
        let engine = engine(registry, true);

        let results = engine.most_similar("simple", "esa", ConceptId(1), 2, None).unwrap();
        let normalized: Vec<f32> = results.iter().map(|r| r.normalized).collect();
        assert_eq!(results.ids(), vec![ConceptId(2), ConceptId(3)]);
        assert_eq!(normalized, vec![1.0, 0.0]);
    }

    #[test]
    fn test_scenario_percentile_fraction() {
        let registry = abc_registry(NormalizerType::Percentile, PercentileConvention::Fraction);
        fit_on_b_and_c(&registry);
        let engine = engine(registry, true);

        let results = engine.most_similar("simple", "esa", ConceptId(1), 2, None).unwrap();
        let normalized: Vec<f32> = results.iter().map(|r| r.normalized).collect();
        assert_eq!(normalized, vec![1.0, 0.5]);
    }

    #[test]
    fn test_top_k_cutoff_follows_normalized_order() {
        let registry = Registry::new();
        let key = MatrixKey::new("esa", "simple");
        let entry = registry
            .register_matrix_metric(
                key.clone(),
                MetricKind::Vector,
                None,
                Normalizer::new(NormalizerType::Percentile),
                None,
            )
            .unwrap();
        let matrix = FeatureMatrix::new(
            key,
            1,
            vec![
                (Concept::new(1u32), fv(&[(1, 1.0)])),
                (Concept::new(2u32), fv(&[(1, 1.0), (2, 3.0)])),
                (Concept::new(9u32), fv(&[(1, 1.0), (2, 1.0)])),
            ],
        )
        .unwrap();
        entry.matrix_slot().unwrap().publish(Arc::new(matrix));
        // Both neighbours (raw 0.316 and 0.707) fall below 0.9 and share rank 0.0
        let fitted = entry.template().fit(&[0.0, 0.9]).unwrap();
        entry.normalizer().publish(Arc::new(fitted));
        let engine = engine(Arc::new(registry), true);

        let top1 = engine.most_similar("simple", "esa", ConceptId(1), 1, None).unwrap();
        let top2 = engine.most_similar("simple", "esa", ConceptId(1), 2, None).unwrap();
        assert_eq!(top2.ids(), vec![ConceptId(2), ConceptId(9)]);
        assert_eq!(top1.ids(), top2.ids()[..1].to_vec());
        assert!(top2.iter().all(|r| r.normalized == 0.0));
    }

    #[test]
    fn test_query_included_without_flag() {
        let engine = engine(abc_registry(NormalizerType::Identity, PercentileConvention::Rank), false);
        let results = engine.most_similar("simple", "esa", ConceptId(1), 2, None).unwrap();
        assert_eq!(results.ids(), vec![ConceptId(1), ConceptId(2)]);
    }

    #[test]
    fn test_caller_filter_combines_with_exclusion() {
        let engine = engine(abc_registry(NormalizerType::Identity, PercentileConvention::Rank), true);
        let filter = CandidateFilter::exclude([ConceptId(2)]);
        let results = engine
            .most_similar("simple", "esa", ConceptId(1), 5, Some(&filter))
            .unwrap();
        assert_eq!(results.ids(), vec![ConceptId(3)]);
    }

    #[test]
    fn test_capacity_checked_before_scoring() {
        // Nothing is built or fitted: the capacity check must fire first
        let registry = Registry::new();
        registry
            .register_matrix_metric(
                MatrixKey::new("esa", "simple"),
                MetricKind::Vector,
                None,
                Normalizer::new(NormalizerType::Percentile),
                None,
            )
            .unwrap();
        let engine = QueryEngine::new(Arc::new(registry), QueryLimits::default());

        let ids: Vec<ConceptId> = (0..10_000).map(ConceptId).collect();
        let result = engine.cosimilarity("simple", "esa", &ids, &ids);
        assert!(matches!(
            result,
            Err(Error::CapacityExceeded { requested: 100_000_000, limit: 1_000_000 })
        ));

        let result = engine.most_similar("simple", "esa", ConceptId(0), 10_001, None);
        assert!(matches!(result, Err(Error::CapacityExceeded { .. })));
        assert_eq!(engine.stats().errors, 2);
    }

    #[test]
    fn test_precondition_order() {
        let registry = Registry::new();
        let entry = registry
            .register_matrix_metric(
                MatrixKey::new("esa", "simple"),
                MetricKind::Vector,
                None,
                Normalizer::new(NormalizerType::Percentile),
                None,
            )
            .unwrap();
        let engine = QueryEngine::new(Arc::new(registry), QueryLimits::default());

        assert!(matches!(
            engine.similarity("simple", "lsa", ConceptId(1), ConceptId(2)),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            engine.similarity("simple", "esa", ConceptId(1), ConceptId(2)),
            Err(Error::NotFitted(_))
        ));

        entry.normalizer().publish(Arc::new(Normalizer::identity()));
        assert!(matches!(
            engine.most_similar("simple", "esa", ConceptId(1), 3, None),
            Err(Error::NotBuilt { .. })
        ));

        let matrix = FeatureMatrix::new(
            MatrixKey::new("esa", "simple"),
            1,
            vec![(Concept::new(1u32), fv(&[(1, 1.0)]))],
        )
        .unwrap();
        entry.matrix_slot().unwrap().publish(Arc::new(matrix));
        assert!(matches!(
            engine.cosimilarity("simple", "esa", &[ConceptId(1)], &[ConceptId(7)]),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_cosimilarity_cells_match_similarity() {
        let registry = abc_registry(NormalizerType::Percentile, PercentileConvention::Rank);
        fit_on_b_and_c(&registry);
        let engine = engine(registry, false);

        let rows = [ConceptId(1), ConceptId(2), ConceptId(3)];
        let cols = [ConceptId(3), ConceptId(1)];
        let matrix = engine.cosimilarity("simple", "esa", &rows, &cols).unwrap();
        assert_eq!(matrix.cells().len(), 6);
        for (i, r) in rows.iter().enumerate() {
            for (j, c) in cols.iter().enumerate() {
                let expected = engine.similarity("simple", "esa", *r, *c).unwrap().normalized;
                assert!((matrix.get(i, j).unwrap() - expected).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_status() {
        let engine = engine(abc_registry(NormalizerType::Percentile, PercentileConvention::Rank), false);
        let status = engine.status();
        assert_eq!(status.len(), 1);
        assert!(status[0].built);
        assert!(!status[0].fitted);
        assert_eq!(status[0].concepts, 3);
    }
}
