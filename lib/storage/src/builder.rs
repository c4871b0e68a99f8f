//! Offline feature matrix builds
//!
//! A build pulls one contribution per concept from a [`FeatureSource`],
//! assembles an immutable [`FeatureMatrix`], fits the metric's normalizer on
//! a seeded sample of raw scores, persists both through the
//! [`ArtifactStore`] and finally swaps them into the registry's live slots.
//! Nothing becomes visible to readers until every step has succeeded.

use crate::store::ArtifactStore;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use semrel_core::{
    BuildConfig, BuildMode, Error, ExcludeOne, FeatureMatrix, FeatureSource, MatrixKey, MatrixMetric,
    MetricEntry, Normalizer, NormalizerType, Result,
};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Cooperative cancellation flag shared between a build and its caller
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BuildReport {
    pub key: MatrixKey,
    pub version: u64,
    /// Concepts that received a vector
    pub stored: usize,
    /// Corpus members without a contribution
    pub skipped: usize,
    /// Raw scores used to fit the normalizer
    pub sample_size: usize,
    pub elapsed: Duration,
}

impl std::fmt::Display for BuildReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} v{}: stored={} skipped={} sample={} elapsed={:.2?}",
            self.key, self.version, self.stored, self.skipped, self.sample_size, self.elapsed
        )
    }
}

/// Builds one (metric, language) feature matrix
pub struct FeatureMatrixBuilder {
    entry: MetricEntry,
    source: Arc<dyn FeatureSource>,
    store: Arc<ArtifactStore>,
    mode: BuildMode,
    settings: BuildConfig,
}

impl FeatureMatrixBuilder {
    pub fn new(entry: MetricEntry, source: Arc<dyn FeatureSource>, store: Arc<ArtifactStore>) -> Self {
        Self {
            entry,
            source,
            store,
            mode: BuildMode::default(),
            settings: BuildConfig::default(),
        }
    }

    pub fn with_mode(mut self, mode: BuildMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_settings(mut self, settings: BuildConfig) -> Self {
        self.settings = settings;
        self
    }

    pub fn key(&self) -> MatrixKey {
        self.entry.key()
    }

    pub fn build(&self, token: &CancellationToken) -> Result<BuildReport> {
        let started = Instant::now();
        let key = self.entry.key();
        let metric = self
            .entry
            .metric()
            .as_matrix()
            .ok_or_else(|| Error::config(format!("'{}' is an ensemble and has no feature matrix", key.metric)))?;
        let interval = self.settings.cancel_check_interval.max(1);
        let cancelled = || Error::Cancelled(key.to_string());

        let mut concepts = self.source.concepts()?;
        concepts.sort_by_key(|c| c.id);
        concepts.dedup_by_key(|c| c.id);
        info!("Building {} from {} concepts", key, concepts.len());

        let mut entries = Vec::with_capacity(concepts.len());
        let mut skipped = 0;
        for (i, concept) in concepts.into_iter().enumerate() {
            if i % interval == 0 {
                if token.is_cancelled() {
                    return Err(cancelled());
                }
                if i > 0 {
                    debug!("{}: {} concepts processed", key, i);
                }
            }
            match self.source.contribution(concept.id)? {
                Some(vector) => entries.push((concept, vector)),
                None => skipped += 1,
            }
        }
        let stored = entries.len();

        let version = self.store.next_version(&key)?;
        let matrix = FeatureMatrix::new(key.clone(), version, entries)?;

        let template = self.entry.template();
        let (normalizer, sample_size) = if template.kind() == NormalizerType::Identity {
            (Normalizer::identity(), 0)
        } else {
            let sample = self.sample(metric, &matrix);
            (template.fit(&sample)?, sample.len())
        };

        if token.is_cancelled() {
            return Err(cancelled());
        }
        self.store.publish(&matrix, &normalizer)?;

        metric.slot().publish(Arc::new(matrix));
        self.entry.normalizer().publish(Arc::new(normalizer));

        if let Err(e) = self.store.prune(&key, self.settings.keep_versions) {
            warn!("Failed to prune {}: {}", key, e);
        }

        let report = BuildReport {
            key,
            version,
            stored,
            skipped,
            sample_size,
            elapsed: started.elapsed(),
        };
        info!("Build finished: {}", report);
        Ok(report)
    }

    /// Raw scores for fitting the normalizer, drawn with a seeded RNG
    fn sample(&self, metric: &MatrixMetric, matrix: &FeatureMatrix) -> Vec<f32> {
        let n = matrix.len();
        let mut sample = Vec::new();
        if n < 2 {
            return sample;
        }
        let mut rng = StdRng::seed_from_u64(self.settings.seed);
        let ids = matrix.ids();
        let scorer = metric.scorer();

        if self.mode.samples_pairs() {
            for _ in 0..self.settings.sample_size {
                let a = rng.random_range(0..n);
                let mut b = rng.random_range(0..n - 1);
                if b >= a {
                    b += 1;
                }
                if let (Some(va), Some(vb)) = (matrix.get(ids[a]), matrix.get(ids[b])) {
                    sample.push(scorer.score(va, vb, n));
                }
            }
        }

        if self.mode.samples_neighbours() {
            let neighbours = self.settings.neighbours.max(1);
            let queries = (self.settings.sample_size / neighbours).clamp(1, n);
            for _ in 0..queries {
                let id = ids[rng.random_range(0..n)];
                let Some(query) = matrix.get(id) else {
                    continue;
                };
                let exclude = ExcludeOne(id);
                sample.extend(
                    metric
                        .scan(matrix, query, neighbours, Some(&exclude))
                        .into_iter()
                        .map(|(_, score)| score),
                );
            }
        }
        sample
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use semrel_core::{ConceptId, MetricKind, StaticFeatureSource};
    use tempfile::TempDir;

    fn entry(kind: NormalizerType) -> MetricEntry {
        let registry = semrel_core::Registry::new();
        registry
            .register_matrix_metric(MatrixKey::new("esa", "simple"), MetricKind::Vector, None, Normalizer::new(kind), None)
            .unwrap()
    }

    fn source() -> Arc<dyn FeatureSource> {
        let mut source = StaticFeatureSource::new()
            .with(3, &[(3, 1.0)])
            .with(1, &[(1, 1.0), (2, 1.0)])
            .with(2, &[(1, 1.0), (2, 0.5)]);
        source.insert_missing(semrel_core::Concept::new(4u32));
        Arc::new(source)
    }

    #[test]
    fn test_build_publishes_matrix_and_normalizer() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ArtifactStore::new(dir.path()).unwrap());
        let entry = entry(NormalizerType::Percentile);
        let builder = FeatureMatrixBuilder::new(entry.clone(), source(), store.clone());

        let report = builder.build(&CancellationToken::new()).unwrap();
        assert_eq!((report.stored, report.skipped), (3, 1));
        assert_eq!(report.sample_size, BuildConfig::default().sample_size);

        let matrix = entry.matrix_slot().unwrap().load().unwrap();
        assert_eq!(matrix.ids(), &[ConceptId(1), ConceptId(2), ConceptId(3)]);
        assert!(entry.normalizer().load().unwrap().is_fitted());
        assert_eq!(store.current_version(&entry.key()).unwrap(), Some(report.version));
    }

    #[test]
    fn test_identity_skips_sampling() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ArtifactStore::new(dir.path()).unwrap());
        let builder = FeatureMatrixBuilder::new(entry(NormalizerType::Identity), source(), store);
        assert_eq!(builder.build(&CancellationToken::new()).unwrap().sample_size, 0);
    }

    #[test]
    fn test_sampling_is_deterministic() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ArtifactStore::new(dir.path()).unwrap());
        let settings = BuildConfig {
            sample_size: 50,
            neighbours: 2,
            ..BuildConfig::default()
        };
        let fit = || {
            let entry = entry(NormalizerType::Percentile);
            FeatureMatrixBuilder::new(entry.clone(), source(), store.clone())
                .with_mode(BuildMode::Both)
                .with_settings(settings.clone())
                .build(&CancellationToken::new())
                .unwrap();
            entry.normalizer().load().unwrap()
        };
        let first = fit();
        let second = fit();
        assert_eq!(first.model(), second.model());
    }

    #[test]
    fn test_build_prunes_old_versions() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ArtifactStore::new(dir.path()).unwrap());
        let entry = entry(NormalizerType::Identity);
        let settings = BuildConfig {
            keep_versions: 1,
            ..BuildConfig::default()
        };

        let mut last = 0;
        for _ in 0..3 {
            last = FeatureMatrixBuilder::new(entry.clone(), source(), store.clone())
                .with_settings(settings.clone())
                .build(&CancellationToken::new())
                .unwrap()
                .version;
        }
        assert_eq!(store.list_versions(&entry.key()).unwrap(), vec![last]);
    }

    #[test]
    fn test_cancelled_build_publishes_nothing() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ArtifactStore::new(dir.path()).unwrap());
        let entry = entry(NormalizerType::Percentile);
        let builder = FeatureMatrixBuilder::new(entry.clone(), source(), store.clone());

        let token = CancellationToken::new();
        token.cancel();
        assert!(matches!(builder.build(&token), Err(Error::Cancelled(_))));
        assert!(!entry.matrix_slot().unwrap().is_set());
        assert!(store.list_versions(&entry.key()).unwrap().is_empty());
    }

    #[test]
    fn test_empty_sample_aborts_build() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ArtifactStore::new(dir.path()).unwrap());
        let entry = entry(NormalizerType::Percentile);
        let single: Arc<dyn FeatureSource> = Arc::new(StaticFeatureSource::new().with(1, &[(1, 1.0)]));
        let builder = FeatureMatrixBuilder::new(entry.clone(), single, store.clone());

        assert!(matches!(builder.build(&CancellationToken::new()), Err(Error::Normalization(_))));
        assert!(!entry.matrix_slot().unwrap().is_set());
        assert!(store.current_version(&entry.key()).unwrap().is_none());
    }
}
