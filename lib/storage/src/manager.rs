use crate::builder::{BuildReport, FeatureMatrixBuilder};
use crate::pool::BuildPool;
use crate::source::JsonlFeatureSource;
use crate::store::ArtifactStore;
use semrel_core::{BuildConfig, BuildMode, Error, FeatureSource, MatrixKey, MetricEntry, Registry, Result, SrConfig};
use std::sync::Arc;
use tracing::{info, warn};

/// Outcome of loading persisted artifacts into a registry
#[derive(Debug, Default)]
pub struct LoadSummary {
    pub loaded: Vec<(MatrixKey, u64)>,
    /// Keys with nothing published yet
    pub missing: Vec<MatrixKey>,
    pub failed: Vec<(MatrixKey, String)>,
}

/// Connects the registry's live slots with the artifact store
pub struct ArtifactManager {
    registry: Arc<Registry>,
    store: Arc<ArtifactStore>,
    mode: BuildMode,
    settings: BuildConfig,
}

impl ArtifactManager {
    pub fn new(registry: Arc<Registry>, store: Arc<ArtifactStore>) -> Self {
        Self {
            registry,
            store,
            mode: BuildMode::default(),
            settings: BuildConfig::default(),
        }
    }

    pub fn from_config(registry: Arc<Registry>, config: &SrConfig) -> Result<Self> {
        let store = Arc::new(ArtifactStore::new(&config.feature_matrix_location)?);
        Ok(Self {
            registry,
            store,
            mode: config.build_mode,
            settings: config.build.clone(),
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<ArtifactStore> {
        &self.store
    }

    /// Publish the latest stored version of every matrix-backed metric
    ///
    /// A key that fails to load keeps whatever its slots held before.
    pub fn load_latest(&self) -> LoadSummary {
        let mut summary = LoadSummary::default();
        for entry in self.registry.matrix_entries() {
            let key = entry.key();
            match self.load_entry(&entry) {
                Ok(Some(version)) => summary.loaded.push((key, version)),
                Ok(None) => summary.missing.push(key),
                Err(e) => {
                    warn!("Failed to load {}: {}", key, e);
                    summary.failed.push((key, e.to_string()));
                }
            }
        }
        info!(
            "Artifacts loaded: {} ready, {} not built, {} failed",
            summary.loaded.len(),
            summary.missing.len(),
            summary.failed.len()
        );
        summary
    }

    /// Reload one metric from its latest stored version
    pub fn reload(&self, language: &str, metric: &str) -> Result<Option<u64>> {
        let entry = self.registry.get(language, metric)?;
        self.load_entry(&entry)
    }

    fn load_entry(&self, entry: &MetricEntry) -> Result<Option<u64>> {
        let key = entry.key();
        let slot = entry
            .matrix_slot()
            .ok_or_else(|| Error::config(format!("{} has no feature matrix", key)))?;
        let Some(artifact) = self.store.load_latest(&key)? else {
            return Ok(None);
        };
        if artifact.normalizer.kind() != entry.template().kind() {
            warn!(
                "{} version {} was fitted with a {} normalizer; configuration asks for {}",
                key,
                artifact.manifest.version,
                artifact.normalizer.kind(),
                entry.template().kind()
            );
        }
        let version = artifact.manifest.version;
        slot.publish(Arc::new(artifact.matrix));
        entry.normalizer().publish(Arc::new(artifact.normalizer));
        Ok(Some(version))
    }

    pub fn builder(&self, entry: MetricEntry, source: Arc<dyn FeatureSource>) -> FeatureMatrixBuilder {
        FeatureMatrixBuilder::new(entry, source, self.store.clone())
            .with_mode(self.mode)
            .with_settings(self.settings.clone())
    }

    /// Build every matrix-backed metric that has a feature file, optionally
    /// restricted to one metric name
    ///
    /// Each key succeeds or fails on its own. Old versions are pruned by the
    /// build job itself while it still holds its key.
    pub fn build_all(&self, pool: &BuildPool, only: Option<&str>) -> Vec<(MatrixKey, Result<BuildReport>)> {
        let mut handles = Vec::new();
        let mut outcomes = Vec::new();
        for entry in self.registry.matrix_entries() {
            let key = entry.key();
            if only.is_some_and(|name| name != key.metric) {
                continue;
            }
            let Some(path) = entry.features().cloned() else {
                warn!("{} has no feature file configured; skipping", key);
                continue;
            };
            match JsonlFeatureSource::open(&path) {
                Ok(source) => handles.push(pool.submit(self.builder(entry, Arc::new(source)))),
                Err(e) => outcomes.push((key, Err(e))),
            }
        }

        for handle in handles {
            let key = handle.key().clone();
            outcomes.push((key, handle.wait()));
        }
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::CancellationToken;
    use semrel_core::{ConceptId, MetricKind, Normalizer, NormalizerType, StaticFeatureSource};
    use std::io::Write;
    use tempfile::TempDir;

    fn registry() -> Arc<Registry> {
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
        Arc::new(registry)
    }

    fn source() -> Arc<dyn FeatureSource> {
        Arc::new(
            StaticFeatureSource::new()
                .with(1, &[(1, 1.0), (2, 1.0)])
                .with(2, &[(1, 1.0), (2, 0.5)])
                .with(3, &[(3, 1.0)]),
        )
    }

    #[test]
    fn test_restart_loads_latest_version() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ArtifactStore::new(dir.path()).unwrap());

        let built = ArtifactManager::new(registry(), store.clone());
        let entry = built.registry().get("simple", "esa").unwrap();
        let report = built.builder(entry, source()).build(&CancellationToken::new()).unwrap();

        // A fresh registry starts empty and is filled from disk
        let restarted = ArtifactManager::new(registry(), store);
        let summary = restarted.load_latest();
        assert_eq!(summary.loaded, vec![(MatrixKey::new("esa", "simple"), report.version)]);

        let entry = restarted.registry().get("simple", "esa").unwrap();
        assert!(entry.metric().contains(ConceptId(3)).unwrap());
        assert!(entry.normalizer().load().unwrap().is_fitted());
    }

    #[test]
    fn test_missing_artifacts_are_reported() {
        let dir = TempDir::new().unwrap();
        let manager = ArtifactManager::new(registry(), Arc::new(ArtifactStore::new(dir.path()).unwrap()));
        let summary = manager.load_latest();
        assert_eq!(summary.missing, vec![MatrixKey::new("esa", "simple")]);
        assert_eq!(manager.reload("simple", "esa").unwrap(), None);
        assert!(manager.reload("simple", "nope").is_err());
    }

    #[test]
    fn test_build_all_from_feature_files() {
        let dir = TempDir::new().unwrap();
        let features = dir.path().join("esa.jsonl");
        let mut file = std::fs::File::create(&features).unwrap();
        for (id, dims) in [(1, "{\"1\": 1.0}"), (2, "{\"1\": 0.5, \"2\": 1.0}"), (3, "{\"3\": 1.0}")] {
            writeln!(file, "{{\"id\": {}, \"features\": {}}}", id, dims).unwrap();
        }

        let registry = Registry::new();
        registry
            .register_matrix_metric(
                MatrixKey::new("esa", "simple"),
                MetricKind::Vector,
                None,
                Normalizer::new(NormalizerType::Percentile),
                Some(features),
            )
            .unwrap();
        let manager = ArtifactManager::new(
            Arc::new(registry),
            Arc::new(ArtifactStore::new(dir.path().join("artifacts")).unwrap()),
        );
        let pool = BuildPool::new(1).unwrap();

        let outcomes = manager.build_all(&pool, None);
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].1.as_ref().unwrap().stored, 3);
        assert!(manager.build_all(&pool, Some("links")).is_empty());
    }
}
