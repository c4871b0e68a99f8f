//! Explicit registry of metrics per language
//!
//! Built once from a configuration and shared by `Arc`. Each entry owns the
//! swap slots that builds publish into and queries read from.

use crate::config::{MetricConfig, SrConfig};
use crate::matrix::{MatrixKey, MatrixSlot};
use crate::metric::{EnsembleMember, EnsembleMetric, EnsembleMode, EnsembleSpec, Metric, MetricKind, Scorer};
use crate::normalizer::{Normalizer, NormalizerSlot, NormalizerType};
use crate::{Error, Result};
use ahash::AHashMap;
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// A registered metric with its normalizer slot
#[derive(Debug, Clone)]
pub struct MetricEntry {
    metric: Arc<Metric>,
    normalizer: Arc<NormalizerSlot>,
    template: Normalizer,
    features: Option<PathBuf>,
}

impl MetricEntry {
    fn new(metric: Metric, template: Normalizer, features: Option<PathBuf>) -> Self {
        let normalizer = if template.kind() == NormalizerType::Identity {
            NormalizerSlot::with_value(Normalizer::identity())
        } else {
            NormalizerSlot::empty()
        };
        Self {
            metric: Arc::new(metric),
            normalizer: Arc::new(normalizer),
            template,
            features,
        }
    }

    #[inline]
    pub fn metric(&self) -> &Arc<Metric> {
        &self.metric
    }

    #[inline]
    pub fn normalizer(&self) -> &Arc<NormalizerSlot> {
        &self.normalizer
    }

    /// Unfitted normalizer of the configured type and convention
    pub fn template(&self) -> &Normalizer {
        &self.template
    }

    /// JSON-lines feature file configured for builds
    pub fn features(&self) -> Option<&PathBuf> {
        self.features.as_ref()
    }

    /// Matrix slot for matrix-backed metrics
    pub fn matrix_slot(&self) -> Option<&Arc<MatrixSlot>> {
        self.metric.as_matrix().map(|m| m.slot())
    }

    pub fn key(&self) -> MatrixKey {
        MatrixKey::new(self.metric.name(), self.metric.language())
    }
}

/// language -> metric name -> entry
#[derive(Debug, Default)]
pub struct Registry {
    languages: RwLock<AHashMap<String, AHashMap<String, MetricEntry>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every configured metric for the configured language
    ///
    /// Matrix-backed metrics are registered first so that ensembles can
    /// resolve their members by name.
    pub fn from_config(config: &SrConfig) -> Result<Self> {
        config.validate()?;
        let registry = Self::new();
        let (ensembles, matrices): (Vec<&MetricConfig>, Vec<&MetricConfig>) = config
            .metrics
            .iter()
            .partition(|m| m.kind == MetricKind::Ensemble);

        for metric in matrices {
            let template =
                Normalizer::new(config.normalizer_for(metric)).with_convention(config.percentile_convention);
            registry.register_matrix_metric(
                MatrixKey::new(&metric.name, &config.language),
                metric.kind,
                metric.scorer,
                template,
                metric.features.clone(),
            )?;
        }
        for metric in ensembles {
            if let Some(kind) = metric.normalizer.filter(|n| *n != NormalizerType::Identity) {
                return Err(Error::config(format!(
                    "ensemble '{}' combines normalized scores and cannot use a {} normalizer",
                    metric.name, kind
                )));
            }
            registry.register_ensemble(
                &config.language,
                &metric.name,
                config.weights_for(metric),
                config.mode_for(metric).clone(),
            )?;
        }

        info!(
            "Registry initialized: {} metric(s) for language {}",
            config.metrics.len(),
            config.language
        );
        Ok(registry)
    }

    fn insert(&self, language: &str, name: &str, entry: MetricEntry) -> Result<MetricEntry> {
        let mut languages = self.languages.write();
        let metrics = languages.entry(language.to_string()).or_default();
        if metrics.contains_key(name) {
            return Err(Error::config(format!(
                "metric '{}' is already registered for language {}",
                name, language
            )));
        }
        metrics.insert(name.to_string(), entry.clone());
        Ok(entry)
    }

    pub fn register_matrix_metric(
        &self,
        key: MatrixKey,
        kind: MetricKind,
        scorer: Option<Scorer>,
        template: Normalizer,
        features: Option<PathBuf>,
    ) -> Result<MetricEntry> {
        let language = key.language.clone();
        let name = key.metric.clone();
        let metric = Metric::matrix(kind, key, Arc::new(MatrixSlot::empty()), scorer)?;
        self.insert(&language, &name, MetricEntry::new(metric, template, features))
    }

    pub fn register_ensemble(
        &self,
        language: &str,
        name: &str,
        spec: &EnsembleSpec,
        mode: EnsembleMode,
    ) -> Result<MetricEntry> {
        spec.validate()?;
        let members = spec
            .weights()
            .iter()
            .map(|(member, coefficient)| {
                let entry = self.get(language, member).map_err(|_| {
                    Error::config(format!(
                        "ensemble '{}' references unknown metric '{}' in language {}",
                        name, member, language
                    ))
                })?;
                Ok(EnsembleMember::new(
                    entry.metric.clone(),
                    entry.normalizer.clone(),
                    *coefficient,
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        let ensemble = EnsembleMetric::new(name, language, members, mode)?;
        self.insert(
            language,
            name,
            MetricEntry::new(Metric::Ensemble(ensemble), Normalizer::identity(), None),
        )
    }

    /// ConfigurationError if the metric is not registered
    pub fn get(&self, language: &str, name: &str) -> Result<MetricEntry> {
        self.languages
            .read()
            .get(language)
            .and_then(|metrics| metrics.get(name))
            .cloned()
            .ok_or_else(|| {
                Error::config(format!("unknown metric '{}' for language {}", name, language))
            })
    }

    pub fn languages(&self) -> Vec<String> {
        let mut languages: Vec<String> = self.languages.read().keys().cloned().collect();
        languages.sort();
        languages
    }

    /// Entries for one language in name order
    pub fn entries(&self, language: &str) -> Vec<MetricEntry> {
        let mut entries: Vec<MetricEntry> = self
            .languages
            .read()
            .get(language)
            .map(|metrics| metrics.values().cloned().collect())
            .unwrap_or_default();
        entries.sort_by(|a, b| a.metric.name().cmp(b.metric.name()));
        entries
    }

    /// Every matrix-backed entry across languages, ordered by key
    pub fn matrix_entries(&self) -> Vec<MetricEntry> {
        let mut entries: Vec<MetricEntry> = self
            .languages
            .read()
            .values()
            .flat_map(|metrics| metrics.values())
            .filter(|e| e.metric.as_matrix().is_some())
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.key());
        entries
    }
}
