//! Phrase-keyed similarity space
//!
//! Every registered phrase gets a dense id and, through a [`PhraseCreator`],
//! its own probe vectors. Neighbour queries score phrases against each other
//! with the scorers (and, for ensembles, the member normalizers) of the
//! backing metric, so bundles of free-text phrases can be compared without
//! mapping each phrase to a single concept.

use super::{PhraseCreator, PhraseDictionary, PhraseId};
use crate::matrix::{FeatureMatrix, MatrixKey, MatrixSlot};
use crate::metric::{EnsembleMember, EnsembleMetric, EnsembleMode, MatrixMetric, Metric, Probe, ProbeVectors};
use crate::{Concept, ConceptId, Error, Result};
use ahash::AHashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::debug;

pub struct KnownPhraseSim {
    creator: Arc<dyn PhraseCreator>,
    metric: Arc<Metric>,
    phrases: PhraseDictionary,
    vectors: RwLock<AHashMap<PhraseId, ProbeVectors>>,
    /// Phrase-keyed copy of `metric`; dropped whenever a vector is added
    space: RwLock<Option<Arc<Metric>>>,
}

impl KnownPhraseSim {
    pub fn new(creator: Arc<dyn PhraseCreator>, metric: Arc<Metric>) -> Self {
        Self {
            creator,
            metric,
            phrases: PhraseDictionary::new(),
            vectors: RwLock::new(AHashMap::new()),
            space: RwLock::new(None),
        }
    }

    /// Register a phrase under the next unused id and attach its vectors
    ///
    /// Phrases the creator cannot map still get an id; they simply never
    /// appear as neighbours.
    pub fn add_phrase(&self, text: &str) -> Result<PhraseId> {
        let id = self.phrases.intern(text)?;
        if self.vectors.read().contains_key(&id) {
            return Ok(id);
        }
        if let Some(probe) = self.creator.create(text)? {
            let mut vectors = self.vectors.write();
            vectors.entry(id).or_insert(probe);
            *self.space.write() = None;
        }
        Ok(id)
    }

    pub fn resolve(&self, text: &str) -> Option<PhraseId> {
        self.phrases.resolve(text)
    }

    pub fn phrase(&self, id: PhraseId) -> Option<String> {
        self.phrases.phrase(id)
    }

    pub fn has_vectors(&self, id: PhraseId) -> bool {
        self.vectors.read().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.phrases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phrases.is_empty()
    }

    /// Top-k registered phrases by raw score, best first
    ///
    /// The text need not be registered; unknown text goes through the creator.
    pub fn most_similar(&self, text: &str, k: usize) -> Result<Vec<(PhraseId, f32)>> {
        let known = self
            .resolve(text)
            .and_then(|id| self.vectors.read().get(&id).cloned());
        let probe = match known {
            Some(probe) => probe,
            None => self
                .creator
                .create(text)?
                .ok_or_else(|| Error::not_found(format!("phrase '{}'", text)))?,
        };

        let space = self.space()?;
        let ranked = space.most_similar(&Probe::Vectors(&probe), k, None)?;
        Ok(ranked.into_iter().map(|(id, score)| (PhraseId(id.get()), score)).collect())
    }

    fn space(&self) -> Result<Arc<Metric>> {
        // Lock order: vectors, then space (same as add_phrase)
        let vectors = self.vectors.read();
        if let Some(space) = self.space.read().as_ref() {
            return Ok(space.clone());
        }

        let space = match self.metric.as_ref() {
            Metric::Ensemble(ensemble) => {
                let members = ensemble
                    .members()
                    .iter()
                    .map(|member| {
                        let metric = phrase_metric(member.metric(), &vectors)?;
                        Ok(EnsembleMember::new(
                            Arc::new(metric),
                            member.normalizer().clone(),
                            member.coefficient(),
                        ))
                    })
                    .collect::<Result<Vec<_>>>()?;
                Metric::Ensemble(EnsembleMetric::new(
                    ensemble.name(),
                    ensemble.language(),
                    members,
                    EnsembleMode::Exact,
                )?)
            }
            metric => phrase_metric(metric, &vectors)?,
        };
        debug!("Built phrase space for {} over {} phrases", self.metric.name(), vectors.len());

        let space = Arc::new(space);
        *self.space.write() = Some(space.clone());
        Ok(space)
    }
}

/// Matrix-backed metric of the same kind and scorer whose rows are phrases
fn phrase_metric(metric: &Metric, vectors: &AHashMap<PhraseId, ProbeVectors>) -> Result<Metric> {
    let matrix_metric: &MatrixMetric = metric
        .as_matrix()
        .ok_or_else(|| Error::config(format!("metric {} is not matrix-backed", metric.name())))?;
    let key = MatrixKey::new(metric.name(), metric.language());
    let entries = vectors
        .iter()
        .filter_map(|(id, probe)| {
            probe
                .get(metric.name())
                .map(|vector| (Concept::new(ConceptId(id.0)), vector.clone()))
        })
        .collect();
    let matrix = FeatureMatrix::new(key.clone(), 0, entries)?;
    Metric::matrix(
        metric.kind(),
        key,
        Arc::new(MatrixSlot::with_value(matrix)),
        Some(matrix_metric.scorer()),
    )
}
