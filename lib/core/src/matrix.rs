use crate::{Concept, ConceptId, Error, FeatureVector, Result, Slot};
use ahash::AHashMap;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Identifies one feature matrix: a metric in a language
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MatrixKey {
    pub metric: String,
    pub language: String,
}

impl MatrixKey {
    pub fn new(metric: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            metric: metric.into(),
            language: language.into(),
        }
    }
}

impl std::fmt::Display for MatrixKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.metric, self.language)
    }
}

/// Immutable mapping from concept id to feature vector
///
/// Concepts are kept in ascending id order so that scans, samples and
/// rankings are deterministic for a given build.
#[derive(Debug)]
pub struct FeatureMatrix {
    key: MatrixKey,
    version: u64,
    ids: Vec<ConceptId>,
    index: AHashMap<ConceptId, usize>,
    vectors: Vec<FeatureVector>,
    labels: Vec<Option<String>>,
}

/// Live, swappable feature matrix for one key
pub type MatrixSlot = Slot<FeatureMatrix>;

impl FeatureMatrix {
    pub fn new(key: MatrixKey, version: u64, mut entries: Vec<(Concept, FeatureVector)>) -> Result<Self> {
        entries.sort_by_key(|(concept, _)| concept.id);
        if let Some(pair) = entries.windows(2).find(|w| w[0].0.id == w[1].0.id) {
            return Err(Error::config(format!(
                "duplicate concept {} in feature matrix {}",
                pair[0].0.id, key
            )));
        }

        let mut ids = Vec::with_capacity(entries.len());
        let mut index = AHashMap::with_capacity(entries.len());
        let mut vectors = Vec::with_capacity(entries.len());
        let mut labels = Vec::with_capacity(entries.len());
        for (i, (concept, vector)) in entries.into_iter().enumerate() {
            ids.push(concept.id);
            index.insert(concept.id, i);
            vectors.push(vector);
            labels.push(concept.label);
        }

        Ok(Self {
            key,
            version,
            ids,
            index,
            vectors,
            labels,
        })
    }

    #[inline]
    pub fn key(&self) -> &MatrixKey {
        &self.key
    }

    #[inline]
    pub fn version(&self) -> u64 {
        self.version
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Concept ids in ascending order
    #[inline]
    pub fn ids(&self) -> &[ConceptId] {
        &self.ids
    }

    #[inline]
    pub fn contains(&self, id: ConceptId) -> bool {
        self.index.contains_key(&id)
    }

    #[inline]
    pub fn get(&self, id: ConceptId) -> Option<&FeatureVector> {
        self.index.get(&id).map(|&i| &self.vectors[i])
    }

    pub fn label(&self, id: ConceptId) -> Option<&str> {
        self.index
            .get(&id)
            .and_then(|&i| self.labels[i].as_deref())
    }

    pub fn iter(&self) -> impl Iterator<Item = (ConceptId, &FeatureVector)> + '_ {
        self.ids.iter().copied().zip(self.vectors.iter())
    }

    pub fn par_iter(&self) -> impl IndexedParallelIterator<Item = (ConceptId, &FeatureVector)> + '_ {
        self.ids.par_iter().copied().zip(self.vectors.par_iter())
    }

    /// Iterate id, label and vector together (used when persisting)
    pub fn entries(&self) -> impl Iterator<Item = (ConceptId, Option<&str>, &FeatureVector)> + '_ {
        self.ids
            .iter()
            .zip(self.labels.iter())
            .zip(self.vectors.iter())
            .map(|((&id, label), vector)| (id, label.as_deref(), vector))
    }
}
