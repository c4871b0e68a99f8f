use crate::{Concept, ConceptId, FeatureVector, Result};
use std::collections::BTreeMap;

/// Supplies raw per-concept feature contributions to a build
///
/// How contributions are computed (term statistics, link sets, category
/// membership, a trained embedding) is up to the implementation.
pub trait FeatureSource: Send + Sync {
    /// The corpus: every concept the source can be asked about
    fn concepts(&self) -> Result<Vec<Concept>>;

    /// Contribution for one concept; `None` means the concept has no vector
    fn contribution(&self, id: ConceptId) -> Result<Option<FeatureVector>>;
}

/// In-memory feature source
#[derive(Debug, Clone, Default)]
pub struct StaticFeatureSource {
    entries: BTreeMap<ConceptId, (Option<String>, Option<FeatureVector>)>,
}

impl StaticFeatureSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, concept: Concept, vector: FeatureVector) {
        self.entries.insert(concept.id, (concept.label, Some(vector)));
    }

    /// A corpus member with no contribution
    pub fn insert_missing(&mut self, concept: Concept) {
        self.entries.insert(concept.id, (concept.label, None));
    }

    pub fn with(mut self, id: u32, pairs: &[(u32, f32)]) -> Self {
        self.insert(Concept::new(id), FeatureVector::new(pairs.iter().copied()));
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FeatureSource for StaticFeatureSource {
    fn concepts(&self) -> Result<Vec<Concept>> {
        Ok(self
            .entries
            .iter()
            .map(|(id, (label, _))| Concept {
                id: *id,
                label: label.clone(),
            })
            .collect())
    }

    fn contribution(&self, id: ConceptId) -> Result<Option<FeatureVector>> {
        Ok(self.entries.get(&id).and_then(|(_, vector)| vector.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_source() {
        let mut source = StaticFeatureSource::new().with(2, &[(1, 1.0)]).with(1, &[(2, 1.0)]);
        source.insert_missing(Concept::new(3u32).with_label("Orphan"));

        let ids: Vec<_> = source.concepts().unwrap().iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![ConceptId(1), ConceptId(2), ConceptId(3)]);
        assert!(source.contribution(ConceptId(1)).unwrap().is_some());
        assert!(source.contribution(ConceptId(3)).unwrap().is_none());
        assert!(source.contribution(ConceptId(9)).unwrap().is_none());
    }
}
