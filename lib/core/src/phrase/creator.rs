use super::{normalize_phrase, PhraseDictionary};
use crate::metric::{Metric, ProbeVectors};
use crate::{ConceptId, FeatureVector, Result};
use std::sync::Arc;

/// Longest n-gram matched against the dictionary
pub const MAX_NGRAM: usize = 4;

/// Turns free text into per-metric probe vectors
pub trait PhraseCreator: Send + Sync {
    /// `Ok(None)` when nothing in the text can be mapped to concept space
    fn create(&self, text: &str) -> Result<Option<ProbeVectors>>;
}

/// Averages the vectors of the concepts mentioned in a phrase
///
/// Tokens are matched greedily left to right, longest n-gram first, against
/// phrases in the dictionary that carry a concept.
pub struct CentroidPhraseCreator {
    dictionary: Arc<PhraseDictionary>,
    metrics: Vec<Arc<Metric>>,
}

impl CentroidPhraseCreator {
    /// Creator feeding `metric`; an ensemble contributes its members
    pub fn new(dictionary: Arc<PhraseDictionary>, metric: &Arc<Metric>) -> Self {
        let metrics = match metric.as_ensemble() {
            Some(ensemble) => ensemble.members().iter().map(|m| m.metric().clone()).collect(),
            None => vec![metric.clone()],
        };
        Self { dictionary, metrics }
    }

    /// Concepts mentioned in the text, in order of appearance
    pub fn concepts(&self, text: &str) -> Vec<ConceptId> {
        let normalized = normalize_phrase(text);
        let tokens: Vec<&str> = normalized.split(' ').filter(|t| !t.is_empty()).collect();
        let mut concepts = Vec::new();
        let mut i = 0;
        while i < tokens.len() {
            let longest = MAX_NGRAM.min(tokens.len() - i);
            let matched = (1..=longest).rev().find_map(|len| {
                self.dictionary
                    .concept_of(&tokens[i..i + len].join(" "))
                    .map(|concept| (len, concept))
            });
            match matched {
                Some((len, concept)) => {
                    concepts.push(concept);
                    i += len;
                }
                None => i += 1,
            }
        }
        concepts
    }
}

impl PhraseCreator for CentroidPhraseCreator {
    fn create(&self, text: &str) -> Result<Option<ProbeVectors>> {
        let concepts = self.concepts(text);
        if concepts.is_empty() {
            return Ok(None);
        }

        let mut probe = ProbeVectors::new();
        for metric in &self.metrics {
            let Some(matrix_metric) = metric.as_matrix() else {
                continue;
            };
            // Unbuilt metrics are reported by the query that follows
            let Ok(matrix) = matrix_metric.snapshot() else {
                continue;
            };
            let vectors: Vec<&FeatureVector> = concepts.iter().filter_map(|&c| matrix.get(c)).collect();
            if !vectors.is_empty() {
                probe.insert(metric.name(), FeatureVector::centroid(&vectors));
            }
        }
        Ok((!probe.is_empty()).then_some(probe))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::{FeatureMatrix, MatrixKey, MatrixSlot};
    use crate::metric::MetricKind;
    use crate::Concept;

    fn setup() -> (Arc<PhraseDictionary>, Arc<Metric>) {
        let dict = Arc::new(PhraseDictionary::new());
        dict.add_phrase("jazz", Some(ConceptId(1))).unwrap();
        dict.add_phrase("blues", Some(ConceptId(2))).unwrap();
        dict.add_phrase("jazz music", Some(ConceptId(3))).unwrap();
        dict.intern("music").unwrap();

        let key = MatrixKey::new("esa", "simple");
        let matrix = FeatureMatrix::new(
            key.clone(),
            1,
            vec![
                (Concept::new(1u32), FeatureVector::new([(1, 2.0)])),
                (Concept::new(2u32), FeatureVector::new([(2, 2.0)])),
                (Concept::new(3u32), FeatureVector::new([(3, 2.0)])),
            ],
        )
        .unwrap();
        let metric = Metric::matrix(MetricKind::Vector, key, Arc::new(MatrixSlot::with_value(matrix)), None).unwrap();
        (dict, Arc::new(metric))
    }

    #[test]
    fn test_longest_match_first() {
        let (dict, metric) = setup();
        let creator = CentroidPhraseCreator::new(dict, &metric);
        assert_eq!(creator.concepts("Jazz Music and blues"), vec![ConceptId(3), ConceptId(2)]);
        assert_eq!(creator.concepts("jazz"), vec![ConceptId(1)]);
        // "music" is known but has no concept
        assert!(creator.concepts("music").is_empty());
    }

    #[test]
    fn test_centroid_probe() {
        let (dict, metric) = setup();
        let creator = CentroidPhraseCreator::new(dict, &metric);
        let probe = creator.create("jazz blues").unwrap().unwrap();
        let vector = probe.get("esa").unwrap();
        assert_eq!(vector.get(1), 1.0);
        assert_eq!(vector.get(2), 1.0);
        assert!(creator.create("opera").unwrap().is_none());
    }
}
