use super::{PhraseCreator, PhraseDictionary, PhraseId};
use crate::engine::QueryEngine;
use crate::filter::Filter;
use crate::metric::ProbeVectors;
use crate::result::{ResultList, SimilarityResult};
use crate::{ConceptId, Error, Result};
use std::sync::Arc;

/// Phrase-keyed front end to the query engine for one (language, metric)
pub struct PhraseResolver {
    dictionary: Arc<PhraseDictionary>,
    engine: Arc<QueryEngine>,
    creator: Option<Arc<dyn PhraseCreator>>,
    language: String,
    metric: String,
}

impl PhraseResolver {
    pub fn new(
        dictionary: Arc<PhraseDictionary>,
        engine: Arc<QueryEngine>,
        language: impl Into<String>,
        metric: impl Into<String>,
    ) -> Self {
        Self {
            dictionary,
            engine,
            creator: None,
            language: language.into(),
            metric: metric.into(),
        }
    }

    pub fn with_creator(mut self, creator: Arc<dyn PhraseCreator>) -> Self {
        self.creator = Some(creator);
        self
    }

    pub fn dictionary(&self) -> &Arc<PhraseDictionary> {
        &self.dictionary
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn metric(&self) -> &str {
        &self.metric
    }

    pub fn add_phrase(&self, text: &str, concept: Option<ConceptId>) -> Result<PhraseId> {
        self.dictionary.add_phrase(text, concept)
    }

    pub fn most_similar(&self, text: &str, k: usize) -> Result<ResultList> {
        self.most_similar_filtered(text, k, None)
    }

    /// Known phrases query by concept; others go through the creator
    pub fn most_similar_filtered(
        &self,
        text: &str,
        k: usize,
        filter: Option<&dyn Filter>,
    ) -> Result<ResultList> {
        if let Some(concept) = self.dictionary.concept_of(text) {
            return self
                .engine
                .most_similar(&self.language, &self.metric, concept, k, filter);
        }
        let probe = self.create(text)?;
        self.engine
            .most_similar_probe(&self.language, &self.metric, &probe, k, filter)
    }

    /// Similarity of two phrases; the second must map to a concept
    pub fn similarity(&self, a: &str, b: &str) -> Result<SimilarityResult> {
        let target = self
            .dictionary
            .concept_of(b)
            .ok_or_else(|| Error::not_found(format!("phrase '{}'", b)))?;
        match self.dictionary.concept_of(a) {
            Some(concept) => self
                .engine
                .similarity(&self.language, &self.metric, concept, target),
            None => {
                let probe = self.create(a)?;
                self.engine
                    .probe_similarity(&self.language, &self.metric, &probe, target)
            }
        }
    }

    fn create(&self, text: &str) -> Result<ProbeVectors> {
        let creator = self
            .creator
            .as_ref()
            .ok_or_else(|| Error::not_found(format!("phrase '{}'", text)))?;
        creator
            .create(text)?
            .ok_or_else(|| Error::not_found(format!("phrase '{}'", text)))
    }
}
