//! Phrase dictionary, phrase-to-vector creation and phrase-keyed queries

pub mod creator;
pub mod eval;
pub mod known;
pub mod resolver;

pub use creator::{CentroidPhraseCreator, PhraseCreator};
pub use eval::{default_bundles, read_bundles, Bundle, EvalOptions, EvalReport, PhraseSimEvaluator};
pub use known::KnownPhraseSim;
pub use resolver::PhraseResolver;

use crate::{ConceptId, Error, Result};
use ahash::AHashMap;
use parking_lot::{RwLock, RwLockUpgradableReadGuard};
use serde::{Deserialize, Serialize};
use std::io::BufRead;

/// Dense id of a phrase within one dictionary
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PhraseId(pub u32);

impl std::fmt::Display for PhraseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Case-fold and collapse runs of whitespace into single spaces
pub fn normalize_phrase(text: &str) -> String {
    text.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Default)]
struct Arena {
    ids: AHashMap<String, PhraseId>,
    texts: Vec<String>,
    concepts: Vec<Option<ConceptId>>,
}

/// Arena of normalized phrases with create-if-absent interning
///
/// Insertion takes an upgradable read lock: concurrent lookups proceed, and
/// only one inserter at a time can upgrade, so a phrase is assigned exactly
/// one id no matter how many threads add it.
#[derive(Debug, Default)]
pub struct PhraseDictionary {
    arena: RwLock<Arena>,
}

impl PhraseDictionary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern `text`, recording `concept` if the phrase has none yet
    pub fn add_phrase(&self, text: &str, concept: Option<ConceptId>) -> Result<PhraseId> {
        let normalized = normalize_phrase(text);
        if normalized.is_empty() {
            return Err(Error::config("cannot add an empty phrase"));
        }

        let arena = self.arena.upgradable_read();
        if let Some(&id) = arena.ids.get(&normalized) {
            let idx = id.0 as usize;
            if let (Some(concept), None) = (concept, arena.concepts[idx]) {
                let mut arena = RwLockUpgradableReadGuard::upgrade(arena);
                arena.concepts[idx] = Some(concept);
            }
            return Ok(id);
        }

        let mut arena = RwLockUpgradableReadGuard::upgrade(arena);
        let next = u32::try_from(arena.texts.len())
            .map_err(|_| Error::config("phrase dictionary is full"))?;
        let id = PhraseId(next);
        arena.ids.insert(normalized.clone(), id);
        arena.texts.push(normalized);
        arena.concepts.push(concept);
        Ok(id)
    }

    pub fn intern(&self, text: &str) -> Result<PhraseId> {
        self.add_phrase(text, None)
    }

    pub fn resolve(&self, text: &str) -> Option<PhraseId> {
        self.arena.read().ids.get(&normalize_phrase(text)).copied()
    }

    /// Concept recorded for a phrase, if any
    pub fn concept_of(&self, text: &str) -> Option<ConceptId> {
        let arena = self.arena.read();
        let id = arena.ids.get(&normalize_phrase(text))?;
        arena.concepts[id.0 as usize]
    }

    pub fn phrase(&self, id: PhraseId) -> Option<String> {
        self.arena.read().texts.get(id.0 as usize).cloned()
    }

    pub fn concept(&self, id: PhraseId) -> Option<ConceptId> {
        self.arena.read().concepts.get(id.0 as usize).copied().flatten()
    }

    pub fn len(&self) -> usize {
        self.arena.read().texts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Load `phrase<TAB>concept id` lines; blank lines and `#` comments are skipped
    pub fn load_tsv<R: BufRead>(&self, reader: R) -> Result<usize> {
        let mut loaded = 0;
        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim_end_matches(['\r', '\n']);
            if line.trim().is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split('\t');
            let (Some(text), Some(concept)) = (fields.next(), fields.next()) else {
                return Err(Error::Serialization(format!(
                    "line {}: expected 'phrase<TAB>concept id'",
                    lineno + 1
                )));
            };
            let concept: u32 = concept.trim().parse().map_err(|_| {
                Error::Serialization(format!("line {}: bad concept id '{}'", lineno + 1, concept))
            })?;
            self.add_phrase(text, Some(ConceptId(concept)))?;
            loaded += 1;
        }
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_normalize_phrase() {
        assert_eq!(normalize_phrase("  Jazz \t  MUSIC\n"), "jazz music");
        assert_eq!(normalize_phrase("   "), "");
    }

    #[test]
    fn test_create_if_absent() {
        let dict = PhraseDictionary::new();
        let a = dict.add_phrase("Jazz Music", None).unwrap();
        let b = dict.add_phrase("jazz   music", Some(ConceptId(7))).unwrap();
        let c = dict.add_phrase("blues", Some(ConceptId(8))).unwrap();

        assert_eq!(a, b);
        assert_eq!((a, c), (PhraseId(0), PhraseId(1)));
        assert_eq!(dict.phrase(a).as_deref(), Some("jazz music"));
        assert_eq!(dict.concept(a), Some(ConceptId(7)));
        assert!(dict.add_phrase(" ", None).is_err());
    }

    #[test]
    fn test_first_concept_wins() {
        let dict = PhraseDictionary::new();
        dict.add_phrase("brain", Some(ConceptId(1))).unwrap();
        dict.add_phrase("Brain", Some(ConceptId(2))).unwrap();
        assert_eq!(dict.concept_of("BRAIN"), Some(ConceptId(1)));
        assert_eq!(dict.concept_of("mind"), None);
    }

    #[test]
    fn test_concurrent_interning_assigns_dense_unique_ids() {
        let dict = Arc::new(PhraseDictionary::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let dict = dict.clone();
                std::thread::spawn(move || {
                    (0..200)
                        .map(|i| {
                            // Every thread inserts the same phrases in a different order
                            let n = (i * 7 + t * 13) % 200;
                            (n, dict.intern(&format!("phrase {}", n)).unwrap())
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut assigned: AHashMap<u32, PhraseId> = AHashMap::new();
        for handle in handles {
            for (n, id) in handle.join().unwrap() {
                let previous = *assigned.entry(n).or_insert(id);
                assert_eq!(previous, id, "phrase {} got two ids", n);
            }
        }
        assert_eq!(dict.len(), 200);
        let mut ids: Vec<u32> = assigned.values().map(|id| id.0).collect();
        ids.sort_unstable();
        assert_eq!(ids, (0..200).collect::<Vec<_>>());
    }

    #[test]
    fn test_load_tsv() {
        let dict = PhraseDictionary::new();
        let text = "# phrase\tconcept\njazz\t1\nBlues Music\t2\n\n";
        assert_eq!(dict.load_tsv(text.as_bytes()).unwrap(), 2);
        assert_eq!(dict.concept_of("blues music"), Some(ConceptId(2)));
        assert!(dict.load_tsv("jazz\n".as_bytes()).is_err());
        assert!(dict.load_tsv("jazz\tx\n".as_bytes()).is_err());
    }
}
