use serde::{Deserialize, Serialize};

/// Dense, per-language concept identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConceptId(pub u32);

impl ConceptId {
    #[inline]
    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for ConceptId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for ConceptId {
    fn from(id: u32) -> Self {
        ConceptId(id)
    }
}

/// A concept with an optional display label (article title or phrase)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Concept {
    pub id: ConceptId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl Concept {
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<ConceptId>) -> Self {
        Self {
            id: id.into(),
            label: None,
        }
    }

    #[inline]
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

impl From<ConceptId> for Concept {
    fn from(id: ConceptId) -> Self {
        Concept::new(id)
    }
}
