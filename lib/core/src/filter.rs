// Candidate filters for mostSimilar scans
use crate::ConceptId;
use ahash::AHashSet;

pub trait Filter: Sync {
    fn matches(&self, id: ConceptId) -> bool;
}

pub struct CandidateFilter {
    condition: FilterCondition,
}

#[derive(Debug, Clone)]
pub enum FilterCondition {
    /// Only these concepts may appear in results
    Only(AHashSet<ConceptId>),
    /// These concepts never appear in results
    Exclude(AHashSet<ConceptId>),
    And(Vec<FilterCondition>),
    Or(Vec<FilterCondition>),
    Not(Box<FilterCondition>),
}

impl CandidateFilter {
    pub fn new(condition: FilterCondition) -> Self {
        Self { condition }
    }

    pub fn only<I: IntoIterator<Item = ConceptId>>(ids: I) -> Self {
        Self::new(FilterCondition::Only(ids.into_iter().collect()))
    }

    pub fn exclude<I: IntoIterator<Item = ConceptId>>(ids: I) -> Self {
        Self::new(FilterCondition::Exclude(ids.into_iter().collect()))
    }

    pub fn condition(&self) -> &FilterCondition {
        &self.condition
    }

    fn matches_condition(condition: &FilterCondition, id: ConceptId) -> bool {
        match condition {
            FilterCondition::Only(ids) => ids.contains(&id),
            FilterCondition::Exclude(ids) => !ids.contains(&id),
            FilterCondition::And(conditions) => {
                conditions.iter().all(|c| Self::matches_condition(c, id))
            }
            FilterCondition::Or(conditions) => {
                conditions.iter().any(|c| Self::matches_condition(c, id))
            }
            FilterCondition::Not(condition) => !Self::matches_condition(condition, id),
        }
    }
}

impl Filter for CandidateFilter {
    fn matches(&self, id: ConceptId) -> bool {
        Self::matches_condition(&self.condition, id)
    }
}

/// Excludes one concept, typically the query itself
pub struct ExcludeOne(pub ConceptId);

impl Filter for ExcludeOne {
    fn matches(&self, id: ConceptId) -> bool {
        id != self.0
    }
}

/// Conjunction of two borrowed filters
pub struct Both<'a>(pub &'a dyn Filter, pub &'a dyn Filter);

impl Filter for Both<'_> {
    fn matches(&self, id: ConceptId) -> bool {
        self.0.matches(id) && self.1.matches(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_and_exclude() {
        let only = CandidateFilter::only([ConceptId(1), ConceptId(2)]);
        assert!(only.matches(ConceptId(1)));
        assert!(!only.matches(ConceptId(3)));

        let exclude = CandidateFilter::exclude([ConceptId(1)]);
        assert!(!exclude.matches(ConceptId(1)));
        assert!(exclude.matches(ConceptId(3)));
    }

    #[test]
    fn test_composite_conditions() {
        let filter = CandidateFilter::new(FilterCondition::And(vec![
            FilterCondition::Only([ConceptId(1), ConceptId(2), ConceptId(3)].into_iter().collect()),
            FilterCondition::Not(Box::new(FilterCondition::Only(
                [ConceptId(2)].into_iter().collect(),
            ))),
        ]));
        assert!(filter.matches(ConceptId(1)));
        assert!(!filter.matches(ConceptId(2)));
        assert!(!filter.matches(ConceptId(4)));
    }

    #[test]
    fn test_both() {
        let a = ExcludeOne(ConceptId(1));
        let b = CandidateFilter::exclude([ConceptId(2)]);
        let both = Both(&a, &b);
        assert!(!both.matches(ConceptId(1)));
        assert!(!both.matches(ConceptId(2)));
        assert!(both.matches(ConceptId(3)));
    }
}
