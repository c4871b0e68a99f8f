//! Ensemble metric
//!
//! Combines several matrix-backed member metrics into one score:
//!
//! ```text
//! score(A, B) = Σ coefficient_i · normalize_i(member_i(A, B))
//! ```
//!
//! Member scores are normalized before weighting because their raw scales are
//! unrelated. Members are kept in name order, so the floating-point sum does
//! not depend on the order in which the ensemble was configured.

use super::{MatrixMetric, Metric, Probe};
use crate::filter::Filter;
use crate::matrix::FeatureMatrix;
use crate::normalizer::{Normalizer, NormalizerModel, NormalizerSlot};
use crate::result::TopK;
use crate::{ConceptId, Error, FeatureVector, Result};
use ahash::AHashSet;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::sync::Arc;
use tracing::debug;

/// Ordered (member metric name, coefficient) pairs
///
/// Coefficients need not sum to 1.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnsembleSpec {
    weights: Vec<(String, f32)>,
}

impl EnsembleSpec {
    pub fn new(weights: Vec<(String, f32)>) -> Result<Self> {
        let spec = Self { weights };
        spec.validate()?;
        Ok(spec)
    }

    /// Checks that the spec is non-empty, coefficients are finite and
    /// non-negative, and no member is listed twice
    pub fn validate(&self) -> Result<()> {
        if self.weights.is_empty() {
            return Err(Error::config("ensemble has no members"));
        }
        let mut seen = AHashSet::with_capacity(self.weights.len());
        for (name, coefficient) in &self.weights {
            if !coefficient.is_finite() || *coefficient < 0.0 {
                return Err(Error::config(format!(
                    "ensemble coefficient for '{}' must be finite and non-negative, got {}",
                    name, coefficient
                )));
            }
            if !seen.insert(name.as_str()) {
                return Err(Error::config(format!("ensemble lists '{}' more than once", name)));
            }
        }
        Ok(())
    }

    #[inline]
    pub fn weights(&self) -> &[(String, f32)] {
        &self.weights
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }
}

/// How an ensemble answers mostSimilar
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum EnsembleMode {
    /// Score every concept known to any member
    #[default]
    Exact,
    /// Take the top `size` candidates of one member, then re-score them with
    /// the full ensemble
    Shortlist { metric: String, size: usize },
}

/// A member metric, its normalizer and its coefficient
#[derive(Debug, Clone)]
pub struct EnsembleMember {
    metric: Arc<Metric>,
    normalizer: Arc<NormalizerSlot>,
    coefficient: f32,
}

impl EnsembleMember {
    pub fn new(metric: Arc<Metric>, normalizer: Arc<NormalizerSlot>, coefficient: f32) -> Self {
        Self {
            metric,
            normalizer,
            coefficient,
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        self.metric.name()
    }

    #[inline]
    pub fn coefficient(&self) -> f32 {
        self.coefficient
    }

    pub fn metric(&self) -> &Arc<Metric> {
        &self.metric
    }

    pub fn normalizer(&self) -> &Arc<NormalizerSlot> {
        &self.normalizer
    }
}

/// One member's share of an ensemble score
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Contribution {
    pub metric: String,
    pub coefficient: f32,
    /// None when the member does not know one of the two concepts
    pub raw: Option<f32>,
    pub normalized: Option<f32>,
    pub weighted: f32,
}

/// An ensemble score with its per-member breakdown
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExplainedScore {
    pub score: f32,
    pub contributions: Vec<Contribution>,
}

#[derive(Debug)]
pub struct EnsembleMetric {
    name: String,
    language: String,
    members: SmallVec<[EnsembleMember; 4]>,
    mode: EnsembleMode,
}

/// Snapshot of one member taken at the start of a query
struct MemberView<'e> {
    member: &'e EnsembleMember,
    metric: &'e MatrixMetric,
    matrix: Arc<FeatureMatrix>,
    normalizer: Arc<Normalizer>,
}

impl EnsembleMetric {
    pub fn new(
        name: impl Into<String>,
        language: impl Into<String>,
        members: Vec<EnsembleMember>,
        mode: EnsembleMode,
    ) -> Result<Self> {
        let name = name.into();
        let language = language.into();

        let spec = EnsembleSpec {
            weights: members
                .iter()
                .map(|m| (m.name().to_string(), m.coefficient))
                .collect(),
        };
        spec.validate()?;

        for member in &members {
            if member.metric.as_matrix().is_none() {
                return Err(Error::config(format!(
                    "ensemble '{}' cannot contain ensemble '{}'",
                    name,
                    member.name()
                )));
            }
            if member.metric.language() != language {
                return Err(Error::config(format!(
                    "ensemble '{}' ({}) cannot use member '{}' from language '{}'",
                    name,
                    language,
                    member.name(),
                    member.metric.language()
                )));
            }
        }

        if let EnsembleMode::Shortlist { metric, size } = &mode {
            if !members.iter().any(|m| m.name() == metric) {
                return Err(Error::config(format!(
                    "shortlist metric '{}' is not a member of ensemble '{}'",
                    metric, name
                )));
            }
            if *size == 0 {
                return Err(Error::config("shortlist size must be positive"));
            }
        }

        let mut members: SmallVec<[EnsembleMember; 4]> = members.into_iter().collect();
        members.sort_by(|a, b| a.name().cmp(b.name()));

        Ok(Self {
            name,
            language,
            members,
            mode,
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn mode(&self) -> &EnsembleMode {
        &self.mode
    }

    /// Members in canonical (name) order
    pub fn members(&self) -> &[EnsembleMember] {
        &self.members
    }

    pub fn ensure_built(&self) -> Result<()> {
        for member in &self.members {
            member.metric.ensure_built()?;
        }
        Ok(())
    }

    pub fn contains(&self, id: ConceptId) -> Result<bool> {
        let views = self.views()?;
        Ok(views.iter().any(|v| v.matrix.contains(id)))
    }

    /// NotFitted if any member normalizer is missing or unfitted
    pub fn ensure_fitted(&self) -> Result<()> {
        for member in &self.members {
            self.fitted_normalizer(member)?;
        }
        Ok(())
    }

    fn fitted_normalizer(&self, member: &EnsembleMember) -> Result<Arc<Normalizer>> {
        member
            .normalizer
            .load()
            .filter(|n| n.is_fitted())
            .ok_or_else(|| {
                Error::NotFitted(format!(
                    "normalizer for {} in ensemble {}",
                    member.name(),
                    self.name
                ))
            })
    }

    fn views(&self) -> Result<Vec<MemberView<'_>>> {
        let normalizers = self
            .members
            .iter()
            .map(|m| self.fitted_normalizer(m))
            .collect::<Result<Vec<_>>>()?;

        self.members
            .iter()
            .zip(normalizers)
            .map(|(member, normalizer)| {
                let metric = member.metric.as_matrix().ok_or_else(|| {
                    Error::config(format!("ensemble member '{}' is not matrix-backed", member.name()))
                })?;
                Ok(MemberView {
                    member,
                    metric,
                    matrix: metric.snapshot()?,
                    normalizer,
                })
            })
            .collect()
    }

    fn resolve_queries<'a>(
        &self,
        views: &'a [MemberView<'_>],
        probe: &Probe<'a>,
    ) -> Result<Vec<Option<&'a FeatureVector>>> {
        let queries: Vec<_> = views
            .iter()
            .map(|v| v.metric.resolve(&v.matrix, probe).ok())
            .collect();
        if queries.iter().all(Option::is_none) {
            return Err(Error::not_found(format!("{} in ensemble {}", probe, self.name)));
        }
        Ok(queries)
    }

    pub fn similarity(&self, a: ConceptId, b: ConceptId) -> Result<f32> {
        self.probe_similarity(&Probe::Concept(a), b)
    }

    pub fn probe_similarity(&self, probe: &Probe<'_>, b: ConceptId) -> Result<f32> {
        let views = self.views()?;
        let queries = self.resolve_queries(&views, probe)?;
        combine(&views, &queries, b)?
            .ok_or_else(|| Error::not_found(format!("concept {} in ensemble {}", b, self.name)))
    }

    /// Score a pair and report each member's raw, normalized and weighted share
    pub fn explain(&self, probe: &Probe<'_>, b: ConceptId) -> Result<ExplainedScore> {
        let views = self.views()?;
        let queries = self.resolve_queries(&views, probe)?;
        if !views.iter().any(|v| v.matrix.contains(b)) {
            return Err(Error::not_found(format!("concept {} in ensemble {}", b, self.name)));
        }

        let mut score = 0.0f32;
        let mut contributions = Vec::with_capacity(views.len());
        for (view, query) in views.iter().zip(&queries) {
            let coefficient = view.member.coefficient;
            let (raw, normalized) = match (query, view.matrix.get(b)) {
                (Some(query), Some(other)) => {
                    let raw = view.metric.scorer().score(query, other, view.matrix.len());
                    (Some(raw), Some(view.normalizer.normalize(raw)?))
                }
                _ => (None, None),
            };
            let weighted = normalized.map_or(0.0, |n| coefficient * n);
            score += weighted;
            contributions.push(Contribution {
                metric: view.member.name().to_string(),
                coefficient,
                raw,
                normalized,
                weighted,
            });
        }
        Ok(ExplainedScore { score, contributions })
    }

    /// Top-k by ensemble score, best first
    pub fn most_similar(
        &self,
        probe: &Probe<'_>,
        k: usize,
        filter: Option<&dyn Filter>,
    ) -> Result<Vec<(ConceptId, f32)>> {
        self.most_similar_ranked(probe, k, filter, &NormalizerModel::Identity)
    }

    /// Top-k ranked by `rank` applied to each ensemble score
    pub fn most_similar_ranked(
        &self,
        probe: &Probe<'_>,
        k: usize,
        filter: Option<&dyn Filter>,
        rank: &NormalizerModel,
    ) -> Result<Vec<(ConceptId, f32)>> {
        let views = self.views()?;
        let queries = self.resolve_queries(&views, probe)?;
        let candidates = self.candidates(&views, &queries, filter);

        let top = candidates
            .par_iter()
            .filter(|id| filter.map_or(true, |f| f.matches(**id)))
            .try_fold(
                || TopK::new(k),
                |mut top, &id| -> Result<TopK> {
                    if let Some(score) = combine(&views, &queries, id)? {
                        top.push_ranked(id, rank.apply(score), score);
                    }
                    Ok(top)
                },
            )
            .try_reduce(|| TopK::new(k), |a, b| Ok(a.merge(b)))?;
        Ok(top.into_sorted_vec())
    }

    fn candidates(
        &self,
        views: &[MemberView<'_>],
        queries: &[Option<&FeatureVector>],
        filter: Option<&dyn Filter>,
    ) -> Vec<ConceptId> {
        if let EnsembleMode::Shortlist { metric, size } = &self.mode {
            let shortlist = views
                .iter()
                .zip(queries)
                .find(|(v, _)| v.member.name() == metric);
            match shortlist {
                Some((view, Some(query))) => {
                    return view
                        .metric
                        .scan(&view.matrix, query, *size, filter)
                        .into_iter()
                        .map(|(id, _)| id)
                        .collect();
                }
                _ => debug!(
                    "Ensemble {}: shortlist metric {} cannot resolve the probe, scanning all concepts",
                    self.name, metric
                ),
            }
        }

        let mut ids: Vec<ConceptId> = views
            .iter()
            .flat_map(|v| v.matrix.ids().iter().copied())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Row-major |rows| x |cols| ensemble scores
    pub fn cosimilarity(&self, rows: &[ConceptId], cols: &[ConceptId]) -> Result<Vec<f32>> {
        let views = self.views()?;
        let row_queries = rows
            .iter()
            .map(|&id| self.resolve_queries(&views, &Probe::Concept(id)))
            .collect::<Result<Vec<_>>>()?;
        if let Some(col) = cols.iter().find(|&&c| !views.iter().any(|v| v.matrix.contains(c))) {
            return Err(Error::not_found(format!("concept {} in ensemble {}", col, self.name)));
        }

        let mut cells = vec![0.0f32; rows.len() * cols.len()];
        if cells.is_empty() {
            return Ok(cells);
        }
        cells
            .par_chunks_mut(cols.len())
            .zip(row_queries.par_iter())
            .try_for_each(|(out, queries)| -> Result<()> {
                for (cell, &col) in out.iter_mut().zip(cols) {
                    *cell = combine(&views, queries, col)?.unwrap_or(0.0);
                }
                Ok(())
            })?;
        Ok(cells)
    }
}

/// Weighted sum of normalized member scores; None if no member knows `candidate`
fn combine(
    views: &[MemberView<'_>],
    queries: &[Option<&FeatureVector>],
    candidate: ConceptId,
) -> Result<Option<f32>> {
    let mut total = 0.0f32;
    let mut known = false;
    for (view, query) in views.iter().zip(queries) {
        let Some(other) = view.matrix.get(candidate) else {
            continue;
        };
        known = true;
        if let Some(query) = query {
            let raw = view.metric.scorer().score(query, other, view.matrix.len());
            total += view.member.coefficient * view.normalizer.normalize(raw)?;
        }
    }
    Ok(known.then_some(total))
}
