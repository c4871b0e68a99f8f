use super::Probe;
use crate::filter::Filter;
use crate::matrix::{FeatureMatrix, MatrixKey, MatrixSlot};
use crate::normalizer::NormalizerModel;
use crate::result::TopK;
use crate::{ConceptId, Error, FeatureVector, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;

/// Pairwise scoring function over two feature vectors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scorer {
    /// Dot product over the product of L2 norms
    Cosine,
    /// Shared dimensions over the union of dimensions
    Jaccard,
    /// Link-overlap measure relative to the matrix size
    MilneWitten,
}

impl FromStr for Scorer {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "cosine" => Ok(Scorer::Cosine),
            "jaccard" => Ok(Scorer::Jaccard),
            "milne_witten" | "milnewitten" => Ok(Scorer::MilneWitten),
            other => Err(Error::config(format!("unknown scorer '{}'", other))),
        }
    }
}

impl std::fmt::Display for Scorer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Scorer::Cosine => "cosine",
            Scorer::Jaccard => "jaccard",
            Scorer::MilneWitten => "milne_witten",
        })
    }
}

impl Scorer {
    /// Score two vectors; `universe` is the number of concepts in the matrix
    #[inline]
    pub fn score(self, a: &FeatureVector, b: &FeatureVector, universe: usize) -> f32 {
        match self {
            Scorer::Cosine => a.cosine_similarity(b),
            Scorer::Jaccard => a.jaccard(b),
            Scorer::MilneWitten => milne_witten(a, b, universe),
        }
    }
}

fn milne_witten(a: &FeatureVector, b: &FeatureVector, universe: usize) -> f32 {
    let shared = a.overlap(b);
    if shared == 0 {
        return 0.0;
    }
    let (la, lb) = (a.len() as f64, b.len() as f64);
    let larger = la.max(lb);
    let smaller = la.min(lb);
    let n = (universe as f64).max(larger);

    let numerator = larger.ln() - (shared as f64).ln();
    let denominator = n.ln() - smaller.ln();
    if denominator <= 0.0 {
        return if numerator <= 0.0 { 1.0 } else { 0.0 };
    }
    (1.0 - numerator / denominator).clamp(0.0, 1.0) as f32
}

/// A metric backed by one feature matrix slot
#[derive(Debug)]
pub struct MatrixMetric {
    key: MatrixKey,
    slot: Arc<MatrixSlot>,
    scorer: Scorer,
}

impl MatrixMetric {
    pub fn new(key: MatrixKey, slot: Arc<MatrixSlot>, scorer: Scorer) -> Self {
        Self { key, slot, scorer }
    }

    #[inline]
    pub fn key(&self) -> &MatrixKey {
        &self.key
    }

    #[inline]
    pub fn scorer(&self) -> Scorer {
        self.scorer
    }

    pub fn slot(&self) -> &Arc<MatrixSlot> {
        &self.slot
    }

    /// Current matrix, or NotBuilt if nothing was ever published
    pub fn snapshot(&self) -> Result<Arc<FeatureMatrix>> {
        self.slot.load().ok_or_else(|| Error::NotBuilt {
            metric: self.key.metric.clone(),
            language: self.key.language.clone(),
        })
    }

    /// Query vector for a probe within the given snapshot
    pub fn resolve<'a>(&self, matrix: &'a FeatureMatrix, probe: &Probe<'a>) -> Result<&'a FeatureVector> {
        match *probe {
            Probe::Concept(id) => matrix
                .get(id)
                .ok_or_else(|| Error::not_found(format!("concept {} in {}", id, self.key))),
            Probe::Vectors(vectors) => vectors
                .get(&self.key.metric)
                .ok_or_else(|| Error::not_found(format!("probe vector for {}", self.key))),
        }
    }

    pub fn similarity(&self, a: ConceptId, b: ConceptId) -> Result<f32> {
        self.probe_similarity(&Probe::Concept(a), b)
    }

    pub fn probe_similarity(&self, probe: &Probe<'_>, b: ConceptId) -> Result<f32> {
        let matrix = self.snapshot()?;
        let query = self.resolve(&matrix, probe)?;
        let other = matrix
            .get(b)
            .ok_or_else(|| Error::not_found(format!("concept {} in {}", b, self.key)))?;
        Ok(self.scorer.score(query, other, matrix.len()))
    }

    /// Raw top-k over every concept in the matrix, best first
    pub fn most_similar(
        &self,
        probe: &Probe<'_>,
        k: usize,
        filter: Option<&dyn Filter>,
    ) -> Result<Vec<(ConceptId, f32)>> {
        self.most_similar_ranked(probe, k, filter, &NormalizerModel::Identity)
    }

    /// Top-k ranked by `rank` applied to each raw score; returns raw scores
    pub fn most_similar_ranked(
        &self,
        probe: &Probe<'_>,
        k: usize,
        filter: Option<&dyn Filter>,
        rank: &NormalizerModel,
    ) -> Result<Vec<(ConceptId, f32)>> {
        let matrix = self.snapshot()?;
        let query = self.resolve(&matrix, probe)?;
        Ok(self.scan_ranked(&matrix, query, k, filter, rank))
    }

    /// Bounded top-k scan of one snapshot by raw score
    pub fn scan(
        &self,
        matrix: &FeatureMatrix,
        query: &FeatureVector,
        k: usize,
        filter: Option<&dyn Filter>,
    ) -> Vec<(ConceptId, f32)> {
        self.scan_ranked(matrix, query, k, filter, &NormalizerModel::Identity)
    }

    pub fn scan_ranked(
        &self,
        matrix: &FeatureMatrix,
        query: &FeatureVector,
        k: usize,
        filter: Option<&dyn Filter>,
        rank: &NormalizerModel,
    ) -> Vec<(ConceptId, f32)> {
        let universe = matrix.len();
        let scorer = self.scorer;
        matrix
            .par_iter()
            .filter(|(id, _)| filter.map_or(true, |f| f.matches(*id)))
            .fold(
                || TopK::new(k),
                |mut top, (id, vector)| {
                    let raw = scorer.score(query, vector, universe);
                    top.push_ranked(id, rank.apply(raw), raw);
                    top
                },
            )
            .reduce(|| TopK::new(k), TopK::merge)
            .into_sorted_vec()
    }

    /// Raw row-major |rows| x |cols| scores
    pub fn cosimilarity(&self, rows: &[ConceptId], cols: &[ConceptId]) -> Result<Vec<f32>> {
        let matrix = self.snapshot()?;
        let lookup = |id: &ConceptId| {
            matrix
                .get(*id)
                .ok_or_else(|| Error::not_found(format!("concept {} in {}", id, self.key)))
        };
        let row_vectors = rows.iter().map(lookup).collect::<Result<Vec<_>>>()?;
        let col_vectors = cols.iter().map(lookup).collect::<Result<Vec<_>>>()?;

        let mut cells = vec![0.0f32; rows.len() * cols.len()];
        if cells.is_empty() {
            return Ok(cells);
        }

        let universe = matrix.len();
        let scorer = self.scorer;
        cells
            .par_chunks_mut(cols.len())
            .zip(row_vectors.par_iter())
            .for_each(|(out, row)| {
                for (cell, col) in out.iter_mut().zip(&col_vectors) {
                    *cell = scorer.score(row, col, universe);
                }
            });
        Ok(cells)
    }
}
