//! Result shapes and bounded top-k selection

use crate::ConceptId;
use ordered_float::OrderedFloat;
use serde::Serialize;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

/// One scored concept
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SimilarityResult {
    pub id: ConceptId,
    pub raw: f32,
    pub normalized: f32,
}

/// Ranked results: normalized score descending, concept id ascending on ties
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResultList {
    results: Vec<SimilarityResult>,
}

impl ResultList {
    /// Sort `results` into ranking order and keep at most `k`
    pub fn ranked(mut results: Vec<SimilarityResult>, k: usize) -> Self {
        results.sort_by(|a, b| {
            OrderedFloat(b.normalized)
                .cmp(&OrderedFloat(a.normalized))
                .then(a.id.cmp(&b.id))
        });
        let mut seen = ahash::AHashSet::with_capacity(results.len());
        results.retain(|r| seen.insert(r.id));
        results.truncate(k);
        Self { results }
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn get(&self, i: usize) -> Option<&SimilarityResult> {
        self.results.get(i)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, SimilarityResult> {
        self.results.iter()
    }

    pub fn ids(&self) -> Vec<ConceptId> {
        self.results.iter().map(|r| r.id).collect()
    }

    pub fn into_vec(self) -> Vec<SimilarityResult> {
        self.results
    }
}

impl IntoIterator for ResultList {
    type Item = SimilarityResult;
    type IntoIter = std::vec::IntoIter<SimilarityResult>;

    fn into_iter(self) -> Self::IntoIter {
        self.results.into_iter()
    }
}

impl<'a> IntoIterator for &'a ResultList {
    type Item = &'a SimilarityResult;
    type IntoIter = std::slice::Iter<'a, SimilarityResult>;

    fn into_iter(self) -> Self::IntoIter {
        self.results.iter()
    }
}

/// Dense |rows| x |cols| matrix of scores, row-major
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CosimilarityMatrix {
    rows: Vec<ConceptId>,
    cols: Vec<ConceptId>,
    cells: Vec<f32>,
}

impl CosimilarityMatrix {
    pub fn new(rows: Vec<ConceptId>, cols: Vec<ConceptId>, cells: Vec<f32>) -> Self {
        debug_assert_eq!(rows.len() * cols.len(), cells.len());
        Self { rows, cols, cells }
    }

    pub fn rows(&self) -> &[ConceptId] {
        &self.rows
    }

    pub fn cols(&self) -> &[ConceptId] {
        &self.cols
    }

    pub fn cells(&self) -> &[f32] {
        &self.cells
    }

    pub fn get(&self, row: usize, col: usize) -> Option<f32> {
        if row < self.rows.len() && col < self.cols.len() {
            Some(self.cells[row * self.cols.len() + col])
        } else {
            None
        }
    }

    pub fn row(&self, row: usize) -> Option<&[f32]> {
        if row < self.rows.len() {
            let width = self.cols.len();
            Some(&self.cells[row * width..(row + 1) * width])
        } else {
            None
        }
    }
}

/// Heap entry ordered so that the worst candidate sits on top:
/// lowest rank key first, highest id first among equal keys
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    key: OrderedFloat<f32>,
    id: Reverse<ConceptId>,
    raw: OrderedFloat<f32>,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Min-heap: reverse the natural (key, Reverse(id)) order
        (other.key, other.id).cmp(&(self.key, self.id))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Bounded min-heap keeping the k best candidates
///
/// Candidates are ranked by a key (usually the normalized score) with ties
/// broken by ascending id; the raw score rides along.
pub struct TopK {
    k: usize,
    heap: BinaryHeap<Entry>,
}

impl TopK {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            heap: BinaryHeap::with_capacity(k.saturating_add(1).min(1 << 16)),
        }
    }

    /// Rank by the score itself
    pub fn push(&mut self, id: ConceptId, score: f32) {
        self.push_ranked(id, score, score);
    }

    pub fn push_ranked(&mut self, id: ConceptId, key: f32, raw: f32) {
        self.push_entry(Entry {
            key: OrderedFloat(key),
            id: Reverse(id),
            raw: OrderedFloat(raw),
        });
    }

    /// Combine two partial selections (used by parallel scans)
    #[must_use]
    pub fn merge(mut self, other: TopK) -> TopK {
        for entry in other.heap {
            self.push_entry(entry);
        }
        self
    }

    fn push_entry(&mut self, entry: Entry) {
        if self.k == 0 {
            return;
        }
        if self.heap.len() < self.k {
            self.heap.push(entry);
        } else if let Some(worst) = self.heap.peek() {
            // Entry ordering is inverted, so "less" means better
            if entry < *worst {
                self.heap.pop();
                self.heap.push(entry);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Best first: key descending, id ascending; yields (id, raw score)
    pub fn into_sorted_vec(self) -> Vec<(ConceptId, f32)> {
        self.heap
            .into_sorted_vec()
            .into_iter()
            .map(|e| (e.id.0, e.raw.0))
            .collect()
    }
}
