use crate::{Error, Result};
use std::ops::{Add, Mul};

/// A sparse feature vector: ascending dimension ids with parallel weights
///
/// Absent dimensions are implicitly zero. Zero and non-finite weights are
/// dropped on construction and duplicate dimensions are summed, so two vectors
/// built from the same contributions compare equal.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FeatureVector {
    dims: Vec<u32>,
    weights: Vec<f32>,
    norm: f64,
}

impl FeatureVector {
    #[must_use]
    pub fn new<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (u32, f32)>,
    {
        let mut pairs: Vec<(u32, f32)> = pairs.into_iter().collect();
        pairs.sort_by_key(|&(dim, _)| dim);

        let mut merged: Vec<(u32, f32)> = Vec::with_capacity(pairs.len());
        for (dim, weight) in pairs {
            match merged.last_mut() {
                Some(last) if last.0 == dim => last.1 += weight,
                _ => merged.push((dim, weight)),
            }
        }

        let (dims, weights): (Vec<u32>, Vec<f32>) = merged
            .into_iter()
            .filter(|&(_, w)| w != 0.0 && w.is_finite())
            .unzip();

        Self::from_parts_unchecked(dims, weights)
    }

    /// Rebuild a vector from persisted parts, rejecting unsorted dimensions
    pub fn from_sorted_parts(dims: Vec<u32>, weights: Vec<f32>) -> Result<Self> {
        if dims.len() != weights.len() {
            return Err(Error::Corrupt(format!(
                "feature vector has {} dims but {} weights",
                dims.len(),
                weights.len()
            )));
        }
        if dims.windows(2).any(|w| w[0] >= w[1]) {
            return Err(Error::Corrupt("feature vector dims are not strictly ascending".to_string()));
        }
        if weights.iter().any(|w| !w.is_finite()) {
            return Err(Error::Corrupt("feature vector has a non-finite weight".to_string()));
        }
        Ok(Self::from_parts_unchecked(dims, weights))
    }

    fn from_parts_unchecked(dims: Vec<u32>, weights: Vec<f32>) -> Self {
        let norm = weights
            .iter()
            .map(|&w| f64::from(w) * f64::from(w))
            .sum::<f64>()
            .sqrt();
        Self { dims, weights, norm }
    }

    #[inline]
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Number of non-zero dimensions
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.dims.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.dims.is_empty()
    }

    #[inline]
    #[must_use]
    pub fn dims(&self) -> &[u32] {
        &self.dims
    }

    #[inline]
    #[must_use]
    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, f32)> + '_ {
        self.dims.iter().copied().zip(self.weights.iter().copied())
    }

    #[must_use]
    pub fn get(&self, dim: u32) -> f32 {
        match self.dims.binary_search(&dim) {
            Ok(i) => self.weights[i],
            Err(_) => 0.0,
        }
    }

    /// L2 norm, cached at construction
    #[inline]
    #[must_use]
    pub fn norm(&self) -> f64 {
        self.norm
    }

    /// Dot product over shared dimensions (merge join)
    #[must_use]
    pub fn dot(&self, other: &FeatureVector) -> f64 {
        let (mut i, mut j) = (0, 0);
        let mut sum = 0.0f64;
        while i < self.dims.len() && j < other.dims.len() {
            match self.dims[i].cmp(&other.dims[j]) {
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
                std::cmp::Ordering::Equal => {
                    sum += f64::from(self.weights[i]) * f64::from(other.weights[j]);
                    i += 1;
                    j += 1;
                }
            }
        }
        sum
    }

    /// Compute cosine similarity with another vector
    /// Returns 0.0 when either vector is all-zero
    #[inline]
    #[must_use]
    pub fn cosine_similarity(&self, other: &FeatureVector) -> f32 {
        if self.norm == 0.0 || other.norm == 0.0 {
            return 0.0;
        }
        let cosine = self.dot(other) / (self.norm * other.norm);
        cosine.clamp(-1.0, 1.0) as f32
    }

    /// Number of dimensions present in both vectors
    #[must_use]
    pub fn overlap(&self, other: &FeatureVector) -> usize {
        let (mut i, mut j) = (0, 0);
        let mut shared = 0;
        while i < self.dims.len() && j < other.dims.len() {
            match self.dims[i].cmp(&other.dims[j]) {
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
                std::cmp::Ordering::Equal => {
                    shared += 1;
                    i += 1;
                    j += 1;
                }
            }
        }
        shared
    }

    /// Jaccard index of the two dimension sets
    #[must_use]
    pub fn jaccard(&self, other: &FeatureVector) -> f32 {
        let shared = self.overlap(other);
        let union = self.len() + other.len() - shared;
        if union == 0 {
            0.0
        } else {
            shared as f32 / union as f32
        }
    }

    /// Mean of several vectors; empty input gives the empty vector
    #[must_use]
    pub fn centroid(vectors: &[&FeatureVector]) -> FeatureVector {
        if vectors.is_empty() {
            return FeatureVector::empty();
        }
        let sum = vectors
            .iter()
            .fold(FeatureVector::empty(), |acc, v| &acc + *v);
        &sum * (1.0 / vectors.len() as f32)
    }
}

impl Add for &FeatureVector {
    type Output = FeatureVector;

    fn add(self, other: &FeatureVector) -> FeatureVector {
        FeatureVector::new(self.iter().chain(other.iter()))
    }
}

impl Mul<f32> for &FeatureVector {
    type Output = FeatureVector;

    fn mul(self, scalar: f32) -> FeatureVector {
        FeatureVector::new(self.iter().map(|(d, w)| (d, w * scalar)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fv(pairs: &[(u32, f32)]) -> FeatureVector {
        FeatureVector::new(pairs.iter().copied())
    }

    #[test]
    fn test_cosine_similarity() {
        let a = fv(&[(1, 1.0), (2, 1.0)]);
        let b = fv(&[(1, 1.0), (2, 0.5)]);
        let c = fv(&[(3, 1.0)]);

        assert!((a.cosine_similarity(&b) - 0.948_683_3).abs() < 1e-6);
        assert_eq!(a.cosine_similarity(&c), 0.0);
        assert!((a.cosine_similarity(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_empty_vector_is_orthogonal() {
        let a = fv(&[(1, 1.0)]);
        let empty = FeatureVector::empty();
        assert_eq!(a.cosine_similarity(&empty), 0.0);
        assert_eq!(empty.cosine_similarity(&empty), 0.0);
        assert_eq!(empty.jaccard(&empty), 0.0);
    }

    #[test]
    fn test_construction_merges_and_drops() {
        let v = fv(&[(5, 1.0), (2, 0.5), (5, 1.0), (9, 0.0), (7, f32::NAN)]);
        assert_eq!(v.dims(), &[2, 5]);
        assert_eq!(v.weights(), &[0.5, 2.0]);
        assert_eq!(v.get(5), 2.0);
        assert_eq!(v.get(9), 0.0);
    }

    #[test]
    fn test_jaccard() {
        let a = fv(&[(1, 1.0), (2, 1.0), (3, 1.0)]);
        let b = fv(&[(2, 4.0), (3, 1.0), (4, 1.0)]);
        assert_eq!(a.overlap(&b), 2);
        assert!((a.jaccard(&b) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_centroid() {
        let a = fv(&[(1, 2.0)]);
        let b = fv(&[(2, 2.0)]);
        let c = FeatureVector::centroid(&[&a, &b]);
        assert_eq!(c.get(1), 1.0);
        assert_eq!(c.get(2), 1.0);
        assert!(FeatureVector::centroid(&[]).is_empty());
    }

    #[test]
    fn test_from_sorted_parts_rejects_unsorted() {
        assert!(FeatureVector::from_sorted_parts(vec![1, 3], vec![1.0, 1.0]).is_ok());
        assert!(FeatureVector::from_sorted_parts(vec![3, 1], vec![1.0, 1.0]).is_err());
        assert!(FeatureVector::from_sorted_parts(vec![1], vec![1.0, 2.0]).is_err());
    }
}
