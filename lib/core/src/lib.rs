//! # semrel Core
//!
//! Core library for the semrel semantic relatedness engine.
//!
//! This crate provides the data structures and algorithms behind every query:
//!
//! - [`FeatureVector`] - Sparse per-concept feature vector
//! - [`FeatureMatrix`] - Immutable concept -> vector mapping for one metric and language
//! - [`Normalizer`] - Identity, percentile and loess score normalizers
//! - [`Metric`] - Vector, link, category and ensemble metrics
//! - [`Registry`] - Metrics and their swap slots, per language
//! - [`QueryEngine`] - Validating façade: similarity, mostSimilar, cosimilarity
//! - [`PhraseResolver`] - Phrase-keyed queries over a phrase dictionary
//!
//! ## Example
//!
//! ```rust
//! use semrel_core::{
//!     Concept, ConceptId, FeatureMatrix, FeatureVector, MatrixKey, MetricKind, Normalizer,
//!     NormalizerType, QueryEngine, QueryLimits, Registry,
//! };
//! use std::sync::Arc;
//!
//! let registry = Registry::new();
//! let key = MatrixKey::new("esa", "simple");
//! let entry = registry
//!     .register_matrix_metric(key.clone(), MetricKind::Vector, None, Normalizer::new(NormalizerType::Identity), None)
//!     .unwrap();
//!
//! let matrix = FeatureMatrix::new(key, 1, vec![
//!     (Concept::new(1u32), FeatureVector::new([(1, 1.0), (2, 1.0)])),
//!     (Concept::new(2u32), FeatureVector::new([(1, 1.0), (2, 0.5)])),
//! ]).unwrap();
//! entry.matrix_slot().unwrap().publish(Arc::new(matrix));
//!
//! let engine = QueryEngine::new(Arc::new(registry), QueryLimits::default());
//! let score = engine.similarity("simple", "esa", ConceptId(1), ConceptId(2)).unwrap();
//! assert!((score.raw - 0.9487).abs() < 1e-3);
//! ```

pub mod concept;
pub mod config;
pub mod engine;
pub mod error;
pub mod filter;
pub mod loess;
pub mod matrix;
pub mod metric;
pub mod normalizer;
pub mod phrase;
pub mod registry;
pub mod result;
pub mod slot;
pub mod source;
pub mod vector;

pub use concept::{Concept, ConceptId};
pub use config::{BuildConfig, BuildMode, MetricConfig, SrConfig};
pub use engine::{MetricStatus, QueryEngine, QueryLimits, QueryStatsSnapshot};
pub use error::{Error, Result};
pub use filter::{Both, CandidateFilter, ExcludeOne, Filter, FilterCondition};
pub use matrix::{FeatureMatrix, MatrixKey, MatrixSlot};
pub use metric::{
    Contribution, EnsembleMember, EnsembleMetric, EnsembleMode, EnsembleSpec, ExplainedScore,
    MatrixMetric, Metric, MetricKind, Probe, ProbeVectors, Scorer,
};
pub use normalizer::{Normalizer, NormalizerModel, NormalizerSlot, NormalizerType, PercentileConvention};
pub use phrase::{
    default_bundles, normalize_phrase, read_bundles, Bundle, CentroidPhraseCreator, EvalOptions, EvalReport,
    KnownPhraseSim, PhraseCreator, PhraseDictionary, PhraseId, PhraseResolver, PhraseSimEvaluator,
};
pub use registry::{MetricEntry, Registry};
pub use result::{CosimilarityMatrix, ResultList, SimilarityResult, TopK};
pub use slot::Slot;
pub use source::{FeatureSource, StaticFeatureSource};
pub use vector::FeatureVector;
