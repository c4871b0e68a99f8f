//! # semrel
//!
//! A semantic relatedness engine. Concepts (encyclopedia articles, or free-text
//! phrases mapped onto them) are represented as sparse feature vectors; the
//! engine answers pairwise similarity, top-k "most similar" retrieval and
//! dense cosimilarity matrices over those vectors.
//!
//! ## Quick Start
//!
//! ### As a Server
//!
//! ```bash
//! semrel build --config sr.json
//! semrel serve --config sr.json --http-port 8080
//! ```
//!
//! ### As a Library
//!
//! ```rust,no_run
//! use semrel::prelude::*;
//! use std::sync::Arc;
//!
//! let config = SrConfig::load("sr.json").unwrap();
//! let registry = Arc::new(Registry::from_config(&config).unwrap());
//! let manager = ArtifactManager::from_config(registry.clone(), &config).unwrap();
//! manager.load_latest();
//!
//! let engine = QueryEngine::from_config(registry, &config);
//! let results = engine
//!     .most_similar(&config.language, &config.metric_name, ConceptId(12), 10, None)
//!     .unwrap();
//! for result in &results {
//!     println!("{} {:.3}", result.id, result.normalized);
//! }
//! ```
//!
//! ## Crate Structure
//!
//! - [`semrel-core`](semrel_core) - Feature vectors and matrices, normalizers, metrics, ensembles,
//!   the query engine and the phrase resolver
//! - [`semrel-storage`](semrel_storage) - Versioned artifacts, feature matrix builds and the build pool
//! - [`semrel-api`](semrel_api) - REST API

// Re-export core types
pub use semrel_core::{
    CandidateFilter, Concept, ConceptId, CosimilarityMatrix, EnsembleMode, EnsembleSpec, Error, FeatureMatrix,
    FeatureSource, FeatureVector, Filter, FilterCondition, MatrixKey, Metric, MetricKind, Normalizer,
    NormalizerType, PhraseDictionary, PhraseResolver, PhraseSimEvaluator, QueryEngine, QueryLimits, Registry,
    Result, ResultList, SimilarityResult, SrConfig,
};

// Re-export storage
pub use semrel_storage::{ArtifactManager, ArtifactStore, BuildPool, FeatureMatrixBuilder, JsonlFeatureSource};

// Re-export API
pub use semrel_api::{ApiState, RestApi};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        ApiState, ArtifactManager, ArtifactStore, BuildPool, CandidateFilter, Concept, ConceptId, Error,
        FeatureMatrixBuilder, FeatureSource, FeatureVector, Filter, JsonlFeatureSource, MetricKind, Normalizer,
        NormalizerType, PhraseDictionary, PhraseResolver, QueryEngine, Registry, RestApi, Result, SrConfig,
    };
}
