//! # semrel Storage
//!
//! Build and persistence layer: a versioned [`ArtifactStore`], the
//! [`FeatureMatrixBuilder`] that produces its contents, a bounded
//! [`BuildPool`] and the [`ArtifactManager`] that loads published artifacts
//! into a [`semrel_core::Registry`].

pub mod builder;
pub mod manager;
pub mod pool;
pub mod source;
pub mod store;

pub use builder::{BuildReport, CancellationToken, FeatureMatrixBuilder};
pub use manager::{ArtifactManager, LoadSummary};
pub use pool::{BuildHandle, BuildPool};
pub use source::JsonlFeatureSource;
pub use store::{Artifact, ArtifactStore, FileChecksum, Manifest};
