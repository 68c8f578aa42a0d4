//! Semantic recall infrastructure.
//!
//! Feature vectors are generated locally and deterministically; no model
//! download, no network. Everything downstream of the generator treats
//! vectors as opaque unit-length float arrays.
//!
//! # Architecture
//!
//! - `features`: Deterministic feature-hash vector generation
//! - `index`: Vector index contract plus the exact (full scan) strategy
//! - `lsh`: Approximate strategy, random-hyperplane bucketing
//! - `storage`: Binary file I/O for vectors.bin persistence
//! - `graph`: Similarity edges, traversal and clustering
//! - `recall`: Query-facing search with keyword fallback

pub mod features;
pub mod graph;
pub mod index;
pub mod lsh;
pub mod recall;
pub mod storage;

pub use features::{FeatureGenerator, DEFAULT_DIMENSIONS};
pub use graph::{Cluster, Edge, SemanticGraph};
pub use index::{ExactIndex, IndexError, VectorIndex};
pub use lsh::LshIndex;
pub use recall::{Match, MatchReason};
pub use storage::{StoredVector, VectorStorage, VectorStorageError};

/// Default similarity threshold for recall search
pub const DEFAULT_THRESHOLD: f32 = 0.35;
