use crate::semantic::index::IndexError;
use crate::semantic::storage::VectorStorageError;
use crate::storage::StoreError;

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("record not found")]
    NotFound,

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("rule not found")]
    RuleNotFound,

    #[error("store unavailable: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error("vector storage: {0}")]
    VectorStorage(#[from] VectorStorageError),

    #[error("feature generation timed out")]
    EmbeddingTimeout,

    #[error("feature generation failed: {0}")]
    EmbeddingFailed(String),

    #[error("unexpected error: {0:?}")]
    Other(#[from] anyhow::Error),
}
