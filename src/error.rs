//! Error kinds raised by the ingestion, scanning, and retrieval pipelines.
//!
//! Validation and security errors ([`PipelineError::UnsupportedFormat`],
//! [`PipelineError::PathEscape`]) are raised before any side effect.
//! Everything else surfaces at the job boundary, where it is recorded on
//! the job row and re-raised to the worker.

use std::time::Duration;

use thiserror::Error;

use crate::models::Backend;

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("unsupported file format: {0}")]
    UnsupportedFormat(String),

    #[error("{backend} parser failed: {message}")]
    ParseFailure { backend: Backend, message: String },

    #[error("accelerator lock not acquired within {0:?}")]
    LockTimeout(Duration),

    #[error("lock store error: {0}")]
    LockStore(String),

    #[error("source {0} not found")]
    SourceNotFound(i64),

    #[error("source {0} is disabled")]
    SourceDisabled(i64),

    #[error("path escapes root {root}: {path}")]
    PathEscape { root: String, path: String },

    #[error("invalid glob pattern: {0}")]
    InvalidGlob(String),

    #[error("remote backend unavailable: {0}")]
    RemoteBackendUnavailable(String),

    #[error("document not found: {0}")]
    DocumentNotFound(String),

    #[error("job not found: {0}")]
    JobNotFound(i64),

    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error("file too large: {size_mb:.1} MB exceeds {limit_mb} MB")]
    FileTooLarge { size_mb: f64, limit_mb: u64 },

    #[error("task queue error: {0}")]
    Queue(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    pub fn parse(backend: Backend, message: impl Into<String>) -> Self {
        PipelineError::ParseFailure {
            backend,
            message: message.into(),
        }
    }
}

impl From<redis::RedisError> for PipelineError {
    fn from(e: redis::RedisError) -> Self {
        PipelineError::LockStore(e.to_string())
    }
}
