//! Error types for each layer of the analyzer.
//!
//! Input errors (`QueryError`, `GatewayError`) surface to the HTTP caller.
//! Infrastructure errors are captured into a task's failure message by the
//! worker and never retried by the core itself.

use thiserror::Error;

use crate::models::TaskStatus;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("task {0} not found")]
    NotFound(String),

    #[error("task {task_id} cannot move from {from} to {to}")]
    InvalidTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("corrupt task record {task_id}: {reason}")]
    Corrupt { task_id: String, reason: String },

    #[error("database lock poisoned")]
    Poisoned,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("job {0} not found")]
    NotFound(String),

    #[error("job {0} is no longer leased to this worker")]
    LeaseLost(String),

    #[error("queue lock poisoned")]
    Poisoned,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("input not found: {0}")]
    NotFound(String),

    #[error("invalid input reference: {0}")]
    InvalidReference(String),

    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("embedding backend returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("no embeddings in response")]
    EmptyResponse,

    #[error("nothing to embed")]
    EmptyInput,

    #[error("embedding has {actual} dimensions, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("embedding contains non-finite values")]
    NonFinite,

    #[error("embedding timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("embedding backend unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SimilarityError {
    #[error("vectors have different lengths ({left} vs {right})")]
    DimensionMismatch { left: usize, right: usize },

    #[error("vectors must not be empty")]
    EmptyVector,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{0}")]
    InvalidInput(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("task {0} not found")]
    NotFound(String),

    #[error("access to task {0} denied")]
    Forbidden(String),

    #[error("{0}")]
    MissingEmbedding(String),

    #[error(transparent)]
    Similarity(#[from] SimilarityError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Unrecoverable failure of one processing attempt. Its `Display` is what
/// ends up in the task's error field, so it carries no internals beyond the
/// collaborator's own message.
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("{0}")]
    Storage(#[from] StorageError),

    #[error("failed to persist task state: {0}")]
    Store(#[from] StoreError),
}

impl ProcessingError {
    /// Message written to the task record. The `Display` form names storage
    /// references and database internals, so it only goes to the logs.
    pub fn public_message(&self) -> &'static str {
        match self {
            ProcessingError::Storage(StorageError::NotFound(_)) => "Input file not found",
            ProcessingError::Storage(StorageError::InvalidReference(_)) => "Invalid input reference",
            ProcessingError::Storage(StorageError::Io(_)) => "Failed to read input",
            ProcessingError::Store(_) => "Failed to save analysis result",
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}
