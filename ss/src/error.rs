//! Store error type
//!
//! Every I/O, serialization, or constraint failure surfaces as a single
//! [`StoreError`] so callers never have to reason about a half-applied
//! multi-field update.

use thiserror::Error;

/// Errors from durable store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

/// Result alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;
