//! Task state errors

use statestore::{StoreError, TaskStatus};
use thiserror::Error;

/// Errors from task state operations
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Task already exists: {0}")]
    DuplicateTask(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Invalid transition {from} -> {to} for task {id}")]
    InvalidTransition {
        id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Task {0} is not resumable (needs paused/failed status and a checkpoint)")]
    NotResumable(String),

    #[error("Checkpoint index {proposed} precedes current index {current} for task {id}")]
    CheckpointOrder {
        id: String,
        current: u64,
        proposed: u64,
    },

    #[error("Recovery handler failed for task {id}: {reason}")]
    RecoveryHandler { id: String, reason: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
}

/// Result alias for task state operations
pub type TaskResult<T> = Result<T, TaskError>;
