//! Task record domain type
//!
//! The unit of recoverable work: a status-machine snapshot with clamped
//! progress, an open-ended data bag, and at most one checkpoint. The
//! checkpoint is the latest resume point, not a history: writing a new
//! one replaces the old one wholesale.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

use crate::now_ms;

/// Task status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, waiting to start
    #[default]
    Pending,
    /// Actively executing
    Running,
    /// Suspended with intent to resume
    Paused,
    /// Recovery handler in flight (always transient)
    Recovering,
    /// Finished successfully
    Completed,
    /// Failed; resumable only if a checkpoint exists
    Failed,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Recovering => write!(f, "recovering"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "recovering" => Ok(Self::Recovering),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown task status: {}", other)),
        }
    }
}

impl TaskStatus {
    /// Check if this is a terminal status
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// A named resume point inside a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Step name (e.g. "chunk3")
    pub step: String,

    /// Step index, monotonically non-decreasing within a task
    pub step_index: u64,

    /// Arbitrary payload needed to resume from this step
    #[serde(default)]
    pub payload: Value,

    /// Creation timestamp (Unix milliseconds)
    pub created_at: i64,
}

impl Checkpoint {
    /// Create a new checkpoint stamped with the current time
    pub fn new(step: impl Into<String>, step_index: u64, payload: Value) -> Self {
        let step = step.into();
        debug!(%step, step_index, "Checkpoint::new: called");
        Self {
            step,
            step_index,
            payload,
            created_at: now_ms(),
        }
    }
}

/// The unit of recoverable work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Unique identifier
    pub id: String,

    /// Task type tag, used for handler dispatch
    pub task_type: String,

    /// Current status
    pub status: TaskStatus,

    /// Completion progress, clamped to [0, 100]
    pub progress: f64,

    /// Open-ended key/value data bag
    #[serde(default)]
    pub data: Map<String, Value>,

    /// Latest resume point, if any
    pub checkpoint: Option<Checkpoint>,

    /// Number of resume/retry attempts so far
    pub retry_count: u32,

    /// Last error message (if any)
    pub last_error: Option<String>,

    /// Creation timestamp (Unix milliseconds)
    pub created_at: i64,

    /// Last update timestamp (Unix milliseconds)
    pub updated_at: i64,
}

impl TaskRecord {
    /// Create a new task with a generated ID
    pub fn new(task_type: impl Into<String>) -> Self {
        let task_type = task_type.into();
        debug!(%task_type, "TaskRecord::new: called");
        Self::with_id(format!("task-{}", Uuid::now_v7()), task_type)
    }

    /// Create with a specific ID (for callers with their own id scheme)
    pub fn with_id(id: impl Into<String>, task_type: impl Into<String>) -> Self {
        let id = id.into();
        let task_type = task_type.into();
        debug!(%id, %task_type, "TaskRecord::with_id: called");
        let now = now_ms();
        Self {
            id,
            task_type,
            status: TaskStatus::Pending,
            progress: 0.0,
            data: Map::new(),
            checkpoint: None,
            retry_count: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Update the status
    pub fn set_status(&mut self, status: TaskStatus) {
        debug!(%self.id, ?status, "TaskRecord::set_status: called");
        self.status = status;
        self.updated_at = now_ms();
    }

    /// Set progress, clamped to [0, 100]
    pub fn set_progress(&mut self, progress: f64) {
        debug!(%self.id, progress, "TaskRecord::set_progress: called");
        self.progress = if progress.is_nan() { 0.0 } else { progress.clamp(0.0, 100.0) };
        self.updated_at = now_ms();
    }

    /// Merge a patch into the data bag (last write wins per key)
    pub fn merge_data(&mut self, patch: Map<String, Value>) {
        debug!(%self.id, keys = patch.len(), "TaskRecord::merge_data: called");
        for (key, value) in patch {
            self.data.insert(key, value);
        }
        self.updated_at = now_ms();
    }

    /// Replace the current checkpoint (checkpoints are not a history)
    pub fn set_checkpoint(&mut self, checkpoint: Checkpoint) {
        debug!(%self.id, step = %checkpoint.step, index = checkpoint.step_index, "TaskRecord::set_checkpoint: called");
        self.checkpoint = Some(checkpoint);
        self.updated_at = now_ms();
    }

    /// Set an error
    pub fn set_error(&mut self, error: impl Into<String>) {
        let error = error.into();
        debug!(%self.id, %error, "TaskRecord::set_error: called");
        self.last_error = Some(error);
        self.updated_at = now_ms();
    }

    /// Clear the error
    pub fn clear_error(&mut self) {
        debug!(%self.id, "TaskRecord::clear_error: called");
        self.last_error = None;
        self.updated_at = now_ms();
    }

    /// Increment the retry counter
    pub fn increment_retry(&mut self) {
        debug!(%self.id, self.retry_count, "TaskRecord::increment_retry: called");
        self.retry_count += 1;
        self.updated_at = now_ms();
    }

    /// Check if the task is in a terminal state
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Check if the task is actively executing or recovering
    pub fn is_active(&self) -> bool {
        matches!(self.status, TaskStatus::Running | TaskStatus::Recovering)
    }

    /// Check if the task can be resumed
    ///
    /// True iff status is paused or failed and a checkpoint exists. A
    /// task with no checkpoint has no resume point and can never be
    /// resumed, only restarted from scratch.
    pub fn can_resume(&self) -> bool {
        debug!(%self.id, ?self.status, has_checkpoint = self.checkpoint.is_some(), "TaskRecord::can_resume: called");
        matches!(self.status, TaskStatus::Paused | TaskStatus::Failed) && self.checkpoint.is_some()
    }
}
