//! Recovery session audit record
//!
//! One row per recovery pass: process identity snapshot, what was
//! recovered, what was cleaned, and how the pass ended. Write-once:
//! rows are only ever appended to the recovery log.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::now_ms;

/// Terminal status of a recovery pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStatus {
    /// Pass ran to completion (individual tasks may still have failed)
    #[default]
    Completed,
    /// Pass aborted on an internal error
    Failed,
}

impl std::fmt::Display for RecoveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for RecoveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown recovery status: {}", other)),
        }
    }
}

/// Audit record of one recovery pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoverySession {
    /// Unique identifier
    pub id: String,

    /// Process id of the recovering process
    pub pid: u32,

    /// Pass start timestamp (Unix milliseconds)
    pub started_at: i64,

    /// Pass end timestamp (Unix milliseconds); None while in flight
    pub finished_at: Option<i64>,

    /// Task ids that were recovered (marked resumable)
    pub recovered_tasks: Vec<String>,

    /// Resource names cleaned during the pass
    pub cleaned_resources: Vec<String>,

    /// Terminal status of the pass
    pub status: RecoveryStatus,

    /// Error text when the pass itself failed
    pub error: Option<String>,

    /// Process/memory/task-count diagnostics (JSON)
    #[serde(default)]
    pub diagnostics: Value,
}

impl RecoverySession {
    /// Start a new recovery session for the given process
    pub fn begin(pid: u32) -> Self {
        debug!(pid, "RecoverySession::begin: called");
        Self {
            id: format!("recovery-{}", Uuid::now_v7()),
            pid,
            started_at: now_ms(),
            finished_at: None,
            recovered_tasks: Vec::new(),
            cleaned_resources: Vec::new(),
            status: RecoveryStatus::Completed,
            error: None,
            diagnostics: Value::Null,
        }
    }

    /// Record a task as recovered
    pub fn record_recovered(&mut self, task_id: impl Into<String>) {
        let task_id = task_id.into();
        debug!(%self.id, %task_id, "RecoverySession::record_recovered: called");
        self.recovered_tasks.push(task_id);
    }

    /// Record a resource as cleaned
    pub fn record_cleaned(&mut self, resource: impl Into<String>) {
        let resource = resource.into();
        debug!(%self.id, %resource, "RecoverySession::record_cleaned: called");
        self.cleaned_resources.push(resource);
    }

    /// Attach diagnostics gathered during the pass
    pub fn set_diagnostics(&mut self, diagnostics: Value) {
        debug!(%self.id, "RecoverySession::set_diagnostics: called");
        self.diagnostics = diagnostics;
    }

    /// Mark the pass as completed
    pub fn finish_completed(&mut self) {
        debug!(%self.id, "RecoverySession::finish_completed: called");
        self.status = RecoveryStatus::Completed;
        self.finished_at = Some(now_ms());
    }

    /// Mark the pass as failed with the given error
    pub fn finish_failed(&mut self, error: impl Into<String>) {
        let error = error.into();
        debug!(%self.id, %error, "RecoverySession::finish_failed: called");
        self.status = RecoveryStatus::Failed;
        self.error = Some(error);
        self.finished_at = Some(now_ms());
    }
}
