//! Session record domain type
//!
//! Identity/credential-adjacent state with an optional expiry,
//! independent of tasks. An `active` session past its `expires_at` is
//! logically inactive even before physical cleanup runs.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

use crate::now_ms;

/// Session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Usable, subject to expiry
    #[default]
    Active,
    /// Past its expiry or explicitly aged out
    Expired,
    /// Invalidated by the owning subject
    Revoked,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Expired => write!(f, "expired"),
            Self::Revoked => write!(f, "revoked"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "expired" => Ok(Self::Expired),
            "revoked" => Ok(Self::Revoked),
            other => Err(format!("unknown session status: {}", other)),
        }
    }
}

/// Identity/credential-adjacent state with optional expiry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Unique identifier
    pub id: String,

    /// Owning subject (account, user, course-platform login, ...)
    pub subject_id: String,

    /// Session type tag
    pub session_type: String,

    /// Current status
    pub status: SessionStatus,

    /// Open-ended key/value data bag
    #[serde(default)]
    pub data: Map<String, Value>,

    /// Creation timestamp (Unix milliseconds)
    pub created_at: i64,

    /// Last update timestamp (Unix milliseconds)
    pub updated_at: i64,

    /// Expiry timestamp (Unix milliseconds); None means no expiry
    pub expires_at: Option<i64>,
}

impl SessionRecord {
    /// Create a new session with a generated ID
    pub fn new(subject_id: impl Into<String>, session_type: impl Into<String>) -> Self {
        let subject_id = subject_id.into();
        let session_type = session_type.into();
        debug!(%subject_id, %session_type, "SessionRecord::new: called");
        Self::with_id(format!("session-{}", Uuid::now_v7()), subject_id, session_type)
    }

    /// Create with a specific ID
    pub fn with_id(
        id: impl Into<String>,
        subject_id: impl Into<String>,
        session_type: impl Into<String>,
    ) -> Self {
        let id = id.into();
        debug!(%id, "SessionRecord::with_id: called");
        let now = now_ms();
        Self {
            id,
            subject_id: subject_id.into(),
            session_type: session_type.into(),
            status: SessionStatus::Active,
            data: Map::new(),
            created_at: now,
            updated_at: now,
            expires_at: None,
        }
    }

    /// Update the status
    pub fn set_status(&mut self, status: SessionStatus) {
        debug!(%self.id, ?status, "SessionRecord::set_status: called");
        self.status = status;
        self.updated_at = now_ms();
    }

    /// Set the expiry timestamp
    pub fn set_expiry(&mut self, expires_at: i64) {
        debug!(%self.id, expires_at, "SessionRecord::set_expiry: called");
        self.expires_at = Some(expires_at);
        self.updated_at = now_ms();
    }

    /// Merge a patch into the data bag
    pub fn merge_data(&mut self, patch: Map<String, Value>) {
        debug!(%self.id, keys = patch.len(), "SessionRecord::merge_data: called");
        for (key, value) in patch {
            self.data.insert(key, value);
        }
        self.updated_at = now_ms();
    }

    /// Check if the session is past its expiry at the given instant
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Check if the session is usable at the given instant
    ///
    /// An `active` status past `expires_at` counts as inactive even if
    /// physical cleanup has not run yet.
    pub fn is_active(&self, now: i64) -> bool {
        debug!(%self.id, ?self.status, "SessionRecord::is_active: called");
        self.status == SessionStatus::Active && !self.is_expired(now)
    }
}
