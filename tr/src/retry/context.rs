//! Retry context - per-call attempt bookkeeping
//!
//! Ephemeral and in-memory only, never persisted. The engine records
//! each attempt here while a call is in flight and discards the context
//! when the call terminates.

use serde::Serialize;
use tracing::debug;

use statestore::now_ms;

use super::policy::ErrorClass;

/// Outcome record for one attempt
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    /// Attempt number (1-indexed)
    pub attempt: u32,

    /// True once the attempt returned a value
    pub succeeded: bool,

    /// Class of the failure, if the attempt failed
    pub class: Option<ErrorClass>,

    /// Error text, if the attempt failed
    pub error: Option<String>,

    /// Delay scheduled after this attempt (0 when terminal)
    pub delay_ms: u64,

    /// Timestamp the attempt started (Unix milliseconds)
    pub at: i64,
}

/// Bookkeeping for one in-flight retryable call
#[derive(Debug, Clone, Serialize)]
pub struct RetryContext {
    /// Caller-supplied or derived context key
    pub key: String,

    /// Timestamp the call started (Unix milliseconds)
    pub started_at: i64,

    /// One record per attempt, in order
    pub attempts: Vec<AttemptRecord>,
}

impl RetryContext {
    pub(crate) fn new(key: impl Into<String>) -> Self {
        let key = key.into();
        debug!(%key, "RetryContext::new: called");
        Self {
            key,
            started_at: now_ms(),
            attempts: Vec::new(),
        }
    }

    /// Record that an attempt is starting
    pub(crate) fn begin_attempt(&mut self, attempt: u32) {
        debug!(key = %self.key, attempt, "RetryContext::begin_attempt: called");
        self.attempts.push(AttemptRecord {
            attempt,
            succeeded: false,
            class: None,
            error: None,
            delay_ms: 0,
            at: now_ms(),
        });
    }

    /// Mark the latest attempt as successful
    pub(crate) fn mark_success(&mut self) {
        debug!(key = %self.key, "RetryContext::mark_success: called");
        if let Some(record) = self.attempts.last_mut() {
            record.succeeded = true;
        }
    }

    /// Mark the latest attempt as failed
    pub(crate) fn mark_failure(&mut self, class: ErrorClass, error: impl Into<String>, delay_ms: u64) {
        let error = error.into();
        debug!(key = %self.key, %class, %error, delay_ms, "RetryContext::mark_failure: called");
        if let Some(record) = self.attempts.last_mut() {
            record.class = Some(class);
            record.error = Some(error);
            record.delay_ms = delay_ms;
        }
    }

    /// Number of attempts made so far (including any in flight)
    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attempt_bookkeeping() {
        let mut ctx = RetryContext::new("download-42");

        ctx.begin_attempt(1);
        ctx.mark_failure(ErrorClass::Network, "connection reset", 1000);

        ctx.begin_attempt(2);
        ctx.mark_success();

        assert_eq!(ctx.attempt_count(), 2);
        assert!(!ctx.attempts[0].succeeded);
        assert_eq!(ctx.attempts[0].class, Some(ErrorClass::Network));
        assert_eq!(ctx.attempts[0].delay_ms, 1000);
        assert!(ctx.attempts[1].succeeded);
        assert!(ctx.attempts[1].class.is_none());
    }

    #[test]
    fn test_marks_without_attempts_are_noops() {
        let mut ctx = RetryContext::new("k");
        ctx.mark_success();
        ctx.mark_failure(ErrorClass::Unknown, "x", 0);
        assert_eq!(ctx.attempt_count(), 0);
    }
}
