//! TaskRecovery - crash-safe execution state for interruption-prone jobs
//!
//! TaskRecovery lets long-running jobs (anything that can be killed
//! mid-flight: a crashed process, a killed container, an unplugged
//! machine) resume exactly where they left off, with bounded,
//! policy-driven retries for transient failures.
//!
//! # Core Concepts
//!
//! - **Durable checkpoints**: each task carries one overwritable resume
//!   point, mirrored to a SQLite-backed store on every mutation
//! - **Crash evidence on disk**: a PID marker and a lock marker tell the
//!   next startup whether the previous run died mid-flight
//! - **Classified retries**: failures map onto a fixed taxonomy, each
//!   class with its own capped, optionally jittered backoff policy
//! - **Explicit ownership**: everything is constructor-injected; there
//!   is no process-wide implicit state
//!
//! # Modules
//!
//! - [`retry`] - failure classification and policy-driven retry engine
//! - [`state`] - lock-protected task state machines over a durable store
//! - [`recovery`] - crash detection, recovery passes, shutdown sequencing
//! - [`config`] - configuration types and loading
//!
//! This crate is a library consumed by a host process; it exposes no
//! network protocol or CLI surface.

pub mod config;
pub mod recovery;
pub mod retry;
pub mod state;

// Re-export commonly used types
pub use config::{RecoveryConfig, RetentionConfig, RuntimeConfig, StorageConfig};
pub use recovery::{
    CleanupHandler, LockRegistry, PidMarker, RecoveryCoordinator, RecoveryError, ResourceGuard, ShutdownHandler,
    is_process_alive,
};
pub use retry::{
    AttemptRecord, Backoff, Classified, Classifier, ErrorClass, RetryContext, RetryEngine, RetryError, RetryOptions,
    RetryPolicy, classify_message,
};
pub use state::{CheckpointHandler, RecoveryHandler, TaskError, TaskResult, TaskStateManager, TaskStatistics};

// Re-export statestore types for convenience
pub use statestore::{
    Checkpoint, RecoverySession, RecoveryStatus, SessionRecord, SessionStatus, Store, StoreError, StoreStats,
    TaskRecord, TaskStatus, now_ms,
};
