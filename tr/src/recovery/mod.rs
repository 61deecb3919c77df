//! Crash detection and recovery
//!
//! Liveness artifacts (PID marker, lock marker), named-resource locks,
//! and the coordinator that decides on startup whether the previous run
//! crashed and repairs task state if it did.

mod coordinator;
mod liveness;
mod locks;

pub use coordinator::{CleanupHandler, RecoveryCoordinator, RecoveryError, ShutdownHandler};
pub use liveness::{PidMarker, is_process_alive};
pub use locks::{LockRegistry, ResourceGuard};
