//! Per-task-type handler registries
//!
//! Dispatch is by task-type tag: a typed registry mapping the tag to a
//! function value, registered by the host process.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::debug;

use statestore::TaskRecord;

/// Decides whether a task could be recovered; an Err counts as failure
pub type RecoveryHandler = Arc<dyn Fn(&TaskRecord) -> eyre::Result<bool> + Send + Sync>;

/// Observes a freshly written checkpoint; errors are swallowed
pub type CheckpointHandler = Arc<dyn Fn(&TaskRecord) -> eyre::Result<()> + Send + Sync>;

/// Type-keyed registries for recovery and checkpoint handlers
#[derive(Default)]
pub(crate) struct HandlerRegistry {
    recovery: RwLock<HashMap<String, RecoveryHandler>>,
    checkpoint: RwLock<HashMap<String, CheckpointHandler>>,
}

impl HandlerRegistry {
    pub(crate) fn set_recovery(&self, task_type: impl Into<String>, handler: RecoveryHandler) {
        let task_type = task_type.into();
        debug!(%task_type, "HandlerRegistry::set_recovery: called");
        self.recovery
            .write()
            .expect("recovery handler lock poisoned")
            .insert(task_type, handler);
    }

    pub(crate) fn set_checkpoint(&self, task_type: impl Into<String>, handler: CheckpointHandler) {
        let task_type = task_type.into();
        debug!(%task_type, "HandlerRegistry::set_checkpoint: called");
        self.checkpoint
            .write()
            .expect("checkpoint handler lock poisoned")
            .insert(task_type, handler);
    }

    pub(crate) fn recovery_for(&self, task_type: &str) -> Option<RecoveryHandler> {
        self.recovery
            .read()
            .expect("recovery handler lock poisoned")
            .get(task_type)
            .cloned()
    }

    pub(crate) fn checkpoint_for(&self, task_type: &str) -> Option<CheckpointHandler> {
        self.checkpoint
            .read()
            .expect("checkpoint handler lock poisoned")
            .get(task_type)
            .cloned()
    }
}
