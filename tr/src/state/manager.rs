//! TaskStateManager - lock-protected task state machines
//!
//! Owns the in-memory view of every task and mirrors each mutation to
//! the durable store under the same critical section. In-memory state is
//! the source of truth while the process lives; the store is the source
//! of truth across restarts, so the manager hydrates from it on open.
//!
//! Handler callbacks are always invoked outside the critical section on
//! a cloned record, so a handler may call back into the manager freely.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use statestore::{Checkpoint, Store, TaskRecord, TaskStatus, now_ms};

use super::error::{TaskError, TaskResult};
use super::handlers::{CheckpointHandler, HandlerRegistry, RecoveryHandler};

/// Counts by status and type, plus derived totals
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct TaskStatistics {
    /// Total number of tasks
    pub total: u64,
    /// Tasks waiting to start
    pub pending: u64,
    /// Actively executing tasks
    pub running: u64,
    /// Suspended tasks
    pub paused: u64,
    /// Tasks with a recovery handler in flight
    pub recovering: u64,
    /// Successfully finished tasks
    pub completed: u64,
    /// Failed tasks
    pub failed: u64,
    /// Tasks that can be resumed right now
    pub resumable: u64,
    /// Task counts per type tag
    pub by_type: HashMap<String, u64>,
}

/// Check whether a status transition is legal
///
/// The machine: `Pending -> Running -> {Paused, Completed, Failed}`;
/// `Running -> Recovering -> {Running, Failed}`; `Paused -> Recovering`;
/// `Failed -> Recovering` only when a checkpoint exists. `Recovering`
/// is always transient.
pub fn can_transition(from: TaskStatus, to: TaskStatus, has_checkpoint: bool) -> bool {
    use TaskStatus::*;
    matches!(
        (from, to),
        (Pending, Running)
            | (Running, Paused)
            | (Running, Completed)
            | (Running, Failed)
            | (Running, Recovering)
            | (Paused, Recovering)
            | (Recovering, Running)
            | (Recovering, Failed)
    ) || (from == Failed && to == Recovering && has_checkpoint)
}

/// Lock-protected view of all task state machines, mirrored to a store
pub struct TaskStateManager {
    store: Arc<Store>,
    tasks: Mutex<HashMap<String, TaskRecord>>,
    handlers: HandlerRegistry,
}

impl TaskStateManager {
    /// Open a manager over the given store, hydrating from prior rows
    pub fn new(store: Arc<Store>) -> TaskResult<Self> {
        debug!("TaskStateManager::new: called");
        let existing = store.all_tasks()?;
        let count = existing.len();
        let tasks = existing.into_iter().map(|task| (task.id.clone(), task)).collect();

        info!(count, "TaskStateManager: hydrated tasks from store");
        Ok(Self {
            store,
            tasks: Mutex::new(tasks),
            handlers: HandlerRegistry::default(),
        })
    }

    fn lock_tasks(&self) -> MutexGuard<'_, HashMap<String, TaskRecord>> {
        self.tasks.lock().expect("task map mutex poisoned")
    }

    /// Mirror a record to the durable store
    ///
    /// A store-write failure is logged, never rolled back: in-memory
    /// state stays authoritative for the lifetime of this process.
    fn persist(&self, task: &TaskRecord) {
        if let Err(e) = self.store.save_task(task) {
            error!(task_id = %task.id, error = %e, "persist: store write failed; in-memory state retained");
        }
    }

    /// Register the recovery handler for a task type
    pub fn register_recovery_handler(&self, task_type: impl Into<String>, handler: RecoveryHandler) {
        self.handlers.set_recovery(task_type, handler);
    }

    /// Register the checkpoint handler for a task type
    pub fn register_checkpoint_handler(&self, task_type: impl Into<String>, handler: CheckpointHandler) {
        self.handlers.set_checkpoint(task_type, handler);
    }

    pub(crate) fn recovery_handler_for(&self, task_type: &str) -> Option<RecoveryHandler> {
        self.handlers.recovery_for(task_type)
    }

    /// Create a new task; the id is generated when omitted
    pub fn create_task(
        &self,
        task_type: &str,
        id: Option<String>,
        initial_data: Map<String, Value>,
    ) -> TaskResult<String> {
        let id = id.unwrap_or_else(|| format!("task-{}", Uuid::now_v7()));
        debug!(%id, %task_type, "create_task: called");

        let mut tasks = self.lock_tasks();
        if tasks.contains_key(&id) {
            debug!(%id, "create_task: id already taken");
            return Err(TaskError::DuplicateTask(id));
        }

        let mut task = TaskRecord::with_id(&id, task_type);
        if !initial_data.is_empty() {
            task.merge_data(initial_data);
        }
        self.persist(&task);
        tasks.insert(id.clone(), task);

        info!(%id, %task_type, "Created task");
        Ok(id)
    }

    /// Transition a task to a new status, optionally recording an error
    pub fn update_status(&self, id: &str, status: TaskStatus, error_text: Option<&str>) -> TaskResult<()> {
        debug!(%id, ?status, "update_status: called");
        let mut tasks = self.lock_tasks();
        let task = tasks.get_mut(id).ok_or_else(|| TaskError::TaskNotFound(id.to_string()))?;

        if !can_transition(task.status, status, task.checkpoint.is_some()) {
            debug!(%id, from = %task.status, to = %status, "update_status: transition rejected");
            return Err(TaskError::InvalidTransition {
                id: id.to_string(),
                from: task.status,
                to: status,
            });
        }

        task.set_status(status);
        if let Some(text) = error_text {
            task.set_error(text);
        }
        self.persist(task);
        Ok(())
    }

    /// Update progress (clamped to [0, 100]) and merge a data patch
    pub fn update_progress(&self, id: &str, progress: f64, patch: Option<Map<String, Value>>) -> TaskResult<()> {
        debug!(%id, progress, "update_progress: called");
        let mut tasks = self.lock_tasks();
        let task = tasks.get_mut(id).ok_or_else(|| TaskError::TaskNotFound(id.to_string()))?;

        task.set_progress(progress);
        if let Some(patch) = patch {
            task.merge_data(patch);
        }
        self.persist(task);
        Ok(())
    }

    /// Write a checkpoint, replacing any existing one
    ///
    /// The registered checkpoint handler is invoked afterwards on a
    /// snapshot; its errors are swallowed so the checkpoint write can
    /// never fail because of a handler.
    pub fn create_checkpoint(&self, id: &str, step: &str, step_index: u64, payload: Value) -> TaskResult<()> {
        debug!(%id, %step, step_index, "create_checkpoint: called");
        let snapshot = {
            let mut tasks = self.lock_tasks();
            let task = tasks.get_mut(id).ok_or_else(|| TaskError::TaskNotFound(id.to_string()))?;

            if let Some(current) = &task.checkpoint
                && step_index < current.step_index
            {
                debug!(%id, current = current.step_index, proposed = step_index, "create_checkpoint: index regression rejected");
                return Err(TaskError::CheckpointOrder {
                    id: id.to_string(),
                    current: current.step_index,
                    proposed: step_index,
                });
            }

            task.set_checkpoint(Checkpoint::new(step, step_index, payload));
            self.persist(task);
            task.clone()
        };

        if let Some(handler) = self.handlers.checkpoint_for(&snapshot.task_type)
            && let Err(e) = handler(&snapshot)
        {
            warn!(%id, error = %e, "create_checkpoint: checkpoint handler failed; swallowed");
        }
        Ok(())
    }

    /// Check whether a task can be resumed right now
    ///
    /// False for unknown ids: an absent task has nothing to resume.
    pub fn can_resume(&self, id: &str) -> bool {
        debug!(%id, "can_resume: called");
        self.lock_tasks().get(id).is_some_and(TaskRecord::can_resume)
    }

    /// Resume a paused or failed task through its recovery handler
    ///
    /// The task moves to `Recovering`; the handler's verdict resolves it
    /// to `Running` (true, or no handler registered) or `Failed` (false
    /// or error). Returns the resolved status.
    pub fn resume_task(&self, id: &str) -> TaskResult<TaskStatus> {
        debug!(%id, "resume_task: called");
        let snapshot = {
            let mut tasks = self.lock_tasks();
            let task = tasks.get_mut(id).ok_or_else(|| TaskError::TaskNotFound(id.to_string()))?;

            if !task.can_resume() {
                debug!(%id, status = %task.status, "resume_task: not resumable");
                return Err(TaskError::NotResumable(id.to_string()));
            }

            task.set_status(TaskStatus::Recovering);
            task.increment_retry();
            self.persist(task);
            task.clone()
        };

        match self.handlers.recovery_for(&snapshot.task_type) {
            None => {
                debug!(%id, "resume_task: no handler registered, defaulting to running");
                self.finish_recovering(id, TaskStatus::Running, None);
                Ok(TaskStatus::Running)
            }
            Some(handler) => match handler(&snapshot) {
                Ok(true) => {
                    info!(%id, "resume_task: handler recovered task");
                    self.finish_recovering(id, TaskStatus::Running, None);
                    Ok(TaskStatus::Running)
                }
                Ok(false) => {
                    warn!(%id, "resume_task: handler declined recovery");
                    self.finish_recovering(id, TaskStatus::Failed, Some("recovery handler declined".to_string()));
                    Ok(TaskStatus::Failed)
                }
                Err(e) => {
                    let reason = format!("{e:#}");
                    warn!(%id, error = %reason, "resume_task: handler failed");
                    self.finish_recovering(id, TaskStatus::Failed, Some(format!("recovery handler error: {}", reason)));
                    Err(TaskError::RecoveryHandler {
                        id: id.to_string(),
                        reason,
                    })
                }
            },
        }
    }

    /// Resolve a `Recovering` task to its final status
    fn finish_recovering(&self, id: &str, to: TaskStatus, error_text: Option<String>) {
        debug!(%id, ?to, "finish_recovering: called");
        let mut tasks = self.lock_tasks();
        let Some(task) = tasks.get_mut(id) else {
            warn!(%id, "finish_recovering: task disappeared mid-recovery");
            return;
        };
        if task.status != TaskStatus::Recovering {
            warn!(%id, status = %task.status, "finish_recovering: task left recovering state concurrently");
            return;
        }
        task.set_status(to);
        if let Some(text) = error_text {
            task.set_error(text);
        }
        self.persist(task);
    }

    /// Pause a running task
    pub fn pause_task(&self, id: &str) -> TaskResult<()> {
        debug!(%id, "pause_task: called");
        self.update_status(id, TaskStatus::Paused, None)
    }

    /// Complete a task: progress 100, optional final data merge
    pub fn complete_task(&self, id: &str, final_data: Option<Map<String, Value>>) -> TaskResult<()> {
        debug!(%id, "complete_task: called");
        let mut tasks = self.lock_tasks();
        let task = tasks.get_mut(id).ok_or_else(|| TaskError::TaskNotFound(id.to_string()))?;

        if !can_transition(task.status, TaskStatus::Completed, task.checkpoint.is_some()) {
            return Err(TaskError::InvalidTransition {
                id: id.to_string(),
                from: task.status,
                to: TaskStatus::Completed,
            });
        }

        task.set_status(TaskStatus::Completed);
        task.set_progress(100.0);
        if let Some(data) = final_data {
            task.merge_data(data);
        }
        self.persist(task);
        info!(%id, "Completed task");
        Ok(())
    }

    /// Fail a task with an error message
    pub fn fail_task(&self, id: &str, error_text: &str) -> TaskResult<()> {
        debug!(%id, %error_text, "fail_task: called");
        self.update_status(id, TaskStatus::Failed, Some(error_text))
    }

    /// Delete a task from memory and store
    pub fn delete_task(&self, id: &str) -> TaskResult<()> {
        debug!(%id, "delete_task: called");
        let mut tasks = self.lock_tasks();
        if tasks.remove(id).is_none() {
            return Err(TaskError::TaskNotFound(id.to_string()));
        }
        self.store.delete_task(id)?;
        Ok(())
    }

    /// Snapshot of one task
    pub fn get_task(&self, id: &str) -> Option<TaskRecord> {
        debug!(%id, "get_task: called");
        self.lock_tasks().get(id).cloned()
    }

    /// Snapshot of tasks with the given status, optionally by type
    pub fn tasks_by_status(&self, status: TaskStatus, task_type: Option<&str>) -> Vec<TaskRecord> {
        debug!(%status, ?task_type, "tasks_by_status: called");
        self.lock_tasks()
            .values()
            .filter(|task| task.status == status)
            .filter(|task| task_type.is_none_or(|t| task.task_type == t))
            .cloned()
            .collect()
    }

    /// Snapshot of every task that can be resumed right now
    pub fn resumable_tasks(&self) -> Vec<TaskRecord> {
        debug!("resumable_tasks: called");
        self.lock_tasks()
            .values()
            .filter(|task| task.can_resume())
            .cloned()
            .collect()
    }

    /// Consistent snapshot of counts by status and type
    pub fn statistics(&self) -> TaskStatistics {
        debug!("statistics: called");
        let tasks = self.lock_tasks();
        let mut stats = TaskStatistics::default();

        for task in tasks.values() {
            stats.total += 1;
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Paused => stats.paused += 1,
                TaskStatus::Recovering => stats.recovering += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
            }
            if task.can_resume() {
                stats.resumable += 1;
            }
            *stats.by_type.entry(task.task_type.clone()).or_insert(0) += 1;
        }

        stats
    }

    /// Remove completed tasks older than the retention window
    pub fn clean_completed_tasks(&self, retention: Duration) -> usize {
        debug!(?retention, "clean_completed_tasks: called");
        let cutoff = now_ms() - retention.as_millis() as i64;
        let mut tasks = self.lock_tasks();

        let stale: Vec<String> = tasks
            .values()
            .filter(|task| task.status == TaskStatus::Completed && task.updated_at < cutoff)
            .map(|task| task.id.clone())
            .collect();

        for id in &stale {
            tasks.remove(id);
            if let Err(e) = self.store.delete_task(id) {
                error!(task_id = %id, error = %e, "clean_completed_tasks: store delete failed");
            }
        }

        if !stale.is_empty() {
            info!(count = stale.len(), "Reaped completed tasks past retention");
        }
        stale.len()
    }

    /// Demote every running task to paused (graceful shutdown path)
    pub fn demote_running(&self, reason: &str) -> usize {
        debug!(%reason, "demote_running: called");
        let mut tasks = self.lock_tasks();
        let mut demoted = 0;

        for task in tasks.values_mut() {
            if task.status == TaskStatus::Running {
                task.set_status(TaskStatus::Paused);
                task.set_error(reason);
                self.persist(task);
                demoted += 1;
            }
        }

        if demoted > 0 {
            info!(demoted, "Demoted running tasks to paused");
        }
        demoted
    }

    /// Set a task's status without transition validation
    ///
    /// Crash reconciliation only: the recovery pass is repairing state
    /// left behind by a dead process, which the live-process state
    /// machine has no edges for.
    pub(crate) fn force_status(&self, id: &str, status: TaskStatus, error_text: Option<String>) {
        debug!(%id, ?status, "force_status: called");
        let mut tasks = self.lock_tasks();
        let Some(task) = tasks.get_mut(id) else {
            warn!(%id, "force_status: task not found");
            return;
        };
        task.set_status(status);
        if let Some(text) = error_text {
            task.set_error(text);
        }
        self.persist(task);
    }

    /// Persist every record and surface the first store failure
    pub fn close(&self) -> TaskResult<()> {
        debug!("close: called");
        let tasks = self.lock_tasks();
        let mut first_error = None;

        for task in tasks.values() {
            if let Err(e) = self.store.save_task(task) {
                error!(task_id = %task.id, error = %e, "close: final persist failed");
                first_error.get_or_insert(e);
            }
        }

        info!(count = tasks.len(), "TaskStateManager closed");
        match first_error {
            Some(e) => Err(TaskError::Storage(e)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn manager(temp: &tempfile::TempDir) -> TaskStateManager {
        let store = Arc::new(Store::open(temp.path().join("state.db")).unwrap());
        TaskStateManager::new(store).unwrap()
    }

    fn data(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_create_task_generates_id() {
        let temp = tempdir().unwrap();
        let mgr = manager(&temp);

        let id = mgr.create_task("download", None, Map::new()).unwrap();
        assert!(id.starts_with("task-"));

        let task = mgr.get_task(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
    }

    #[test]
    fn test_create_task_duplicate_id() {
        let temp = tempdir().unwrap();
        let mgr = manager(&temp);

        mgr.create_task("download", Some("t1".to_string()), Map::new()).unwrap();
        let result = mgr.create_task("download", Some("t1".to_string()), Map::new());
        assert!(matches!(result, Err(TaskError::DuplicateTask(_))));
    }

    #[test]
    fn test_create_task_with_initial_data() {
        let temp = tempdir().unwrap();
        let mgr = manager(&temp);

        mgr.create_task(
            "download",
            Some("t1".to_string()),
            data(&[("url", json!("https://example.com"))]),
        )
        .unwrap();

        let task = mgr.get_task("t1").unwrap();
        assert_eq!(task.data.get("url"), Some(&json!("https://example.com")));
    }

    #[test]
    fn test_valid_lifecycle_transitions() {
        let temp = tempdir().unwrap();
        let mgr = manager(&temp);

        mgr.create_task("download", Some("t1".to_string()), Map::new()).unwrap();
        mgr.update_status("t1", TaskStatus::Running, None).unwrap();
        mgr.pause_task("t1").unwrap();
        assert_eq!(mgr.get_task("t1").unwrap().status, TaskStatus::Paused);
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let temp = tempdir().unwrap();
        let mgr = manager(&temp);

        mgr.create_task("download", Some("t1".to_string()), Map::new()).unwrap();

        // Pending -> Paused is not an edge
        let result = mgr.update_status("t1", TaskStatus::Paused, None);
        assert!(matches!(result, Err(TaskError::InvalidTransition { .. })));

        // Completed is terminal
        mgr.update_status("t1", TaskStatus::Running, None).unwrap();
        mgr.complete_task("t1", None).unwrap();
        let result = mgr.update_status("t1", TaskStatus::Running, None);
        assert!(matches!(result, Err(TaskError::InvalidTransition { .. })));
    }

    #[test]
    fn test_update_status_unknown_task() {
        let temp = tempdir().unwrap();
        let mgr = manager(&temp);
        let result = mgr.update_status("nope", TaskStatus::Running, None);
        assert!(matches!(result, Err(TaskError::TaskNotFound(_))));
    }

    #[test]
    fn test_update_progress_clamps_and_merges() {
        let temp = tempdir().unwrap();
        let mgr = manager(&temp);

        mgr.create_task("download", Some("t1".to_string()), Map::new()).unwrap();
        mgr.update_progress("t1", 150.0, Some(data(&[("chunk", json!(3))]))).unwrap();

        let task = mgr.get_task("t1").unwrap();
        assert_eq!(task.progress, 100.0);
        assert_eq!(task.data.get("chunk"), Some(&json!(3)));

        mgr.update_progress("t1", -20.0, None).unwrap();
        assert_eq!(mgr.get_task("t1").unwrap().progress, 0.0);
    }

    proptest::proptest! {
        #[test]
        fn prop_update_progress_stays_in_range(input in proptest::num::f64::ANY) {
            let temp = tempdir().unwrap();
            let mgr = manager(&temp);
            mgr.create_task("download", Some("t1".to_string()), Map::new()).unwrap();

            mgr.update_progress("t1", input, None).unwrap();
            let progress = mgr.get_task("t1").unwrap().progress;
            proptest::prop_assert!((0.0..=100.0).contains(&progress));
        }
    }

    #[test]
    fn test_checkpoint_replaces_previous() {
        let temp = tempdir().unwrap();
        let mgr = manager(&temp);

        mgr.create_task("download", Some("t1".to_string()), Map::new()).unwrap();
        mgr.create_checkpoint("t1", "chunk1", 1, json!({"bytes": 100})).unwrap();
        mgr.create_checkpoint("t1", "chunk2", 2, json!({"bytes": 200})).unwrap();

        let cp = mgr.get_task("t1").unwrap().checkpoint.unwrap();
        assert_eq!(cp.step, "chunk2");
        assert_eq!(cp.payload, json!({"bytes": 200}));
    }

    #[test]
    fn test_checkpoint_index_regression_rejected() {
        let temp = tempdir().unwrap();
        let mgr = manager(&temp);

        mgr.create_task("download", Some("t1".to_string()), Map::new()).unwrap();
        mgr.create_checkpoint("t1", "chunk5", 5, json!(null)).unwrap();

        let result = mgr.create_checkpoint("t1", "chunk3", 3, json!(null));
        assert!(matches!(result, Err(TaskError::CheckpointOrder { .. })));

        // Equal index is allowed (non-decreasing)
        mgr.create_checkpoint("t1", "chunk5-redo", 5, json!(null)).unwrap();
        assert_eq!(mgr.get_task("t1").unwrap().checkpoint.unwrap().step, "chunk5-redo");
    }

    #[test]
    fn test_checkpoint_handler_errors_swallowed() {
        let temp = tempdir().unwrap();
        let mgr = manager(&temp);

        mgr.register_checkpoint_handler("download", Arc::new(|_task| Err(eyre::eyre!("handler exploded"))));

        mgr.create_task("download", Some("t1".to_string()), Map::new()).unwrap();
        // The write itself must never fail because of a handler
        mgr.create_checkpoint("t1", "chunk1", 1, json!(null)).unwrap();
        assert!(mgr.get_task("t1").unwrap().checkpoint.is_some());
    }

    #[test]
    fn test_checkpoint_handler_sees_snapshot() {
        let temp = tempdir().unwrap();
        let mgr = manager(&temp);

        let seen = Arc::new(Mutex::new(None));
        let seen_clone = seen.clone();
        mgr.register_checkpoint_handler(
            "download",
            Arc::new(move |task| {
                *seen_clone.lock().unwrap() = task.checkpoint.clone();
                Ok(())
            }),
        );

        mgr.create_task("download", Some("t1".to_string()), Map::new()).unwrap();
        mgr.create_checkpoint("t1", "chunk1", 1, json!({"bytes": 10})).unwrap();

        let observed = seen.lock().unwrap().clone().unwrap();
        assert_eq!(observed.step, "chunk1");
    }

    #[test]
    fn test_can_resume_gating() {
        let temp = tempdir().unwrap();
        let mgr = manager(&temp);

        mgr.create_task("download", Some("t1".to_string()), Map::new()).unwrap();
        assert!(!mgr.can_resume("t1"));
        assert!(!mgr.can_resume("missing"));

        mgr.update_status("t1", TaskStatus::Running, None).unwrap();
        mgr.pause_task("t1").unwrap();
        // Paused but no checkpoint: still not resumable
        assert!(!mgr.can_resume("t1"));

        // Checkpoint written while paused makes it resumable
        mgr.create_checkpoint("t1", "chunk1", 1, json!(null)).unwrap();
        assert!(mgr.can_resume("t1"));
    }

    #[test]
    fn test_resume_without_handler_defaults_to_running() {
        let temp = tempdir().unwrap();
        let mgr = manager(&temp);

        mgr.create_task("download", Some("t1".to_string()), Map::new()).unwrap();
        mgr.update_status("t1", TaskStatus::Running, None).unwrap();
        mgr.create_checkpoint("t1", "chunk1", 1, json!(null)).unwrap();
        mgr.pause_task("t1").unwrap();

        let status = mgr.resume_task("t1").unwrap();
        assert_eq!(status, TaskStatus::Running);

        let task = mgr.get_task("t1").unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.retry_count, 1);
    }

    #[test]
    fn test_resume_handler_true_resolves_running() {
        let temp = tempdir().unwrap();
        let mgr = manager(&temp);

        mgr.register_recovery_handler("download", Arc::new(|task| Ok(task.checkpoint.is_some())));

        mgr.create_task("download", Some("t1".to_string()), Map::new()).unwrap();
        mgr.update_status("t1", TaskStatus::Running, None).unwrap();
        mgr.create_checkpoint("t1", "chunk1", 1, json!(null)).unwrap();
        mgr.pause_task("t1").unwrap();

        assert_eq!(mgr.resume_task("t1").unwrap(), TaskStatus::Running);
    }

    #[test]
    fn test_resume_handler_false_resolves_failed() {
        let temp = tempdir().unwrap();
        let mgr = manager(&temp);

        mgr.register_recovery_handler("download", Arc::new(|_task| Ok(false)));

        mgr.create_task("download", Some("t1".to_string()), Map::new()).unwrap();
        mgr.update_status("t1", TaskStatus::Running, None).unwrap();
        mgr.create_checkpoint("t1", "chunk1", 1, json!(null)).unwrap();
        mgr.pause_task("t1").unwrap();

        assert_eq!(mgr.resume_task("t1").unwrap(), TaskStatus::Failed);
        let task = mgr.get_task("t1").unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.last_error.unwrap().contains("declined"));
    }

    #[test]
    fn test_resume_handler_error_fails_task_and_surfaces() {
        let temp = tempdir().unwrap();
        let mgr = manager(&temp);

        mgr.register_recovery_handler("download", Arc::new(|_task| Err(eyre::eyre!("lost the worktree"))));

        mgr.create_task("download", Some("t1".to_string()), Map::new()).unwrap();
        mgr.update_status("t1", TaskStatus::Running, None).unwrap();
        mgr.create_checkpoint("t1", "chunk1", 1, json!(null)).unwrap();
        mgr.pause_task("t1").unwrap();

        let result = mgr.resume_task("t1");
        assert!(matches!(result, Err(TaskError::RecoveryHandler { .. })));
        assert_eq!(mgr.get_task("t1").unwrap().status, TaskStatus::Failed);
    }

    #[test]
    fn test_resume_failed_task_requires_checkpoint() {
        let temp = tempdir().unwrap();
        let mgr = manager(&temp);

        mgr.create_task("download", Some("t1".to_string()), Map::new()).unwrap();
        mgr.update_status("t1", TaskStatus::Running, None).unwrap();
        mgr.fail_task("t1", "boom").unwrap();

        let result = mgr.resume_task("t1");
        assert!(matches!(result, Err(TaskError::NotResumable(_))));
    }

    #[test]
    fn test_resume_failed_task_with_checkpoint() {
        let temp = tempdir().unwrap();
        let mgr = manager(&temp);

        mgr.create_task("download", Some("t1".to_string()), Map::new()).unwrap();
        mgr.update_status("t1", TaskStatus::Running, None).unwrap();
        mgr.create_checkpoint("t1", "chunk2", 2, json!(null)).unwrap();
        mgr.fail_task("t1", "boom").unwrap();

        assert_eq!(mgr.resume_task("t1").unwrap(), TaskStatus::Running);
    }

    #[test]
    fn test_pause_only_from_running() {
        let temp = tempdir().unwrap();
        let mgr = manager(&temp);

        mgr.create_task("download", Some("t1".to_string()), Map::new()).unwrap();
        let result = mgr.pause_task("t1");
        assert!(matches!(result, Err(TaskError::InvalidTransition { .. })));
    }

    #[test]
    fn test_complete_sets_progress_and_merges() {
        let temp = tempdir().unwrap();
        let mgr = manager(&temp);

        mgr.create_task("download", Some("t1".to_string()), Map::new()).unwrap();
        mgr.update_status("t1", TaskStatus::Running, None).unwrap();
        mgr.update_progress("t1", 80.0, None).unwrap();
        mgr.complete_task("t1", Some(data(&[("output", json!("/srv/media/a.mp4"))]))).unwrap();

        let task = mgr.get_task("t1").unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress, 100.0);
        assert_eq!(task.data.get("output"), Some(&json!("/srv/media/a.mp4")));
    }

    #[test]
    fn test_statistics() {
        let temp = tempdir().unwrap();
        let mgr = manager(&temp);

        mgr.create_task("download", Some("t1".to_string()), Map::new()).unwrap();
        mgr.create_task("download", Some("t2".to_string()), Map::new()).unwrap();
        mgr.create_task("quiz", Some("t3".to_string()), Map::new()).unwrap();

        mgr.update_status("t1", TaskStatus::Running, None).unwrap();
        mgr.update_status("t2", TaskStatus::Running, None).unwrap();
        mgr.create_checkpoint("t2", "chunk1", 1, json!(null)).unwrap();
        mgr.pause_task("t2").unwrap();

        let stats = mgr.statistics();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.running, 1);
        assert_eq!(stats.paused, 1);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.resumable, 1);
        assert_eq!(stats.by_type.get("download"), Some(&2));
        assert_eq!(stats.by_type.get("quiz"), Some(&1));
    }

    #[test]
    fn test_clean_completed_tasks_respects_retention() {
        let temp = tempdir().unwrap();
        let mgr = manager(&temp);

        mgr.create_task("download", Some("old".to_string()), Map::new()).unwrap();
        mgr.update_status("old", TaskStatus::Running, None).unwrap();
        mgr.complete_task("old", None).unwrap();

        // Zero retention reaps anything completed before "now"
        std::thread::sleep(Duration::from_millis(5));
        let removed = mgr.clean_completed_tasks(Duration::ZERO);
        assert_eq!(removed, 1);
        assert!(mgr.get_task("old").is_none());
    }

    #[test]
    fn test_clean_completed_keeps_recent_and_unfinished() {
        let temp = tempdir().unwrap();
        let mgr = manager(&temp);

        mgr.create_task("download", Some("fresh".to_string()), Map::new()).unwrap();
        mgr.update_status("fresh", TaskStatus::Running, None).unwrap();
        mgr.complete_task("fresh", None).unwrap();

        mgr.create_task("download", Some("live".to_string()), Map::new()).unwrap();

        let removed = mgr.clean_completed_tasks(Duration::from_secs(3600));
        assert_eq!(removed, 0);
        assert!(mgr.get_task("fresh").is_some());
        assert!(mgr.get_task("live").is_some());
    }

    #[test]
    fn test_demote_running() {
        let temp = tempdir().unwrap();
        let mgr = manager(&temp);

        mgr.create_task("download", Some("t1".to_string()), Map::new()).unwrap();
        mgr.create_task("download", Some("t2".to_string()), Map::new()).unwrap();
        mgr.update_status("t1", TaskStatus::Running, None).unwrap();

        let demoted = mgr.demote_running("shutdown requested");
        assert_eq!(demoted, 1);
        assert_eq!(mgr.get_task("t1").unwrap().status, TaskStatus::Paused);
        assert_eq!(mgr.get_task("t2").unwrap().status, TaskStatus::Pending);
    }

    #[test]
    fn test_delete_task() {
        let temp = tempdir().unwrap();
        let mgr = manager(&temp);

        mgr.create_task("download", Some("t1".to_string()), Map::new()).unwrap();
        mgr.delete_task("t1").unwrap();
        assert!(mgr.get_task("t1").is_none());
        assert!(matches!(mgr.delete_task("t1"), Err(TaskError::TaskNotFound(_))));
    }

    #[test]
    fn test_hydration_across_restart() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("state.db");

        {
            let store = Arc::new(Store::open(&path).unwrap());
            let mgr = TaskStateManager::new(store).unwrap();
            mgr.create_task("download", Some("t1".to_string()), Map::new()).unwrap();
            mgr.update_status("t1", TaskStatus::Running, None).unwrap();
            mgr.create_checkpoint("t1", "chunk3", 3, json!({"bytes": 450000})).unwrap();
            mgr.close().unwrap();
        }

        // Fresh store handle and manager: the store is the source of
        // truth across restarts
        let store = Arc::new(Store::open(&path).unwrap());
        let mgr = TaskStateManager::new(store).unwrap();

        let task = mgr.get_task("t1").unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.checkpoint.unwrap().payload, json!({"bytes": 450000}));
    }

    #[test]
    fn test_transition_table() {
        use TaskStatus::*;
        assert!(can_transition(Pending, Running, false));
        assert!(can_transition(Running, Paused, false));
        assert!(can_transition(Running, Completed, false));
        assert!(can_transition(Running, Failed, false));
        assert!(can_transition(Running, Recovering, false));
        assert!(can_transition(Paused, Recovering, false));
        assert!(can_transition(Recovering, Running, false));
        assert!(can_transition(Recovering, Failed, false));
        assert!(can_transition(Failed, Recovering, true));

        assert!(!can_transition(Failed, Recovering, false));
        assert!(!can_transition(Pending, Paused, false));
        assert!(!can_transition(Completed, Running, true));
        assert!(!can_transition(Paused, Running, false));
        assert!(!can_transition(Pending, Completed, false));
    }
}
