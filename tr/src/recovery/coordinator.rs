//! Recovery coordinator
//!
//! Decides on startup whether the previous run crashed, orchestrates
//! the recovery pass (cleanup handlers, stale artifacts, task repair),
//! and owns graceful-shutdown sequencing for the running process.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use serde_json::json;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use statestore::{RecoverySession, Store, TaskStatus};

use crate::config::{RetentionConfig, RuntimeConfig};
use crate::state::TaskStateManager;

use super::liveness::{PidMarker, is_process_alive};
use super::locks::{LockRegistry, ResourceGuard};

/// Lock name held for the whole life of a normally operating process
const MAIN_PROCESS_LOCK: &str = "main_process";

/// Releases an external resource during crash recovery; errors are
/// logged and swallowed
pub type CleanupHandler = Arc<dyn Fn() -> eyre::Result<()> + Send + Sync>;

/// Runs during graceful shutdown; errors are logged and swallowed
pub type ShutdownHandler = Arc<dyn Fn() -> eyre::Result<()> + Send + Sync>;

/// Errors from crash detection and recovery
#[derive(Debug, Error)]
pub enum RecoveryError {
    /// The PID marker belongs to a process that is still alive. Two
    /// instances would race on the same store: abort startup.
    #[error("Another live instance holds the PID marker (pid {pid})")]
    InstanceAlreadyRunning { pid: u32 },

    #[error("Storage error: {0}")]
    Storage(#[from] statestore::StoreError),

    #[error("Liveness artifact error: {0}")]
    Artifact(String),
}

/// Crash detection, recovery passes, and shutdown sequencing
pub struct RecoveryCoordinator {
    store: Arc<Store>,
    state: Arc<TaskStateManager>,
    pid_marker: PidMarker,
    locks: LockRegistry,
    temp_dir: PathBuf,
    cleanup_handlers: RwLock<Vec<(String, CleanupHandler)>>,
    shutdown_handlers: RwLock<Vec<ShutdownHandler>>,
    shutdown_done: AtomicBool,
}

impl RecoveryCoordinator {
    /// Create a coordinator over the given store and state manager
    pub fn new(store: Arc<Store>, state: Arc<TaskStateManager>, runtime: &RuntimeConfig) -> Self {
        debug!(?runtime.pid_file, ?runtime.lock_file, "RecoveryCoordinator::new: called");
        Self {
            store,
            state,
            pid_marker: PidMarker::new(&runtime.pid_file),
            locks: LockRegistry::new(&runtime.lock_file),
            temp_dir: runtime.temp_dir.clone(),
            cleanup_handlers: RwLock::new(Vec::new()),
            shutdown_handlers: RwLock::new(Vec::new()),
            shutdown_done: AtomicBool::new(false),
        }
    }

    /// Register a named cleanup handler run during crash recovery
    pub fn register_cleanup_handler(&self, name: impl Into<String>, handler: CleanupHandler) {
        let name = name.into();
        debug!(%name, "register_cleanup_handler: called");
        self.cleanup_handlers
            .write()
            .expect("cleanup handler lock poisoned")
            .push((name, handler));
    }

    /// Register a handler run during graceful shutdown
    pub fn register_shutdown_handler(&self, handler: ShutdownHandler) {
        debug!("register_shutdown_handler: called");
        self.shutdown_handlers
            .write()
            .expect("shutdown handler lock poisoned")
            .push(handler);
    }

    /// Decide whether the previous run crashed
    ///
    /// No PID marker: clean start. Marker held by a process that is
    /// verifiably alive: hard error, a second instance must not proceed.
    /// Otherwise crash evidence is a leftover lock marker or any task
    /// stuck in an active status.
    pub fn detect_crash_on_startup(&self) -> Result<bool, RecoveryError> {
        debug!("detect_crash_on_startup: called");

        let Some(pid) = self.pid_marker.read() else {
            debug!("detect_crash_on_startup: no PID marker, clean start");
            return Ok(false);
        };

        if pid != std::process::id() && is_process_alive(pid) {
            warn!(pid, "detect_crash_on_startup: PID marker belongs to a live process");
            return Err(RecoveryError::InstanceAlreadyRunning { pid });
        }

        if self.locks.marker_exists() {
            info!(pid, "detect_crash_on_startup: stale lock marker present, crash detected");
            return Ok(true);
        }

        let interrupted = self.interrupted_tasks();
        if !interrupted.is_empty() {
            info!(
                pid,
                count = interrupted.len(),
                "detect_crash_on_startup: tasks left in active status, crash detected"
            );
            return Ok(true);
        }

        debug!(pid, "detect_crash_on_startup: stale PID marker but nothing to recover");
        Ok(false)
    }

    /// Tasks a dead process left in Running/Paused/Recovering
    fn interrupted_tasks(&self) -> Vec<statestore::TaskRecord> {
        let mut tasks = self.state.tasks_by_status(TaskStatus::Running, None);
        tasks.extend(self.state.tasks_by_status(TaskStatus::Paused, None));
        tasks.extend(self.state.tasks_by_status(TaskStatus::Recovering, None));
        tasks
    }

    /// Run a full recovery pass and append its audit record to the log
    ///
    /// Individual task or handler failures never abort the pass; only an
    /// internal error marks the session failed.
    pub fn recover_from_crash(&self) -> Result<RecoverySession, RecoveryError> {
        info!("Starting crash recovery pass");
        let mut session = RecoverySession::begin(std::process::id());

        match self.run_recovery_pass(&mut session) {
            Ok(()) => {
                session.finish_completed();
                info!(
                    recovered = session.recovered_tasks.len(),
                    cleaned = session.cleaned_resources.len(),
                    "Crash recovery pass completed"
                );
            }
            Err(e) => {
                error!(error = %format!("{e:#}"), "Crash recovery pass failed");
                session.finish_failed(format!("{e:#}"));
            }
        }

        self.store.append_recovery_event(&session)?;
        Ok(session)
    }

    fn run_recovery_pass(&self, session: &mut RecoverySession) -> eyre::Result<()> {
        // Phase 1: clear liveness artifacts and stale resources
        if self.pid_marker.exists() {
            self.pid_marker.remove()?;
            session.record_cleaned("pid_marker");
        }
        match self.locks.remove_stale_marker() {
            Ok(true) => session.record_cleaned("lock_marker"),
            Ok(false) => {}
            Err(e) => warn!(error = %e, "run_recovery_pass: could not remove stale lock marker"),
        }
        for name in self.sweep_temp_files() {
            session.record_cleaned(format!("tmp:{}", name));
        }

        let handlers: Vec<(String, CleanupHandler)> = self
            .cleanup_handlers
            .read()
            .expect("cleanup handler lock poisoned")
            .clone();
        for (name, handler) in handlers {
            match handler() {
                Ok(()) => {
                    debug!(%name, "run_recovery_pass: cleanup handler succeeded");
                    session.record_cleaned(name);
                }
                Err(e) => {
                    // Swallowed: cleanup failures must never abort recovery
                    warn!(%name, error = %format!("{e:#}"), "run_recovery_pass: cleanup handler failed");
                }
            }
        }

        // Phase 2: repair interrupted tasks
        for task in self.interrupted_tasks() {
            let default_recovered = task.checkpoint.is_some();
            let verdict = match self.state.recovery_handler_for(&task.task_type) {
                Some(handler) => match handler(&task) {
                    Ok(recovered) => {
                        debug!(task_id = %task.id, recovered, "run_recovery_pass: handler verdict");
                        if recovered {
                            Ok(())
                        } else {
                            Err("recovery handler declined".to_string())
                        }
                    }
                    Err(e) => Err(format!("recovery handler error: {e:#}")),
                },
                None if default_recovered => Ok(()),
                None => Err("no checkpoint at crash".to_string()),
            };

            match verdict {
                Ok(()) => {
                    info!(task_id = %task.id, "run_recovery_pass: task recovered, marked resumable");
                    self.state.force_status(&task.id, TaskStatus::Paused, None);
                    session.record_recovered(&task.id);
                }
                Err(reason) => {
                    warn!(task_id = %task.id, %reason, "run_recovery_pass: task not recoverable");
                    self.state.force_status(&task.id, TaskStatus::Failed, Some(reason));
                }
            }
        }

        // Phase 3: diagnostics snapshot
        let stats = self.state.statistics();
        session.set_diagnostics(json!({
            "pid": std::process::id(),
            "tasks_total": stats.total,
            "tasks_recovered": session.recovered_tasks.len(),
            "tasks_failed": stats.failed,
            "resident_kb": read_resident_kb(),
        }));

        Ok(())
    }

    /// Remove stale `*.tmp` files from the configured temp dir
    fn sweep_temp_files(&self) -> Vec<String> {
        debug!(?self.temp_dir, "sweep_temp_files: called");
        let Ok(entries) = std::fs::read_dir(&self.temp_dir) else {
            debug!("sweep_temp_files: temp dir not readable, skipping");
            return Vec::new();
        };

        let mut swept = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "tmp") {
                match std::fs::remove_file(&path) {
                    Ok(()) => {
                        debug!(?path, "sweep_temp_files: removed");
                        swept.push(entry.file_name().to_string_lossy().to_string());
                    }
                    Err(e) => warn!(?path, error = %e, "sweep_temp_files: remove failed"),
                }
            }
        }
        swept
    }

    /// Acquire a named resource lock; false if already held
    pub fn acquire_lock(&self, name: &str) -> bool {
        self.locks.acquire(name)
    }

    /// Release a named resource lock; false if it was not held
    pub fn release_lock(&self, name: &str) -> bool {
        self.locks.release(name)
    }

    /// Scoped acquisition: the lock is released when the guard drops
    pub fn lock_guard<'a>(&'a self, name: &str) -> Option<ResourceGuard<'a>> {
        self.locks.guard(name)
    }

    /// Begin normal operation: PID marker plus the main-process lock
    pub fn start_normal_operation(&self) -> Result<(), RecoveryError> {
        debug!("start_normal_operation: called");
        self.pid_marker
            .write_current()
            .map_err(|e| RecoveryError::Artifact(format!("{e:#}")))?;

        if !self.locks.acquire(MAIN_PROCESS_LOCK) {
            return Err(RecoveryError::Artifact(format!(
                "{} lock already held in this process",
                MAIN_PROCESS_LOCK
            )));
        }

        info!(pid = std::process::id(), "Normal operation started");
        Ok(())
    }

    /// Periodic maintenance: reap completed tasks, purge expired
    /// sessions, prune old recovery log rows, reclaim space
    pub fn run_maintenance(&self, retention: &RetentionConfig) -> Result<(), RecoveryError> {
        debug!(?retention, "run_maintenance: called");
        let task_window = std::time::Duration::from_secs(retention.completed_task_hours * 3600);
        let reaped = self.state.clean_completed_tasks(task_window);

        let now = statestore::now_ms();
        let purged = self.store.purge_expired_sessions(now)?;

        let log_cutoff = now - (retention.recovery_log_days as i64) * 24 * 3600 * 1000;
        let pruned = self.store.prune_recovery_events(log_cutoff)?;

        if reaped + purged + pruned > 0 {
            self.store.compact()?;
        }
        info!(reaped, purged, pruned, "Maintenance pass complete");
        Ok(())
    }

    /// Graceful shutdown: idempotent, safe to call from a signal path
    ///
    /// Runs shutdown handlers, demotes running tasks to paused, releases
    /// all locks, removes the PID marker, and closes the state manager.
    pub fn shutdown(&self) {
        if self.shutdown_done.swap(true, Ordering::SeqCst) {
            debug!("shutdown: already done");
            return;
        }
        info!("Shutting down");

        let handlers: Vec<ShutdownHandler> = self
            .shutdown_handlers
            .read()
            .expect("shutdown handler lock poisoned")
            .clone();
        for handler in handlers {
            if let Err(e) = handler() {
                warn!(error = %format!("{e:#}"), "shutdown: handler failed");
            }
        }

        let demoted = self.state.demote_running("paused for shutdown");
        debug!(demoted, "shutdown: demoted running tasks");

        self.locks.release_all();

        if let Err(e) = self.pid_marker.remove() {
            warn!(error = %format!("{e:#}"), "shutdown: could not remove PID marker");
        }

        if let Err(e) = self.state.close() {
            error!(error = %e, "shutdown: state manager close failed");
        }

        info!("Shutdown complete");
    }

    /// Block until SIGINT/SIGTERM, then run [`shutdown`](Self::shutdown)
    pub async fn run_until_shutdown(&self) -> eyre::Result<()> {
        debug!("run_until_shutdown: waiting for termination signal");

        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            let mut term = signal(SignalKind::terminate())?;
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT");
                }
                _ = term.recv() => {
                    info!("Received SIGTERM");
                }
            }
        }

        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await?;
            info!("Received interrupt");
        }

        self.shutdown();
        Ok(())
    }
}

/// Resident set size of this process in kilobytes, when readable
fn read_resident_kb() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        for line in status.lines() {
            if let Some(rest) = line.strip_prefix("VmRSS:") {
                return rest.trim().trim_end_matches(" kB").trim().parse().ok();
            }
        }
        None
    }

    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}
