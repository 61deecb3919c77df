//! Durable store over SQLite
//!
//! One connection serialized behind a mutex, so concurrent callers from
//! multiple threads in the same process are safe. Each logical save is a
//! single statement (JSON blobs are serialized before any write), so a
//! record is either fully persisted or not at all.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, params};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::now_ms;
use crate::recovery::{RecoverySession, RecoveryStatus};
use crate::session::{SessionRecord, SessionStatus};
use crate::task::{Checkpoint, TaskRecord, TaskStatus};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS task_states (
    id          TEXT PRIMARY KEY,
    task_type   TEXT NOT NULL,
    status      TEXT NOT NULL,
    progress    REAL NOT NULL DEFAULT 0,
    data        TEXT NOT NULL DEFAULT '{}',
    checkpoint  TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0,
    last_error  TEXT,
    created_at  INTEGER NOT NULL,
    updated_at  INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_task_states_status ON task_states(status);
CREATE INDEX IF NOT EXISTS idx_task_states_type ON task_states(task_type);

CREATE TABLE IF NOT EXISTS sessions (
    id           TEXT PRIMARY KEY,
    subject_id   TEXT NOT NULL,
    session_type TEXT NOT NULL,
    status       TEXT NOT NULL,
    data         TEXT NOT NULL DEFAULT '{}',
    created_at   INTEGER NOT NULL,
    updated_at   INTEGER NOT NULL,
    expires_at   INTEGER
);
CREATE INDEX IF NOT EXISTS idx_sessions_subject ON sessions(subject_id);

CREATE TABLE IF NOT EXISTS configurations (
    key        TEXT PRIMARY KEY,
    value      TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS recovery_logs (
    id                TEXT PRIMARY KEY,
    pid               INTEGER NOT NULL,
    started_at        INTEGER NOT NULL,
    finished_at       INTEGER,
    status            TEXT NOT NULL,
    error             TEXT,
    recovered_tasks   TEXT NOT NULL DEFAULT '[]',
    cleaned_resources TEXT NOT NULL DEFAULT '[]',
    diagnostics       TEXT NOT NULL DEFAULT 'null'
);
CREATE INDEX IF NOT EXISTS idx_recovery_logs_started ON recovery_logs(started_at);
"#;

/// Row counts and file size, for maintenance and introspection
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct StoreStats {
    /// Rows in task_states
    pub tasks: u64,
    /// Rows in sessions
    pub sessions: u64,
    /// Rows in configurations
    pub configurations: u64,
    /// Rows in recovery_logs
    pub recovery_events: u64,
    /// Database file size in bytes
    pub db_bytes: u64,
}

/// SQLite-backed durable store
pub struct Store {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl Store {
    /// Open or create a store at the given database path
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        debug!(?path, "Store::open: called");

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;

        info!(path = %path.display(), "Opened durable store");
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("store connection mutex poisoned")
    }

    /// Path of the underlying database file
    pub fn path(&self) -> &Path {
        &self.path
    }

    // === Tasks ===

    /// Save (insert or replace) a task record
    pub fn save_task(&self, task: &TaskRecord) -> StoreResult<()> {
        debug!(task_id = %task.id, status = %task.status, "Store::save_task: called");
        // Serialize before touching the database so a bad payload can
        // never leave a partially written row behind
        let data = serde_json::to_string(&task.data)?;
        let checkpoint = task
            .checkpoint
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.conn().execute(
            "INSERT OR REPLACE INTO task_states
             (id, task_type, status, progress, data, checkpoint, retry_count, last_error, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                task.id,
                task.task_type,
                task.status.to_string(),
                task.progress,
                data,
                checkpoint,
                task.retry_count,
                task.last_error,
                task.created_at,
                task.updated_at,
            ],
        )?;
        Ok(())
    }

    /// Load a task record by id
    pub fn load_task(&self, id: &str) -> StoreResult<Option<TaskRecord>> {
        debug!(%id, "Store::load_task: called");
        let raw = self
            .conn()
            .query_row(
                "SELECT id, task_type, status, progress, data, checkpoint, retry_count, last_error, created_at, updated_at
                 FROM task_states WHERE id = ?1",
                params![id],
                raw_task_from_row,
            )
            .optional()?;

        raw.map(parse_task).transpose()
    }

    /// Delete a task record; returns true if a row was removed
    pub fn delete_task(&self, id: &str) -> StoreResult<bool> {
        debug!(%id, "Store::delete_task: called");
        let affected = self
            .conn()
            .execute("DELETE FROM task_states WHERE id = ?1", params![id])?;
        Ok(affected > 0)
    }

    /// List tasks with the given status, optionally filtered by type
    pub fn tasks_by_status(&self, status: TaskStatus, task_type: Option<&str>) -> StoreResult<Vec<TaskRecord>> {
        debug!(%status, ?task_type, "Store::tasks_by_status: called");
        let conn = self.conn();
        let mut raws = Vec::new();

        match task_type {
            Some(task_type) => {
                let mut stmt = conn.prepare(
                    "SELECT id, task_type, status, progress, data, checkpoint, retry_count, last_error, created_at, updated_at
                     FROM task_states WHERE status = ?1 AND task_type = ?2 ORDER BY created_at",
                )?;
                for raw in stmt.query_map(params![status.to_string(), task_type], raw_task_from_row)? {
                    raws.push(raw?);
                }
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT id, task_type, status, progress, data, checkpoint, retry_count, last_error, created_at, updated_at
                     FROM task_states WHERE status = ?1 ORDER BY created_at",
                )?;
                for raw in stmt.query_map(params![status.to_string()], raw_task_from_row)? {
                    raws.push(raw?);
                }
            }
        }
        drop(conn);

        raws.into_iter().map(parse_task).collect()
    }

    /// List every task record
    pub fn all_tasks(&self) -> StoreResult<Vec<TaskRecord>> {
        debug!("Store::all_tasks: called");
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, task_type, status, progress, data, checkpoint, retry_count, last_error, created_at, updated_at
             FROM task_states ORDER BY created_at",
        )?;
        let mut raws = Vec::new();
        for raw in stmt.query_map([], raw_task_from_row)? {
            raws.push(raw?);
        }
        drop(stmt);
        drop(conn);

        raws.into_iter().map(parse_task).collect()
    }

    // === Sessions ===

    /// Save (insert or replace) a session record
    pub fn save_session(&self, session: &SessionRecord) -> StoreResult<()> {
        debug!(session_id = %session.id, "Store::save_session: called");
        let data = serde_json::to_string(&session.data)?;

        self.conn().execute(
            "INSERT OR REPLACE INTO sessions
             (id, subject_id, session_type, status, data, created_at, updated_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                session.id,
                session.subject_id,
                session.session_type,
                session.status.to_string(),
                data,
                session.created_at,
                session.updated_at,
                session.expires_at,
            ],
        )?;
        Ok(())
    }

    /// Load a session record by id
    pub fn load_session(&self, id: &str) -> StoreResult<Option<SessionRecord>> {
        debug!(%id, "Store::load_session: called");
        let raw = self
            .conn()
            .query_row(
                "SELECT id, subject_id, session_type, status, data, created_at, updated_at, expires_at
                 FROM sessions WHERE id = ?1",
                params![id],
                raw_session_from_row,
            )
            .optional()?;

        raw.map(parse_session).transpose()
    }

    /// Delete a session record; returns true if a row was removed
    pub fn delete_session(&self, id: &str) -> StoreResult<bool> {
        debug!(%id, "Store::delete_session: called");
        let affected = self
            .conn()
            .execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
        Ok(affected > 0)
    }

    /// List sessions owned by a subject
    pub fn sessions_for_subject(&self, subject_id: &str) -> StoreResult<Vec<SessionRecord>> {
        debug!(%subject_id, "Store::sessions_for_subject: called");
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, subject_id, session_type, status, data, created_at, updated_at, expires_at
             FROM sessions WHERE subject_id = ?1 ORDER BY created_at",
        )?;
        let mut raws = Vec::new();
        for raw in stmt.query_map(params![subject_id], raw_session_from_row)? {
            raws.push(raw?);
        }
        drop(stmt);
        drop(conn);

        raws.into_iter().map(parse_session).collect()
    }

    /// Physically remove sessions past their expiry; returns the count
    pub fn purge_expired_sessions(&self, now: i64) -> StoreResult<usize> {
        debug!(now, "Store::purge_expired_sessions: called");
        let removed = self.conn().execute(
            "DELETE FROM sessions WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            params![now],
        )?;
        if removed > 0 {
            info!(removed, "Purged expired sessions");
        }
        Ok(removed)
    }

    // === Configuration ===

    /// Set a configuration value
    pub fn set_config(&self, key: &str, value: &str) -> StoreResult<()> {
        debug!(%key, "Store::set_config: called");
        self.conn().execute(
            "INSERT OR REPLACE INTO configurations (key, value, updated_at) VALUES (?1, ?2, ?3)",
            params![key, value, now_ms()],
        )?;
        Ok(())
    }

    /// Get a configuration value
    pub fn get_config(&self, key: &str) -> StoreResult<Option<String>> {
        debug!(%key, "Store::get_config: called");
        let value = self
            .conn()
            .query_row(
                "SELECT value FROM configurations WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Delete a configuration value; returns true if a row was removed
    pub fn delete_config(&self, key: &str) -> StoreResult<bool> {
        debug!(%key, "Store::delete_config: called");
        let affected = self
            .conn()
            .execute("DELETE FROM configurations WHERE key = ?1", params![key])?;
        Ok(affected > 0)
    }

    // === Recovery log ===

    /// Append a recovery session to the log (append-only; no update path)
    pub fn append_recovery_event(&self, session: &RecoverySession) -> StoreResult<()> {
        debug!(session_id = %session.id, status = %session.status, "Store::append_recovery_event: called");
        let recovered = serde_json::to_string(&session.recovered_tasks)?;
        let cleaned = serde_json::to_string(&session.cleaned_resources)?;
        let diagnostics = serde_json::to_string(&session.diagnostics)?;

        self.conn().execute(
            "INSERT INTO recovery_logs
             (id, pid, started_at, finished_at, status, error, recovered_tasks, cleaned_resources, diagnostics)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                session.id,
                session.pid,
                session.started_at,
                session.finished_at,
                session.status.to_string(),
                session.error,
                recovered,
                cleaned,
                diagnostics,
            ],
        )?;
        Ok(())
    }

    /// Recovery sessions started within the lookback window, newest
    /// first, optionally filtered by terminal status
    pub fn recovery_history(
        &self,
        window: Duration,
        status: Option<RecoveryStatus>,
    ) -> StoreResult<Vec<RecoverySession>> {
        debug!(?window, ?status, "Store::recovery_history: called");
        let cutoff = now_ms() - window.as_millis() as i64;
        let conn = self.conn();
        let mut raws = Vec::new();

        match status {
            Some(status) => {
                let mut stmt = conn.prepare(
                    "SELECT id, pid, started_at, finished_at, status, error, recovered_tasks, cleaned_resources, diagnostics
                     FROM recovery_logs WHERE started_at >= ?1 AND status = ?2 ORDER BY started_at DESC",
                )?;
                for raw in stmt.query_map(params![cutoff, status.to_string()], raw_recovery_from_row)? {
                    raws.push(raw?);
                }
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT id, pid, started_at, finished_at, status, error, recovered_tasks, cleaned_resources, diagnostics
                     FROM recovery_logs WHERE started_at >= ?1 ORDER BY started_at DESC",
                )?;
                for raw in stmt.query_map(params![cutoff], raw_recovery_from_row)? {
                    raws.push(raw?);
                }
            }
        }
        drop(conn);

        raws.into_iter().map(parse_recovery).collect()
    }

    /// Drop recovery log rows started before the cutoff; returns the count
    pub fn prune_recovery_events(&self, before: i64) -> StoreResult<usize> {
        debug!(before, "Store::prune_recovery_events: called");
        let removed = self.conn().execute(
            "DELETE FROM recovery_logs WHERE started_at < ?1",
            params![before],
        )?;
        if removed > 0 {
            info!(removed, "Pruned old recovery events");
        }
        Ok(removed)
    }

    // === Maintenance ===

    /// Reclaim space after deletions
    pub fn compact(&self) -> StoreResult<()> {
        debug!("Store::compact: called");
        self.conn()
            .execute_batch("PRAGMA wal_checkpoint(TRUNCATE); VACUUM;")?;
        info!("Compacted durable store");
        Ok(())
    }

    /// Row counts per collection plus database file size
    pub fn stats(&self) -> StoreResult<StoreStats> {
        debug!("Store::stats: called");
        let conn = self.conn();
        let count = |table: &str| -> StoreResult<u64> {
            let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))?;
            Ok(n as u64)
        };

        let stats = StoreStats {
            tasks: count("task_states")?,
            sessions: count("sessions")?,
            configurations: count("configurations")?,
            recovery_events: count("recovery_logs")?,
            db_bytes: std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0),
        };
        Ok(stats)
    }
}

// === Row mapping ===
//
// Closures handed to rusqlite must return rusqlite::Result, so rows are
// first extracted as raw scalars and the JSON/status parsing happens
// outside, where serde failures can become StoreError.

struct RawTask {
    id: String,
    task_type: String,
    status: String,
    progress: f64,
    data: String,
    checkpoint: Option<String>,
    retry_count: u32,
    last_error: Option<String>,
    created_at: i64,
    updated_at: i64,
}

fn raw_task_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawTask> {
    Ok(RawTask {
        id: row.get(0)?,
        task_type: row.get(1)?,
        status: row.get(2)?,
        progress: row.get(3)?,
        data: row.get(4)?,
        checkpoint: row.get(5)?,
        retry_count: row.get(6)?,
        last_error: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

fn parse_task(raw: RawTask) -> StoreResult<TaskRecord> {
    let status: TaskStatus = raw.status.parse().map_err(StoreError::Corrupt)?;
    let data: Map<String, Value> = serde_json::from_str(&raw.data)?;
    let checkpoint: Option<Checkpoint> = raw
        .checkpoint
        .as_deref()
        .map(serde_json::from_str)
        .transpose()?;

    Ok(TaskRecord {
        id: raw.id,
        task_type: raw.task_type,
        status,
        progress: raw.progress,
        data,
        checkpoint,
        retry_count: raw.retry_count,
        last_error: raw.last_error,
        created_at: raw.created_at,
        updated_at: raw.updated_at,
    })
}

struct RawSession {
    id: String,
    subject_id: String,
    session_type: String,
    status: String,
    data: String,
    created_at: i64,
    updated_at: i64,
    expires_at: Option<i64>,
}

fn raw_session_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawSession> {
    Ok(RawSession {
        id: row.get(0)?,
        subject_id: row.get(1)?,
        session_type: row.get(2)?,
        status: row.get(3)?,
        data: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
        expires_at: row.get(7)?,
    })
}

fn parse_session(raw: RawSession) -> StoreResult<SessionRecord> {
    let status: SessionStatus = raw.status.parse().map_err(StoreError::Corrupt)?;
    let data: Map<String, Value> = serde_json::from_str(&raw.data)?;

    Ok(SessionRecord {
        id: raw.id,
        subject_id: raw.subject_id,
        session_type: raw.session_type,
        status,
        data,
        created_at: raw.created_at,
        updated_at: raw.updated_at,
        expires_at: raw.expires_at,
    })
}

struct RawRecovery {
    id: String,
    pid: u32,
    started_at: i64,
    finished_at: Option<i64>,
    status: String,
    error: Option<String>,
    recovered_tasks: String,
    cleaned_resources: String,
    diagnostics: String,
}

fn raw_recovery_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRecovery> {
    Ok(RawRecovery {
        id: row.get(0)?,
        pid: row.get(1)?,
        started_at: row.get(2)?,
        finished_at: row.get(3)?,
        status: row.get(4)?,
        error: row.get(5)?,
        recovered_tasks: row.get(6)?,
        cleaned_resources: row.get(7)?,
        diagnostics: row.get(8)?,
    })
}

fn parse_recovery(raw: RawRecovery) -> StoreResult<RecoverySession> {
    let status: RecoveryStatus = raw.status.parse().map_err(StoreError::Corrupt)?;
    let recovered_tasks: Vec<String> = serde_json::from_str(&raw.recovered_tasks)?;
    let cleaned_resources: Vec<String> = serde_json::from_str(&raw.cleaned_resources)?;
    let diagnostics: Value = serde_json::from_str(&raw.diagnostics)?;

    Ok(RecoverySession {
        id: raw.id,
        pid: raw.pid,
        started_at: raw.started_at,
        finished_at: raw.finished_at,
        status,
        error: raw.error,
        recovered_tasks,
        cleaned_resources,
        diagnostics,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn open_store(dir: &tempfile::TempDir) -> Store {
        Store::open(dir.path().join("state.db")).unwrap()
    }

    #[test]
    fn test_task_round_trip_across_handles() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("state.db");

        let mut task = TaskRecord::with_id("t1", "download");
        task.set_status(TaskStatus::Running);
        task.set_progress(37.5);
        let mut patch = Map::new();
        patch.insert("course".to_string(), json!({"id": 7, "chapters": [1, 2, 3]}));
        task.merge_data(patch);
        task.set_checkpoint(Checkpoint::new("chunk3", 3, json!({"bytes": 450000})));
        task.set_error("transient stall");
        task.increment_retry();

        {
            let store = Store::open(&path).unwrap();
            store.save_task(&task).unwrap();
        }

        // Fresh handle: field-for-field equality, nested payloads included
        let store = Store::open(&path).unwrap();
        let loaded = store.load_task("t1").unwrap().unwrap();
        assert_eq!(loaded, task);
    }

    #[test]
    fn test_load_missing_task() {
        let temp = tempdir().unwrap();
        let store = open_store(&temp);
        assert!(store.load_task("nope").unwrap().is_none());
    }

    #[test]
    fn test_save_task_overwrites() {
        let temp = tempdir().unwrap();
        let store = open_store(&temp);

        let mut task = TaskRecord::with_id("t1", "download");
        store.save_task(&task).unwrap();

        task.set_status(TaskStatus::Completed);
        task.set_progress(100.0);
        store.save_task(&task).unwrap();

        let loaded = store.load_task("t1").unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Completed);
        assert_eq!(loaded.progress, 100.0);
    }

    #[test]
    fn test_delete_task() {
        let temp = tempdir().unwrap();
        let store = open_store(&temp);

        store.save_task(&TaskRecord::with_id("t1", "download")).unwrap();
        assert!(store.delete_task("t1").unwrap());
        assert!(!store.delete_task("t1").unwrap());
        assert!(store.load_task("t1").unwrap().is_none());
    }

    #[test]
    fn test_tasks_by_status_and_type() {
        let temp = tempdir().unwrap();
        let store = open_store(&temp);

        let mut running_dl = TaskRecord::with_id("t1", "download");
        running_dl.set_status(TaskStatus::Running);
        store.save_task(&running_dl).unwrap();

        let mut running_quiz = TaskRecord::with_id("t2", "quiz");
        running_quiz.set_status(TaskStatus::Running);
        store.save_task(&running_quiz).unwrap();

        store.save_task(&TaskRecord::with_id("t3", "download")).unwrap();

        let running = store.tasks_by_status(TaskStatus::Running, None).unwrap();
        assert_eq!(running.len(), 2);

        let running_downloads = store.tasks_by_status(TaskStatus::Running, Some("download")).unwrap();
        assert_eq!(running_downloads.len(), 1);
        assert_eq!(running_downloads[0].id, "t1");

        let pending = store.tasks_by_status(TaskStatus::Pending, None).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "t3");
    }

    #[test]
    fn test_all_tasks() {
        let temp = tempdir().unwrap();
        let store = open_store(&temp);

        store.save_task(&TaskRecord::with_id("t1", "download")).unwrap();
        store.save_task(&TaskRecord::with_id("t2", "quiz")).unwrap();

        let all = store.all_tasks().unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_session_round_trip() {
        let temp = tempdir().unwrap();
        let store = open_store(&temp);

        let mut session = SessionRecord::with_id("s1", "user-7", "platform_login");
        session.set_expiry(now_ms() + 60_000);
        let mut patch = Map::new();
        patch.insert("cookie".to_string(), json!("abc123"));
        session.merge_data(patch);
        store.save_session(&session).unwrap();

        let loaded = store.load_session("s1").unwrap().unwrap();
        assert_eq!(loaded, session);

        assert!(store.delete_session("s1").unwrap());
        assert!(store.load_session("s1").unwrap().is_none());
    }

    #[test]
    fn test_sessions_for_subject() {
        let temp = tempdir().unwrap();
        let store = open_store(&temp);

        store
            .save_session(&SessionRecord::with_id("s1", "user-7", "platform_login"))
            .unwrap();
        store
            .save_session(&SessionRecord::with_id("s2", "user-7", "api_token"))
            .unwrap();
        store
            .save_session(&SessionRecord::with_id("s3", "user-8", "platform_login"))
            .unwrap();

        let sessions = store.sessions_for_subject("user-7").unwrap();
        assert_eq!(sessions.len(), 2);
    }

    #[test]
    fn test_purge_expired_sessions() {
        let temp = tempdir().unwrap();
        let store = open_store(&temp);
        let now = now_ms();

        let mut stale = SessionRecord::with_id("s1", "user-7", "platform_login");
        stale.set_expiry(now - 1000);
        store.save_session(&stale).unwrap();

        let mut fresh = SessionRecord::with_id("s2", "user-7", "platform_login");
        fresh.set_expiry(now + 60_000);
        store.save_session(&fresh).unwrap();

        // No expiry: never purged
        store
            .save_session(&SessionRecord::with_id("s3", "user-7", "api_token"))
            .unwrap();

        let removed = store.purge_expired_sessions(now).unwrap();
        assert_eq!(removed, 1);
        assert!(store.load_session("s1").unwrap().is_none());
        assert!(store.load_session("s2").unwrap().is_some());
        assert!(store.load_session("s3").unwrap().is_some());
    }

    #[test]
    fn test_config_round_trip() {
        let temp = tempdir().unwrap();
        let store = open_store(&temp);

        assert!(store.get_config("download.dir").unwrap().is_none());

        store.set_config("download.dir", "/srv/media").unwrap();
        assert_eq!(store.get_config("download.dir").unwrap().as_deref(), Some("/srv/media"));

        store.set_config("download.dir", "/srv/media2").unwrap();
        assert_eq!(store.get_config("download.dir").unwrap().as_deref(), Some("/srv/media2"));

        assert!(store.delete_config("download.dir").unwrap());
        assert!(store.get_config("download.dir").unwrap().is_none());
    }

    #[test]
    fn test_recovery_log_append_and_history() {
        let temp = tempdir().unwrap();
        let store = open_store(&temp);

        let mut completed = RecoverySession::begin(1000);
        completed.record_recovered("t1");
        completed.record_cleaned("lock_marker");
        completed.set_diagnostics(json!({"tasks_total": 1}));
        completed.finish_completed();
        store.append_recovery_event(&completed).unwrap();

        let mut failed = RecoverySession::begin(1001);
        failed.finish_failed("store unavailable");
        store.append_recovery_event(&failed).unwrap();

        let history = store.recovery_history(Duration::from_secs(3600), None).unwrap();
        assert_eq!(history.len(), 2);
        // Newest first
        assert_eq!(history[0].id, failed.id);

        let only_failed = store
            .recovery_history(Duration::from_secs(3600), Some(RecoveryStatus::Failed))
            .unwrap();
        assert_eq!(only_failed.len(), 1);
        assert_eq!(only_failed[0].error.as_deref(), Some("store unavailable"));

        // Round trip preserves the id lists and diagnostics
        let reloaded = history.into_iter().find(|s| s.id == completed.id).unwrap();
        assert_eq!(reloaded, completed);
    }

    #[test]
    fn test_recovery_history_window_excludes_old() {
        let temp = tempdir().unwrap();
        let store = open_store(&temp);

        let mut old = RecoverySession::begin(1000);
        old.started_at = now_ms() - 10_000;
        old.finish_completed();
        store.append_recovery_event(&old).unwrap();

        let history = store.recovery_history(Duration::from_secs(1), None).unwrap();
        assert!(history.is_empty());

        let history = store.recovery_history(Duration::from_secs(60), None).unwrap();
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn test_prune_recovery_events() {
        let temp = tempdir().unwrap();
        let store = open_store(&temp);

        let mut old = RecoverySession::begin(1000);
        old.started_at = now_ms() - 10_000;
        old.finish_completed();
        store.append_recovery_event(&old).unwrap();

        let mut fresh = RecoverySession::begin(1001);
        fresh.finish_completed();
        store.append_recovery_event(&fresh).unwrap();

        let removed = store.prune_recovery_events(now_ms() - 5_000).unwrap();
        assert_eq!(removed, 1);

        let history = store.recovery_history(Duration::from_secs(3600), None).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, fresh.id);
    }

    #[test]
    fn test_stats_and_compact() {
        let temp = tempdir().unwrap();
        let store = open_store(&temp);

        store.save_task(&TaskRecord::with_id("t1", "download")).unwrap();
        store
            .save_session(&SessionRecord::with_id("s1", "user-7", "platform_login"))
            .unwrap();
        store.set_config("k", "v").unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.tasks, 1);
        assert_eq!(stats.sessions, 1);
        assert_eq!(stats.configurations, 1);
        assert_eq!(stats.recovery_events, 0);
        assert!(stats.db_bytes > 0);

        store.compact().unwrap();
        let stats = store.stats().unwrap();
        assert_eq!(stats.tasks, 1);
    }

    #[test]
    fn test_concurrent_writers() {
        let temp = tempdir().unwrap();
        let store = std::sync::Arc::new(open_store(&temp));

        let mut handles = Vec::new();
        for worker in 0..4 {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..10 {
                    let task = TaskRecord::with_id(format!("t-{}-{}", worker, i), "download");
                    store.save_task(&task).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.all_tasks().unwrap().len(), 40);
    }
}
