//! Named resource locks
//!
//! Strict in-process mutual exclusion: no timeout, no queueing, a
//! blocked acquire returns false instead of waiting. A plain-text lock
//! marker exists on disk iff any resource is held, so an operator or a
//! later startup can see what a dead process was holding. While present
//! the marker is held under an advisory exclusive lock.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use fs2::FileExt;
use tracing::{debug, warn};

use statestore::now_ms;

struct LockInner {
    /// Held resource names with acquisition timestamps (ordered for a
    /// deterministic marker layout)
    held: BTreeMap<String, i64>,
    /// Open marker file handle; holding it keeps the advisory lock
    marker_file: Option<File>,
}

/// In-process named mutual exclusion with an on-disk marker
pub struct LockRegistry {
    marker_path: PathBuf,
    inner: Mutex<LockInner>,
}

impl LockRegistry {
    /// Create a registry writing its marker at the given path
    pub fn new(marker_path: impl Into<PathBuf>) -> Self {
        let marker_path = marker_path.into();
        debug!(?marker_path, "LockRegistry::new: called");
        Self {
            marker_path,
            inner: Mutex::new(LockInner {
                held: BTreeMap::new(),
                marker_file: None,
            }),
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, LockInner> {
        self.inner.lock().expect("lock registry mutex poisoned")
    }

    /// Path of the marker file
    pub fn marker_path(&self) -> &Path {
        &self.marker_path
    }

    /// Check if the marker file exists on disk
    pub fn marker_exists(&self) -> bool {
        self.marker_path.exists()
    }

    /// Acquire a named lock; false if already held (never blocks)
    pub fn acquire(&self, name: &str) -> bool {
        debug!(%name, "LockRegistry::acquire: called");
        let mut inner = self.lock_inner();
        if inner.held.contains_key(name) {
            debug!(%name, "LockRegistry::acquire: already held");
            return false;
        }

        inner.held.insert(name.to_string(), now_ms());
        if let Err(e) = self.sync_marker(&mut inner) {
            warn!(%name, error = %e, "LockRegistry::acquire: marker write failed");
        }
        debug!(%name, "LockRegistry::acquire: acquired");
        true
    }

    /// Release a named lock; false if it was not held
    pub fn release(&self, name: &str) -> bool {
        debug!(%name, "LockRegistry::release: called");
        let mut inner = self.lock_inner();
        if inner.held.remove(name).is_none() {
            debug!(%name, "LockRegistry::release: was not held");
            return false;
        }

        if let Err(e) = self.sync_marker(&mut inner) {
            warn!(%name, error = %e, "LockRegistry::release: marker update failed");
        }
        debug!(%name, "LockRegistry::release: released");
        true
    }

    /// Acquire with an RAII guard that releases on drop
    pub fn guard<'a>(&'a self, name: &str) -> Option<ResourceGuard<'a>> {
        if self.acquire(name) {
            Some(ResourceGuard {
                registry: self,
                name: name.to_string(),
            })
        } else {
            None
        }
    }

    /// Names currently held
    pub fn held(&self) -> Vec<String> {
        self.lock_inner().held.keys().cloned().collect()
    }

    /// Release everything (shutdown path)
    pub fn release_all(&self) {
        debug!("LockRegistry::release_all: called");
        let mut inner = self.lock_inner();
        inner.held.clear();
        if let Err(e) = self.sync_marker(&mut inner) {
            warn!(error = %e, "LockRegistry::release_all: marker removal failed");
        }
    }

    /// Remove a marker left behind by a dead process
    ///
    /// Only meaningful while this registry holds nothing itself.
    pub fn remove_stale_marker(&self) -> std::io::Result<bool> {
        debug!(?self.marker_path, "LockRegistry::remove_stale_marker: called");
        let inner = self.lock_inner();
        if !inner.held.is_empty() {
            debug!("LockRegistry::remove_stale_marker: registry is active, refusing");
            return Ok(false);
        }
        if self.marker_path.exists() {
            fs::remove_file(&self.marker_path)?;
            debug!("LockRegistry::remove_stale_marker: removed");
            return Ok(true);
        }
        Ok(false)
    }

    /// Bring the marker file in line with the held set: present (and
    /// exclusively locked) iff the set is non-empty
    fn sync_marker(&self, inner: &mut LockInner) -> std::io::Result<()> {
        if inner.held.is_empty() {
            if let Some(file) = inner.marker_file.take() {
                let _ = FileExt::unlock(&file);
            }
            if self.marker_path.exists() {
                fs::remove_file(&self.marker_path)?;
                debug!(path = ?self.marker_path, "Removed lock marker");
            }
            return Ok(());
        }

        if inner.marker_file.is_none() {
            if let Some(parent) = self.marker_path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&self.marker_path)?;
            file.try_lock_exclusive()?;
            inner.marker_file = Some(file);
        }

        let resources = inner.held.keys().cloned().collect::<Vec<_>>().join(",");
        let earliest = inner.held.values().min().copied().unwrap_or_else(now_ms);
        let Some(file) = inner.marker_file.as_mut() else {
            return Ok(());
        };
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        // Plain text so an external operator can inspect the holder
        writeln!(file, "pid={}", std::process::id())?;
        writeln!(file, "acquired_at={}", earliest)?;
        writeln!(file, "resources={}", resources)?;
        file.flush()?;
        Ok(())
    }
}

/// RAII guard for a named lock; releases on drop
pub struct ResourceGuard<'a> {
    registry: &'a LockRegistry,
    name: String,
}

impl ResourceGuard<'_> {
    /// Name of the held resource
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for ResourceGuard<'_> {
    fn drop(&mut self) {
        debug!(name = %self.name, "ResourceGuard::drop: releasing");
        self.registry.release(&self.name);
    }
}
