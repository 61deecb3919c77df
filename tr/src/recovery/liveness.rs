//! Process liveness artifacts
//!
//! A plain-text PID marker written at normal startup and removed at
//! clean shutdown. Its presence after a restart is crash evidence; an
//! external operator can `cat` it to see who owned the state.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use tracing::debug;

/// PID marker file manager
#[derive(Debug, Clone)]
pub struct PidMarker {
    /// Path to the marker file
    path: PathBuf,
}

impl PidMarker {
    /// Create a marker handle for the given path
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        debug!(?path, "PidMarker::new: called");
        Self { path }
    }

    /// Get the marker file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check if the marker file exists
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Read the PID from the marker file
    pub fn read(&self) -> Option<u32> {
        debug!(?self.path, "PidMarker::read: called");
        if !self.path.exists() {
            debug!("PidMarker::read: marker file does not exist");
            return None;
        }

        let mut file = fs::File::open(&self.path).ok()?;
        let mut contents = String::new();
        file.read_to_string(&mut contents).ok()?;

        let pid = contents.trim().parse().ok();
        debug!(?pid, "PidMarker::read: returning");
        pid
    }

    /// Write the current process id to the marker file
    pub fn write_current(&self) -> Result<()> {
        self.write(std::process::id())
    }

    /// Write a PID to the marker file
    pub fn write(&self, pid: u32) -> Result<()> {
        debug!(pid, ?self.path, "PidMarker::write: called");
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context("Failed to create PID marker directory")?;
        }

        let mut file = fs::File::create(&self.path).context("Failed to create PID marker")?;
        write!(file, "{}", pid).context("Failed to write PID")?;

        debug!(pid, path = ?self.path, "Wrote PID marker");
        Ok(())
    }

    /// Remove the marker file if present
    pub fn remove(&self) -> Result<()> {
        debug!(?self.path, "PidMarker::remove: called");
        if self.path.exists() {
            fs::remove_file(&self.path).context("Failed to remove PID marker")?;
            debug!(path = ?self.path, "Removed PID marker");
        }
        Ok(())
    }
}

/// Check if a process with the given PID is running
///
/// Signal 0 probes existence without affecting the process. EPERM means
/// the process exists but belongs to someone else, which still counts
/// as alive.
pub fn is_process_alive(pid: u32) -> bool {
    debug!(pid, "is_process_alive: called");
    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let result = match kill(Pid::from_raw(pid as i32), None) {
            Ok(()) => true,
            Err(Errno::EPERM) => true,
            Err(_) => false,
        };
        debug!(pid, result, "is_process_alive: unix check");
        result
    }

    #[cfg(not(unix))]
    {
        // Assume running on platforms without a cheap probe
        debug!(pid, "is_process_alive: unknown platform, assuming running");
        let _ = pid;
        true
    }
}
