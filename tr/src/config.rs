//! TaskRecovery configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Root directory for runtime artifacts (PID/lock markers, temp files)
fn default_runtime_dir() -> PathBuf {
    dirs::runtime_dir()
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("taskrecovery")
}

/// Main TaskRecovery configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Durable store configuration
    pub storage: StorageConfig,

    /// Runtime artifact paths
    pub runtime: RuntimeConfig,

    /// Retention windows for maintenance
    pub retention: RetentionConfig,
}

impl RecoveryConfig {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .taskrecovery.yml
        let local_config = PathBuf::from(".taskrecovery.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/taskrecovery/taskrecovery.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("taskrecovery").join("taskrecovery.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        // No config file found, use defaults
        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Durable store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path to the SQLite database file
    #[serde(rename = "db-path")]
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let db_path = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("taskrecovery")
            .join("state.db");
        Self { db_path }
    }
}

/// Runtime artifact paths
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// PID marker file location
    #[serde(rename = "pid-file")]
    pub pid_file: PathBuf,

    /// Lock marker file location
    #[serde(rename = "lock-file")]
    pub lock_file: PathBuf,

    /// Directory swept for stale `*.tmp` files during recovery
    #[serde(rename = "temp-dir")]
    pub temp_dir: PathBuf,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let dir = default_runtime_dir();
        Self {
            pid_file: dir.join("taskrecovery.pid"),
            lock_file: dir.join("taskrecovery.lock"),
            temp_dir: dir.join("tmp"),
        }
    }
}

/// Retention windows for maintenance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Hours a completed task is kept before the reaper removes it
    #[serde(rename = "completed-task-hours")]
    pub completed_task_hours: u64,

    /// Days a recovery log row is kept
    #[serde(rename = "recovery-log-days")]
    pub recovery_log_days: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            completed_task_hours: 24,
            recovery_log_days: 30,
        }
    }
}
