//! Configuration for the task scheduler and its host.

use crate::error::{Result, SignalError, TaskError};
use crate::signals::ConfigSource;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// One day, the production processing interval.
pub const DEFAULT_PROCESSING_INTERVAL_MS: u64 = 24 * 60 * 60 * 1000;

/// Trusters an identity needs before it stops being asked to introduce itself.
pub const DEFAULT_MINIMUM_TRUSTER_COUNT: u32 = 5;

/// Seconds between scheduler ticks.
pub const DEFAULT_TICK_INTERVAL_SECS: u64 = 60;

/// Run-history entries the scheduler keeps in memory.
pub const DEFAULT_HISTORY_LIMIT: usize = 400;

/// Top-level scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Nominal period between two `process()` cycles of a task, in ms.
    ///
    /// Failed cycles retry after an eighth of this.
    pub processing_interval_ms: u64,
    /// Minimum number of received trusts before introduction stops being needed.
    pub minimum_truster_count: u32,
    /// How often the scheduler loop looks for due tasks (seconds).
    pub tick_interval_secs: u64,
    /// Number of run-history entries the scheduler keeps.
    pub history_limit: usize,
    /// Directory holding `introducer.db`.
    pub store_dir: PathBuf,
    /// JSON snapshot of per-owner message and truster counts, read by the host.
    pub signal_file: Option<PathBuf>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            processing_interval_ms: DEFAULT_PROCESSING_INTERVAL_MS,
            minimum_truster_count: DEFAULT_MINIMUM_TRUSTER_COUNT,
            tick_interval_secs: DEFAULT_TICK_INTERVAL_SECS,
            history_limit: DEFAULT_HISTORY_LIMIT,
            store_dir: default_store_dir(),
            signal_file: None,
        }
    }
}

/// Default directory for `introducer.db`.
///
/// `INTRODUCER_DATA_DIR` overrides the platform data directory.
fn default_store_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("INTRODUCER_DATA_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::data_dir()
        .map(|d| d.join("introducer"))
        .unwrap_or_else(|| PathBuf::from("/tmp/introducer-data"))
}

impl SchedulerConfig {
    /// The processing interval as a [`Duration`].
    #[must_use]
    pub fn processing_interval(&self) -> Duration {
        Duration::from_millis(self.processing_interval_ms)
    }

    /// The scheduler tick as a [`Duration`].
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    /// Reject values the scheduler cannot work with.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Config`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.processing_interval_ms == 0 {
            return Err(TaskError::Config(
                "processing_interval_ms must be positive".to_owned(),
            ));
        }
        if self.minimum_truster_count == 0 {
            return Err(TaskError::Config(
                "minimum_truster_count must be positive".to_owned(),
            ));
        }
        if self.tick_interval_secs == 0 {
            return Err(TaskError::Config(
                "tick_interval_secs must be positive".to_owned(),
            ));
        }
        Ok(())
    }

    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&content).map_err(|e| TaskError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| TaskError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `~/.config/introducer/config.toml`.
    pub fn default_config_path() -> PathBuf {
        if let Some(config) = std::env::var_os("XDG_CONFIG_HOME") {
            PathBuf::from(config).join("introducer").join("config.toml")
        } else if let Some(home) = std::env::var_os("HOME") {
            PathBuf::from(home)
                .join(".config")
                .join("introducer")
                .join("config.toml")
        } else {
            PathBuf::from("/tmp/introducer-config/config.toml")
        }
    }
}

impl ConfigSource for SchedulerConfig {
    fn minimum_truster_count(&self) -> std::result::Result<u32, SignalError> {
        if self.minimum_truster_count == 0 {
            return Err(SignalError::Unavailable(
                "minimum_truster_count is not configured".to_owned(),
            ));
        }
        Ok(self.minimum_truster_count)
    }
}
