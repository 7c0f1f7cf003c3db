//! Configuration types for the recurrence engine and scheduler.

use crate::scheduler::KeyPrecision;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CadenceConfig {
    /// IANA timezone used for local wall-clock arithmetic (e.g. `"Europe/Berlin"`).
    pub timezone: String,
    /// Scheduler tick and recovery settings.
    pub scheduler: SchedulerConfig,
    /// Compiled rule cache settings.
    pub cache: RuleCacheConfig,
}

impl Default for CadenceConfig {
    fn default() -> Self {
        Self {
            timezone: "UTC".to_owned(),
            scheduler: SchedulerConfig::default(),
            cache: RuleCacheConfig::default(),
        }
    }
}

/// Scheduler timing and bookkeeping settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Period between due/overdue checks, in seconds.
    pub check_interval_secs: u64,
    /// Delay after a due instant before the task also counts as missed.
    pub grace_period_secs: u64,
    /// Maximum number of occurrence keys kept per dedup set.
    pub dedup_capacity: usize,
    /// A check running longer than this is considered stuck and force-reset.
    pub stuck_check_timeout_secs: u64,
    /// Upper bound on `calculate_next` calls when advancing a stale task.
    pub max_recovery_advances: usize,
    /// Run the recovery pass inside `start()` before the first check.
    pub recover_on_start: bool,
    /// Key under which the last-run timestamp is persisted.
    pub last_run_key: String,
    /// Resolution of keys used to suppress repeated due/overdue events.
    pub key_precision: KeyPrecision,
    /// Optional JSON file that keeps announced occurrence keys across restarts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ledger_path: Option<PathBuf>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 60,
            grace_period_secs: 3600,
            dedup_capacity: 1000,
            stuck_check_timeout_secs: 30,
            max_recovery_advances: 1000,
            recover_on_start: true,
            last_run_key: "scheduler.last_run".to_owned(),
            key_precision: KeyPrecision::Hour,
            ledger_path: None,
        }
    }
}

impl SchedulerConfig {
    /// Check interval as a [`Duration`], never shorter than one second.
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.max(1))
    }

    /// Grace period as a chrono duration for instant arithmetic.
    pub fn grace_period(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.grace_period_secs.min(u64::from(u32::MAX)) as i64)
    }

    /// Stuck-check timeout as a [`Duration`].
    pub fn stuck_check_timeout(&self) -> Duration {
        Duration::from_secs(self.stuck_check_timeout_secs)
    }
}

/// Compiled rule cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleCacheConfig {
    /// Maximum number of compiled rules held at once. Must be positive.
    pub max_size: usize,
    /// Entries older than this are dropped by periodic pruning, in seconds.
    pub max_age_secs: u64,
}

impl Default for RuleCacheConfig {
    fn default() -> Self {
        Self {
            max_size: 256,
            max_age_secs: 24 * 3600,
        }
    }
}

impl RuleCacheConfig {
    /// Maximum entry age as a [`Duration`].
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

impl CadenceConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::error::CadenceError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::CadenceError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `<config dir>/cadence/config.toml`.
    pub fn default_config_path() -> PathBuf {
        if let Some(config) = std::env::var_os("XDG_CONFIG_HOME") {
            PathBuf::from(config).join("cadence").join("config.toml")
        } else if let Some(dir) = dirs::config_dir() {
            dir.join("cadence").join("config.toml")
        } else {
            PathBuf::from("/tmp/cadence-config/config.toml")
        }
    }

    /// Default location of the persisted last-run timestamps.
    pub fn default_state_path() -> PathBuf {
        match dirs::data_local_dir() {
            Some(dir) => dir.join("cadence").join("timestamps.json"),
            None => PathBuf::from("/tmp/cadence-state/timestamps.json"),
        }
    }
}
