use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CoreError, Result};

pub const DEFAULT_BATCH_SIZE: usize = 25;
pub const DEFAULT_CONCURRENT_BATCHES: usize = 1;
pub const DEFAULT_TIME_LIMIT_SECS: u64 = 30;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_WORKERS: usize = 1;
/// Consecutive same-hook failures after which a recurring action stops rescheduling.
pub const DEFAULT_FAILURE_THRESHOLD: usize = 5;
pub const DEFAULT_RETENTION_SECS: u64 = 30 * 24 * 60 * 60;

/// Top-level config (actionq.toml + ACTIONQ_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub failure: FailureConfig,
    #[serde(default)]
    pub cleanup: CleanupConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    /// How long a writer waits on SQLite's lock before giving up.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

/// Batch sizing and claim filters for a queue runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Upper bound on outstanding claims across all runners sharing the database.
    #[serde(default = "default_concurrent_batches")]
    pub concurrent_batches: usize,
    #[serde(default = "default_time_limit_secs")]
    pub time_limit_secs: u64,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Runner loops started by the worker process, each with its own connection.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Only claim actions for these hooks (empty = all hooks).
    #[serde(default)]
    pub hooks: Vec<String>,
    /// Only claim actions in these groups (empty = all groups).
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub exclude_groups: Vec<String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            concurrent_batches: DEFAULT_CONCURRENT_BATCHES,
            time_limit_secs: DEFAULT_TIME_LIMIT_SECS,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            workers: DEFAULT_WORKERS,
            hooks: Vec::new(),
            groups: Vec::new(),
            exclude_groups: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureConfig {
    /// Set to 0 to never suppress recurring successors.
    #[serde(default = "default_failure_threshold")]
    pub threshold: usize,
}

impl Default for FailureConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_FAILURE_THRESHOLD,
        }
    }
}

/// Housekeeping: stale claim recovery and retention of finished actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    #[serde(default = "default_cleanup_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    /// Pending actions claimed longer than this are released back to the queue.
    #[serde(default = "default_claim_timeout_secs")]
    pub claim_timeout_secs: u64,
    /// In-progress actions started longer than this ago are marked failed.
    #[serde(default = "default_failure_timeout_secs")]
    pub failure_timeout_secs: u64,
    #[serde(default = "default_cleanup_batch_size")]
    pub batch_size: usize,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_cleanup_interval_secs(),
            retention_secs: default_retention_secs(),
            claim_timeout_secs: default_claim_timeout_secs(),
            failure_timeout_secs: default_failure_timeout_secs(),
            batch_size: default_cleanup_batch_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// A pending action this far behind its scheduled time counts as past due.
    #[serde(default = "default_past_due_secs")]
    pub past_due_secs: u64,
    /// Warn once this many actions are past due.
    #[serde(default = "default_past_due_min")]
    pub past_due_min: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            past_due_secs: default_past_due_secs(),
            past_due_min: default_past_due_min(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// IANA timezone applied to cron expressions enqueued without one.
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
        }
    }
}

fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.actionq/actionq.db", home)
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_concurrent_batches() -> usize {
    DEFAULT_CONCURRENT_BATCHES
}

fn default_time_limit_secs() -> u64 {
    DEFAULT_TIME_LIMIT_SECS
}

fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

fn default_workers() -> usize {
    DEFAULT_WORKERS
}

fn default_failure_threshold() -> usize {
    DEFAULT_FAILURE_THRESHOLD
}

fn default_cleanup_interval_secs() -> u64 {
    3_600
}

fn default_retention_secs() -> u64 {
    DEFAULT_RETENTION_SECS
}

fn default_claim_timeout_secs() -> u64 {
    300
}

fn default_failure_timeout_secs() -> u64 {
    300
}

fn default_cleanup_batch_size() -> usize {
    20
}

fn default_past_due_secs() -> u64 {
    86_400
}

fn default_past_due_min() -> u64 {
    1
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl QueueConfig {
    /// Load config from a TOML file with ACTIONQ_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.actionq/actionq.toml
    ///
    /// Nested keys use a double underscore, e.g. `ACTIONQ_RUNNER__BATCH_SIZE=50`.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);
        debug!(path = %path, "loading config");

        Self::figment(&path)
            .extract()
            .map_err(|e| CoreError::Config(e.to_string()))
    }

    fn figment(path: &str) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("ACTIONQ_").split("__"))
    }

    /// Create the directory holding the database file if it does not exist.
    pub fn ensure_database_dir(&self) -> Result<()> {
        if let Some(parent) = std::path::Path::new(&self.database.path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.actionq/actionq.toml", home)
}
