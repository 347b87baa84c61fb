//! Engine configuration types for Autoflow.
//!
//! `EngineConfig` represents the `config.toml` in the data directory. Every
//! field has a default so an empty (or missing) file yields a working engine.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration for the engine.
///
/// Loaded from `~/.autoflow/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// SQLite URL. Defaults to `autoflow.db` in the data directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,

    /// Directory holding workflow definition YAML files. Relative paths are
    /// resolved against the data directory.
    #[serde(default = "default_definitions_dir")]
    pub definitions_dir: PathBuf,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub fork: ForkConfig,
}

fn default_definitions_dir() -> PathBuf {
    PathBuf::from("definitions")
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            definitions_dir: default_definitions_dir(),
            scheduler: SchedulerConfig::default(),
            queue: QueueConfig::default(),
            fork: ForkConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Settings that cannot work together. Empty when the config is usable.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.fork.timeout_secs >= self.queue.stale_after_secs {
            problems.push(format!(
                "fork.timeout_secs ({}) must be below queue.stale_after_secs ({}); \
                 a waiting fork would be requeued as stale",
                self.fork.timeout_secs, self.queue.stale_after_secs
            ));
        }
        problems
    }
}

/// Transition sweep settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Interval between sweeps.
    #[serde(default = "default_sweep_interval_ms")]
    pub poll_interval_ms: u64,
    /// Maximum frontier nodes examined per sweep.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    /// Frontier nodes processed concurrently within one sweep.
    #[serde(default = "default_max_concurrent_advances")]
    pub max_concurrent_advances: usize,
}

fn default_sweep_interval_ms() -> u64 {
    2_000
}

fn default_batch_size() -> u32 {
    200
}

fn default_max_concurrent_advances() -> usize {
    16
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_sweep_interval_ms(),
            batch_size: default_batch_size(),
            max_concurrent_advances: default_max_concurrent_advances(),
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// Job worker and retry settings for the built-in task queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Idle interval between claim attempts.
    #[serde(default = "default_queue_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Jobs executed concurrently by one worker. Fork joins do not count.
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    /// Attempts per job before it is marked failed.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Upper bound on a single job execution. Fork joins are bounded by
    /// `fork.timeout_secs` instead.
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,
    /// Running jobs locked for longer than this are requeued.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

fn default_queue_poll_interval_ms() -> u64 {
    250
}

fn default_max_concurrent_jobs() -> usize {
    8
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    60_000
}

fn default_job_timeout_secs() -> u64 {
    3_600
}

fn default_stale_after_secs() -> u64 {
    7_200
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_queue_poll_interval_ms(),
            max_concurrent_jobs: default_max_concurrent_jobs(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            job_timeout_secs: default_job_timeout_secs(),
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

impl QueueConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

/// Fork/join wait settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForkConfig {
    /// Default bound on waiting for children.
    #[serde(default = "default_fork_timeout_secs")]
    pub timeout_secs: u64,
    /// Interval between child status checks.
    #[serde(default = "default_fork_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_fork_timeout_secs() -> u64 {
    1_800
}

fn default_fork_poll_interval_ms() -> u64 {
    1_000
}

impl Default for ForkConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_fork_timeout_secs(),
            poll_interval_ms: default_fork_poll_interval_ms(),
        }
    }
}

impl ForkConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}
