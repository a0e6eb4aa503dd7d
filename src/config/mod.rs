//! Typed configuration from environment variables or a TOML file.
//!
//! Loads once at startup, fails fast on missing or malformed values.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Upper bound for configured delays and leases.
pub const MAX_DURATION: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root directory for the queue files and shard files.
    pub data_dir: PathBuf,
    pub queue: QueueConfig,
    pub records: RecordStoreConfig,
    pub workers: PoolConfig,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            queue: QueueConfig::default(),
            records: RecordStoreConfig::default(),
            workers: PoolConfig::default(),
            otel_endpoint: None,
            log_level: "info".to_string(),
        }
    }
}

/// What `enqueue` does at the high-water mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backpressure {
    /// Return [`Error::Busy`].
    #[default]
    Reject,
    /// Wait until workers drain below the mark.
    Block,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum queued (pending + in-flight) jobs. `None` is unbounded.
    pub high_water_mark: Option<usize>,
    pub backpressure: Backpressure,
    pub default_max_attempts: u32,
    #[serde(rename = "retry_base_delay_ms", with = "millis")]
    pub retry_base_delay: Duration,
    #[serde(rename = "retry_max_delay_ms", with = "millis")]
    pub retry_max_delay: Duration,
    /// Compact once finished entries make up this share of the log.
    pub compact_ratio: f64,
    /// ...and there are at least this many of them.
    pub compact_min_entries: usize,
    /// Closed set of accepted job kinds. Empty accepts any kind.
    pub kinds: Vec<String>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            high_water_mark: None,
            backpressure: Backpressure::Reject,
            default_max_attempts: 3,
            retry_base_delay: Duration::from_millis(500),
            retry_max_delay: Duration::from_secs(60),
            compact_ratio: 0.5,
            compact_min_entries: 64,
            kinds: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecordStoreConfig {
    /// Fixed for the lifetime of a data directory.
    pub shard_count: u32,
    /// Shards kept in memory at once; least recently used are dropped first.
    pub max_resident_shards: usize,
    pub io_retry_attempts: usize,
    #[serde(rename = "io_retry_base_delay_ms", with = "millis")]
    pub io_retry_base_delay: Duration,
}

impl Default for RecordStoreConfig {
    fn default() -> Self {
        Self {
            shard_count: 16,
            max_resident_shards: 8,
            io_retry_attempts: 4,
            io_retry_base_delay: Duration::from_millis(25),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of concurrent workers.
    pub workers: usize,
    #[serde(rename = "lease_duration_ms", with = "millis")]
    pub lease_duration: Duration,
    /// Idle wait between empty leases.
    #[serde(rename = "poll_interval_ms", with = "millis")]
    pub poll_interval: Duration,
    #[serde(rename = "job_timeout_ms", with = "millis")]
    pub job_timeout: Duration,
    /// How long in-flight jobs may keep running after shutdown is requested.
    #[serde(rename = "shutdown_grace_ms", with = "millis")]
    pub shutdown_grace: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            lease_duration: Duration::from_secs(60),
            poll_interval: Duration::from_millis(250),
            job_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let mut config = Config {
            data_dir: PathBuf::from(required_var("WORKVAULT_DATA_DIR")?),
            ..Config::default()
        };
        if let Some(workers) = optional_var("WORKVAULT_WORKERS")? {
            config.workers.workers = workers;
        }
        if let Some(mark) = optional_var("WORKVAULT_HIGH_WATER")? {
            config.queue.high_water_mark = Some(mark);
        }
        if let Some(shards) = optional_var("WORKVAULT_SHARDS")? {
            config.records.shard_count = shards;
        }
        if let Some(secs) = optional_var::<u64>("WORKVAULT_LEASE_SECS")? {
            config.workers.lease_duration = Duration::from_secs(secs);
        }
        if let Some(secs) = optional_var::<u64>("WORKVAULT_JOB_TIMEOUT_SECS")? {
            config.workers.job_timeout = Duration::from_secs(secs);
        }
        config.otel_endpoint = std::env::var("OTEL_ENDPOINT").ok();
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            config.log_level = level;
        }
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file. Missing sections take defaults.
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read config {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
            .map_err(|e| Error::Config(format!("bad config {}: {e}", path.display())))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn queue_dir(&self) -> PathBuf {
        self.data_dir.join("queue")
    }

    pub fn records_dir(&self) -> PathBuf {
        self.data_dir.join("records")
    }

    fn validate(&self) -> Result<()> {
        if self.records.shard_count == 0 {
            return Err(Error::Config("records.shard_count must be at least 1".into()));
        }
        if self.workers.workers == 0 {
            return Err(Error::Config("workers.workers must be at least 1".into()));
        }
        if self.queue.high_water_mark == Some(0) {
            return Err(Error::Config("queue.high_water_mark must be at least 1".into()));
        }
        if !(self.queue.compact_ratio > 0.0 && self.queue.compact_ratio <= 1.0) {
            return Err(Error::Config("queue.compact_ratio must be in (0, 1]".into()));
        }
        for (name, value) in [
            ("workers.lease_duration_ms", self.workers.lease_duration),
            ("workers.job_timeout_ms", self.workers.job_timeout),
            ("queue.retry_base_delay_ms", self.queue.retry_base_delay),
            ("queue.retry_max_delay_ms", self.queue.retry_max_delay),
            ("records.io_retry_base_delay_ms", self.records.io_retry_base_delay),
        ] {
            if value > MAX_DURATION {
                return Err(Error::Config(format!(
                    "{name} must be at most {}",
                    MAX_DURATION.as_millis()
                )));
            }
        }
        // A lease that runs out mid-job hands the job to a second worker.
        if self.workers.job_timeout >= self.workers.lease_duration {
            return Err(Error::Config(
                "workers.job_timeout_ms must be shorter than workers.lease_duration_ms".into(),
            ));
        }
        Ok(())
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn optional_var<T: FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("environment variable {name} is invalid: {raw}"))),
        Err(_) => Ok(None),
    }
}

/// Durations as integer milliseconds.
mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
