use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::archive::retry::RetryPolicy;

/// Top-level configuration for a starwatch run.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Event archive source configuration.
    #[serde(default)]
    pub archive: ArchiveConfig,

    /// Tracked repository catalog configuration.
    #[serde(default)]
    pub catalog: CatalogConfig,

    /// Persisted series store configuration.
    #[serde(default)]
    pub store: StoreConfig,

    /// Day fan-out and aggregation configuration.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Event archive source configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ArchiveConfig {
    /// Base URL of the hourly archive. Default: "https://data.gharchive.org".
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Connect timeout and per-read idle timeout. A transfer that keeps
    /// receiving bytes is never cut off. Default: 15s.
    #[serde(default = "default_fetch_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Downloads slower than this are logged as warnings. Default: 10s.
    #[serde(default = "default_slow_threshold", with = "humantime_serde")]
    pub slow_threshold: Duration,

    /// Directory holding shards while they are being aggregated. Default: ".staging".
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,

    /// Retry behaviour for transient fetch failures.
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Retry configuration for shard downloads.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt. Default: 2.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry. Default: 1s.
    #[serde(default = "default_base_delay", with = "humantime_serde")]
    pub base_delay: Duration,

    /// Factor applied to the delay after each retry. Default: 2.
    #[serde(default = "default_multiplier")]
    pub multiplier: u32,
}

/// Tracked repository catalog configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogConfig {
    /// Path to the repository index CSV. Default: "repo_index.csv".
    #[serde(default = "default_catalog_path")]
    pub path: PathBuf,
}

/// Persisted series store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Directory with one history file per repository. Default: "star_history".
    #[serde(default = "default_store_dir")]
    pub dir: PathBuf,

    /// Number of most recent days kept per repository. Default: 30.
    #[serde(default = "default_retention_days")]
    pub retention_days: usize,
}

/// Day fan-out and aggregation configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Days processed concurrently. Default: 12.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Event type counted as a star. Default: "WatchEvent".
    #[serde(default = "default_qualifying_event")]
    pub qualifying_event: String,

    /// What a short history clears on first-run detection. Default: all.
    #[serde(default)]
    pub rebuild_scope: RebuildScope,
}

/// How much persisted history a first-run rebuild discards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebuildScope {
    /// Any short history clears every repository's history.
    #[default]
    All,
    /// Only the short histories are cleared.
    Entity,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Serve /metrics and /healthz while the run is in progress. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_base_url() -> String {
    "https://data.gharchive.org".to_string()
}

fn default_fetch_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_slow_threshold() -> Duration {
    Duration::from_secs(10)
}

fn default_staging_dir() -> PathBuf {
    PathBuf::from(".staging")
}

fn default_max_retries() -> u32 {
    2
}

fn default_base_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_multiplier() -> u32 {
    2
}

fn default_catalog_path() -> PathBuf {
    PathBuf::from("repo_index.csv")
}

fn default_store_dir() -> PathBuf {
    PathBuf::from("star_history")
}

fn default_retention_days() -> usize {
    30
}

fn default_workers() -> usize {
    12
}

fn default_qualifying_event() -> String {
    "WatchEvent".to_string()
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            archive: ArchiveConfig::default(),
            catalog: CatalogConfig::default(),
            store: StoreConfig::default(),
            pipeline: PipelineConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout: default_fetch_timeout(),
            slow_threshold: default_slow_threshold(),
            staging_dir: default_staging_dir(),
            retry: RetryConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay: default_base_delay(),
            multiplier: default_multiplier(),
        }
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            path: default_catalog_path(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: default_store_dir(),
            retention_days: default_retention_days(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            qualifying_event: default_qualifying_event(),
            rebuild_scope: RebuildScope::default(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.archive.base_url.is_empty() {
            bail!("archive.base_url is required");
        }

        if self.archive.timeout.is_zero() {
            bail!("archive.timeout must be positive");
        }

        if self.archive.staging_dir.as_os_str().is_empty() {
            bail!("archive.staging_dir is required");
        }

        if self.archive.retry.multiplier == 0 {
            bail!("archive.retry.multiplier must be positive");
        }

        if self.catalog.path.as_os_str().is_empty() {
            bail!("catalog.path is required");
        }

        if self.store.dir.as_os_str().is_empty() {
            bail!("store.dir is required");
        }

        if self.store.retention_days == 0 {
            bail!("store.retention_days must be positive");
        }

        if self.pipeline.workers == 0 {
            bail!("pipeline.workers must be positive");
        }

        if self.pipeline.qualifying_event.trim().is_empty() {
            bail!("pipeline.qualifying_event is required");
        }

        Ok(())
    }
}

impl RetryConfig {
    /// Builds the retry policy handed to the archive fetcher.
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.base_delay, self.multiplier)
    }
}
