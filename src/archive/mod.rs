//! Hourly event archive access.
//!
//! An [`ArchiveSource`] resolves one `(date, hour)` shard to either a payload
//! ready for aggregation or [`FetchOutcome::Unavailable`]. The archive has
//! gaps, so unavailability is an ordinary outcome rather than an error.

pub mod retry;
pub mod staging;

use std::io::{BufRead, Cursor};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::ArchiveConfig;

use self::retry::RetryPolicy;
use self::staging::{staged_name, StagedFile};

/// Hours in one archive day.
pub const HOURS_PER_DAY: u8 = 24;

/// Callback type for recording fetch metrics.
/// The callback receives (status, duration) for every attempt.
pub type FetchMetricsCallback = Box<dyn Fn(&str, Duration) + Send + Sync>;

/// Raw shard bytes, either staged on disk or held in memory.
#[derive(Debug)]
pub enum ShardPayload {
    Staged(StagedFile),
    Memory(Vec<u8>),
}

impl ShardPayload {
    /// Returns a reader over the compressed payload.
    pub fn reader(&self) -> Result<Box<dyn BufRead + '_>> {
        match self {
            Self::Staged(file) => Ok(Box::new(file.open()?)),
            Self::Memory(bytes) => Ok(Box::new(Cursor::new(bytes.as_slice()))),
        }
    }
}

/// Result of fetching one shard.
#[derive(Debug)]
pub enum FetchOutcome {
    Payload(ShardPayload),
    Unavailable,
}

impl FetchOutcome {
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Payload(_))
    }
}

/// Source of hourly archive shards.
pub trait ArchiveSource: Send + Sync + 'static {
    /// Fetch the shard for one hour of one day.
    fn fetch(
        &self,
        date: NaiveDate,
        hour: u8,
    ) -> impl std::future::Future<Output = FetchOutcome> + Send;
}

/// Errors from a single download attempt.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected status {status}")]
    Status { status: reqwest::StatusCode },

    #[error("staging {path}: {source}")]
    Staging {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl FetchError {
    /// Timeouts, connection failures, 5xx and 429 are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(e) => !e.is_builder() && !e.is_redirect(),
            Self::Status { status } => {
                status.is_server_error() || *status == reqwest::StatusCode::TOO_MANY_REQUESTS
            }
            Self::Staging { .. } => false,
        }
    }
}

/// Shard URL for an archive rooted at `base_url`.
pub fn shard_url(base_url: &str, date: NaiveDate, hour: u8) -> String {
    format!(
        "{}/{}-{hour}.json.gz",
        base_url.trim_end_matches('/'),
        date.format("%Y-%m-%d")
    )
}

/// HTTP archive client that stages each shard on local disk.
pub struct HttpArchive {
    http: reqwest::Client,
    base_url: String,
    staging_dir: PathBuf,
    policy: RetryPolicy,
    slow_threshold: Duration,
    metrics: Option<FetchMetricsCallback>,
}

impl HttpArchive {
    /// Create a new archive client.
    pub fn new(cfg: &ArchiveConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(cfg.timeout)
            .read_timeout(cfg.timeout)
            .build()
            .context("building HTTP client")?;

        std::fs::create_dir_all(&cfg.staging_dir).with_context(|| {
            format!("creating staging dir {}", cfg.staging_dir.display())
        })?;

        Ok(Self {
            http,
            base_url: cfg.base_url.clone(),
            staging_dir: cfg.staging_dir.clone(),
            policy: cfg.retry.policy(),
            slow_threshold: cfg.slow_threshold,
            metrics: None,
        })
    }

    /// Set a metrics callback for recording attempt outcomes.
    pub fn with_metrics(mut self, cb: FetchMetricsCallback) -> Self {
        self.metrics = Some(cb);
        self
    }

    fn record_attempt(&self, status: &str, duration: Duration) {
        if let Some(ref cb) = self.metrics {
            cb(status, duration);
        }
    }

    /// Download one shard into the staging directory.
    async fn download(
        &self,
        url: &str,
        date: NaiveDate,
        hour: u8,
    ) -> Result<StagedFile, FetchError> {
        let mut response = self.http.get(url).send().await?;

        let status = response.status();
        if !status.is_success() {
            // Drain body for connection reuse.
            let _ = response.bytes().await;
            return Err(FetchError::Status { status });
        }

        let path = self.staging_dir.join(staged_name(date, hour));
        let staging_err = |source| FetchError::Staging {
            path: path.clone(),
            source,
        };

        let mut file = tokio::fs::File::create(&path)
            .await
            .map_err(staging_err)?;
        // From here on the guard removes the partial file on any early return.
        let staged = StagedFile::adopt(path.clone());

        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await.map_err(staging_err)?;
        }
        file.flush().await.map_err(staging_err)?;

        Ok(staged)
    }
}

impl ArchiveSource for HttpArchive {
    async fn fetch(&self, date: NaiveDate, hour: u8) -> FetchOutcome {
        let url = shard_url(&self.base_url, date, hour);
        let attempts = self.policy.attempts();

        for attempt in 0..attempts {
            let start = Instant::now();

            match self.download(&url, date, hour).await {
                Ok(staged) => {
                    let elapsed = start.elapsed();
                    if elapsed > self.slow_threshold {
                        warn!(url = %url, elapsed_s = elapsed.as_secs_f64(), "slow download");
                        self.record_attempt("slow", elapsed);
                    } else {
                        info!(url = %url, elapsed_s = elapsed.as_secs_f64(), "downloaded shard");
                        self.record_attempt("success", elapsed);
                    }
                    return FetchOutcome::Payload(ShardPayload::Staged(staged));
                }
                Err(e) if !e.is_retryable() => {
                    self.record_attempt("unavailable", start.elapsed());
                    info!(url = %url, error = %e, "shard unavailable");
                    return FetchOutcome::Unavailable;
                }
                Err(e) => {
                    self.record_attempt("error", start.elapsed());
                    warn!(
                        url = %url,
                        attempt = attempt + 1,
                        error = %e,
                        "shard download attempt failed",
                    );

                    if self.policy.should_retry(attempt) {
                        let delay = self.policy.delay_for(attempt);
                        debug!(url = %url, delay_ms = delay.as_millis() as u64, "backing off");
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        warn!(url = %url, attempts, "giving up on shard");
        FetchOutcome::Unavailable
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::*;

    #[test]
    fn test_shard_url() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 5).expect("valid date");
        assert_eq!(
            shard_url("https://data.gharchive.org", date, 7),
            "https://data.gharchive.org/2024-01-05-7.json.gz"
        );
        assert_eq!(
            shard_url("http://localhost:8080/", date, 23),
            "http://localhost:8080/2024-01-05-23.json.gz"
        );
    }

    #[test]
    fn test_status_retry_classification() {
        let retryable = [
            reqwest::StatusCode::INTERNAL_SERVER_ERROR,
            reqwest::StatusCode::BAD_GATEWAY,
            reqwest::StatusCode::SERVICE_UNAVAILABLE,
            reqwest::StatusCode::TOO_MANY_REQUESTS,
        ];
        for status in retryable {
            assert!(FetchError::Status { status }.is_retryable(), "{status}");
        }

        let terminal = [
            reqwest::StatusCode::NOT_FOUND,
            reqwest::StatusCode::FORBIDDEN,
            reqwest::StatusCode::GONE,
        ];
        for status in terminal {
            assert!(!FetchError::Status { status }.is_retryable(), "{status}");
        }
    }

    #[test]
    fn test_staging_error_not_retryable() {
        let err = FetchError::Staging {
            path: PathBuf::from("/nope"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("/nope"));
    }

    #[test]
    fn test_memory_payload_reader() {
        let payload = ShardPayload::Memory(b"abc".to_vec());
        let mut out = String::new();
        payload
            .reader()
            .expect("reader")
            .read_to_string(&mut out)
            .expect("read");
        assert_eq!(out, "abc");
    }

    #[test]
    fn test_fetch_outcome_is_available() {
        assert!(FetchOutcome::Payload(ShardPayload::Memory(Vec::new())).is_available());
        assert!(!FetchOutcome::Unavailable.is_available());
    }
}
