//! Run orchestration.
//!
//! A run covers the `W` complete days before "now". Each day is processed
//! in its own task on a bounded worker pool; as soon as a day finishes its
//! values are written for every tracked repository. Days are independent,
//! so the only shared resource is the series store, which serializes
//! writes per repository.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Days, NaiveDate, Utc};
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::archive::staging::cleanup_staging;
use crate::archive::ArchiveSource;
use crate::config::RebuildScope;
use crate::day::{DayOutcome, DayProcessor};
use crate::export::health::HealthMetrics;
use crate::store::{DayWrite, RebuildDecision, SeriesBackend, SeriesStore};

/// Default number of days processed concurrently.
pub const DEFAULT_WORKERS: usize = 12;

/// How a single day ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DayStatus {
    Available { hours_fetched: u8 },
    Unavailable,
    /// The day task crashed; the day was recorded as unavailable.
    Failed,
}

impl DayStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available { .. } => "available",
            Self::Unavailable => "unavailable",
            Self::Failed => "failed",
        }
    }
}

/// Per-day summary of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayReport {
    pub date: NaiveDate,
    pub status: DayStatus,
    pub records_written: usize,
    pub write_failures: usize,
}

/// Summary of a whole run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub window_start: NaiveDate,
    pub window_end: NaiveDate,
    pub entities: usize,
    pub rebuild: RebuildDecision,
    /// Sorted by date.
    pub days: Vec<DayReport>,
}

impl RunReport {
    pub fn records_written(&self) -> usize {
        self.days.iter().map(|d| d.records_written).sum()
    }

    pub fn count(&self, pred: impl Fn(&DayStatus) -> bool) -> usize {
        self.days.iter().filter(|d| pred(&d.status)).count()
    }

    pub fn available_days(&self) -> usize {
        self.count(|s| matches!(s, DayStatus::Available { .. }))
    }

    pub fn unavailable_days(&self) -> usize {
        self.count(|s| matches!(s, DayStatus::Unavailable))
    }

    pub fn failed_days(&self) -> usize {
        self.count(|s| matches!(s, DayStatus::Failed))
    }
}

/// The `window` complete days before `today`, oldest first. Today itself
/// is still accumulating events and is never included.
pub fn target_days(today: NaiveDate, window: usize) -> Vec<NaiveDate> {
    (1..=window as u64)
        .rev()
        .filter_map(|back| today.checked_sub_days(Days::new(back)))
        .collect()
}

/// Orchestrates a run over the retention window.
pub struct Pipeline<S, B> {
    processor: Arc<DayProcessor<S>>,
    store: Arc<SeriesStore<B>>,
    workers: usize,
    rebuild_scope: RebuildScope,
    staging_dir: Option<PathBuf>,
    metrics: Option<Arc<HealthMetrics>>,
}

impl<S: ArchiveSource, B: SeriesBackend> Pipeline<S, B> {
    pub fn new(processor: DayProcessor<S>, store: Arc<SeriesStore<B>>) -> Self {
        Self {
            processor: Arc::new(processor),
            store,
            workers: DEFAULT_WORKERS,
            rebuild_scope: RebuildScope::default(),
            staging_dir: None,
            metrics: None,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_rebuild_scope(mut self, scope: RebuildScope) -> Self {
        self.rebuild_scope = scope;
        self
    }

    /// Directory swept for leftover staged shards at the start and end of a run.
    pub fn with_staging_dir(mut self, dir: PathBuf) -> Self {
        self.staging_dir = Some(dir);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<HealthMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn sweep_staging(&self) {
        let Some(ref dir) = self.staging_dir else {
            return;
        };
        match cleanup_staging(dir) {
            Ok(0) => {}
            Ok(removed) => info!(removed, "removed leftover staged shards"),
            Err(e) => warn!(error = %format!("{e:#}"), "staging cleanup failed"),
        }
    }

    /// Process the window ending the day before `now` for `tracked`.
    pub async fn run(&self, tracked: &[String], now: DateTime<Utc>) -> Result<RunReport> {
        if tracked.is_empty() {
            bail!("no tracked repositories");
        }

        self.sweep_staging();

        let window = self.store.window();
        let days = target_days(now.date_naive(), window);
        let (Some(&window_start), Some(&window_end)) = (days.first(), days.last()) else {
            bail!("empty day window (retention {window})");
        };

        if let Some(ref m) = self.metrics {
            m.tracked_entities.set(tracked.len() as f64);
        }

        let tracked_list: Arc<Vec<String>> = Arc::new(tracked.to_vec());
        let rebuild = self.prepare_storage(Arc::clone(&tracked_list)).await?;

        info!(
            %window_start,
            %window_end,
            repositories = tracked_list.len(),
            workers = self.workers,
            "starting run",
        );

        let tracked_set: Arc<HashSet<String>> = Arc::new(tracked.iter().cloned().collect());
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut in_flight = tokio::task::JoinSet::new();

        for date in days {
            in_flight.spawn(run_day(
                date,
                Arc::clone(&self.processor),
                Arc::clone(&self.store),
                Arc::clone(&tracked_set),
                Arc::clone(&tracked_list),
                Arc::clone(&semaphore),
                self.metrics.clone(),
            ));
        }

        let mut reports = Vec::with_capacity(window);
        while let Some(joined) = in_flight.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(e) => error!(error = %e, "day worker join failed"),
            }
        }
        reports.sort_by_key(|r| r.date);

        self.sweep_staging();

        let report = RunReport {
            window_start,
            window_end,
            entities: tracked_list.len(),
            rebuild,
            days: reports,
        };

        if let Some(ref m) = self.metrics {
            m.last_run_completed.set(Utc::now().timestamp() as f64);
        }

        info!(
            available = report.available_days(),
            unavailable = report.unavailable_days(),
            failed = report.failed_days(),
            records = report.records_written(),
            "run complete",
        );

        Ok(report)
    }

    /// First-run detection and clearing, then storage initialization.
    async fn prepare_storage(&self, tracked: Arc<Vec<String>>) -> Result<RebuildDecision> {
        let store = Arc::clone(&self.store);
        let scope = self.rebuild_scope;

        let decision = tokio::task::spawn_blocking(move || -> Result<RebuildDecision> {
            let decision = store.needs_rebuild(&tracked);

            match (&decision, scope) {
                (RebuildDecision::NotNeeded, _) => {}
                (RebuildDecision::StorageAbsent, _) => {
                    info!("first run detected, no stored history");
                }
                (RebuildDecision::ShortHistories(short), RebuildScope::All) => {
                    info!(
                        short = short.len(),
                        first = ?short.first(),
                        "first run detected, clearing all stored history",
                    );
                    let removed = store.clear_all()?;
                    info!(removed, "cleared stored history");
                }
                (RebuildDecision::ShortHistories(short), RebuildScope::Entity) => {
                    info!(
                        short = short.len(),
                        "short histories detected, clearing only those",
                    );
                    store.clear_entities(short)?;
                }
            }

            store.init()?;
            Ok(decision)
        })
        .await
        .context("storage preparation task failed")??;

        if decision.is_needed() {
            if let Some(ref m) = self.metrics {
                m.rebuilds.inc();
            }
        }

        Ok(decision)
    }
}

/// One day task: wait for a worker slot, process the day in an isolated
/// task, then write its values. A crash while processing is contained
/// here and recorded as an unavailable day.
async fn run_day<S: ArchiveSource, B: SeriesBackend>(
    date: NaiveDate,
    processor: Arc<DayProcessor<S>>,
    store: Arc<SeriesStore<B>>,
    tracked_set: Arc<HashSet<String>>,
    tracked_list: Arc<Vec<String>>,
    semaphore: Arc<Semaphore>,
    metrics: Option<Arc<HealthMetrics>>,
) -> DayReport {
    let _permit = match semaphore.acquire_owned().await {
        Ok(permit) => Some(permit),
        Err(e) => {
            warn!(%date, error = %e, "worker pool closed, running day without a slot");
            None
        }
    };

    let start = Instant::now();

    let processed =
        tokio::spawn(async move { processor.process(date, &tracked_set).await }).await;

    let (status, outcome) = match processed {
        Ok(DayOutcome::Counts(counts)) => (
            DayStatus::Available {
                hours_fetched: counts.hours_fetched,
            },
            DayOutcome::Counts(counts),
        ),
        Ok(DayOutcome::Unavailable) => (DayStatus::Unavailable, DayOutcome::Unavailable),
        Err(e) => {
            error!(%date, error = %e, "day task failed, recording day as unavailable");
            (DayStatus::Failed, DayOutcome::Unavailable)
        }
    };

    let write = tokio::task::spawn_blocking(move || {
        store.upsert_day(
            date,
            tracked_list
                .iter()
                .map(|entity| (entity.as_str(), outcome.value_for(entity))),
        )
    })
    .await;

    let write = match write {
        Ok(write) => write,
        Err(e) => {
            error!(%date, error = %e, "store write task failed");
            DayWrite::default()
        }
    };

    if let Some(ref m) = metrics {
        m.days_processed.with_label_values(&[status.as_str()]).inc();
        m.day_duration.observe(start.elapsed().as_secs_f64());
        m.records_written.inc_by(write.written as f64);
        m.record_write_errors.inc_by(write.failed.len() as f64);
    }

    DayReport {
        date,
        status,
        records_written: write.written,
        write_failures: write.failed.len(),
    }
}
