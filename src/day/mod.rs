//! Day processing: 24 hourly shards folded into one count map.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::NaiveDate;
use tracing::{debug, info, warn};

use crate::aggregate::Aggregator;
use crate::archive::{ArchiveSource, FetchOutcome, HOURS_PER_DAY};
use crate::store::series::DayValue;

/// Counts for every tracked repository on one day.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DayCounts {
    /// Seeded with zero for every tracked repository.
    pub counts: HashMap<String, u64>,
    /// Hours whose shard was fetched and read.
    pub hours_fetched: u8,
    /// Malformed records skipped across all hours.
    pub malformed: u64,
}

/// Result of processing one day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DayOutcome {
    /// At least one hour had data; missing hours are ignored.
    Counts(DayCounts),
    /// Not a single hour could be fetched.
    Unavailable,
}

impl DayOutcome {
    /// Value to store for `entity`. Untracked names read as zero on an
    /// available day.
    pub fn value_for(&self, entity: &str) -> DayValue {
        match self {
            Self::Counts(day) => DayValue::Count(day.counts.get(entity).copied().unwrap_or(0)),
            Self::Unavailable => DayValue::NoData,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Self::Counts(_))
    }
}

/// Fetches and aggregates the hourly shards of a day, one hour at a time.
pub struct DayProcessor<S> {
    source: Arc<S>,
    aggregator: Aggregator,
    /// Optional callback with (malformed records) per aggregated shard.
    on_shard: Option<Box<dyn Fn(u64) + Send + Sync>>,
}

impl<S: ArchiveSource> DayProcessor<S> {
    pub fn new(source: Arc<S>, aggregator: Aggregator) -> Self {
        Self {
            source,
            aggregator,
            on_shard: None,
        }
    }

    /// Set a callback invoked after each shard is aggregated.
    pub fn with_shard_callback(mut self, cb: Box<dyn Fn(u64) + Send + Sync>) -> Self {
        self.on_shard = Some(cb);
        self
    }

    /// Process hours 0..23 of `date` sequentially.
    pub async fn process(&self, date: NaiveDate, tracked: &Arc<HashSet<String>>) -> DayOutcome {
        info!(%date, "processing day");

        let mut day = DayCounts {
            counts: tracked.iter().map(|e| (e.clone(), 0)).collect(),
            ..Default::default()
        };

        for hour in 0..HOURS_PER_DAY {
            let payload = match self.source.fetch(date, hour).await {
                FetchOutcome::Payload(payload) => payload,
                FetchOutcome::Unavailable => continue,
            };

            let aggregator = self.aggregator.clone();
            let tracked = Arc::clone(tracked);
            let result =
                tokio::task::spawn_blocking(move || aggregator.aggregate(payload, &tracked)).await;

            let shard = match result {
                Ok(Ok(shard)) => shard,
                Ok(Err(e)) => {
                    warn!(%date, hour, error = %e, "skipping unreadable shard");
                    continue;
                }
                Err(e) => {
                    warn!(%date, hour, error = %e, "shard aggregation task failed");
                    continue;
                }
            };

            debug!(
                %date,
                hour,
                records = shard.records,
                malformed = shard.malformed,
                repos = shard.counts.len(),
                "aggregated shard",
            );

            if let Some(ref cb) = self.on_shard {
                cb(shard.malformed);
            }

            day.hours_fetched += 1;
            day.malformed += shard.malformed;
            for (entity, count) in shard.counts {
                *day.counts.entry(entity).or_insert(0) += count;
            }
        }

        if day.hours_fetched == 0 {
            warn!(%date, "no data available for day, recording it as unavailable");
            return DayOutcome::Unavailable;
        }

        info!(%date, hours_fetched = day.hours_fetched, "day processed");
        DayOutcome::Counts(day)
    }
}
