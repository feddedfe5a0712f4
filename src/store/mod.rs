//! Persisted per-repository daily series.
//!
//! [`SeriesStore`] is the only writer of history. Every write to a
//! repository's series goes through that repository's lock, so day tasks
//! running in parallel cannot interleave a load/modify/save cycle on the
//! same series.

pub mod file;
pub mod memory;
pub mod series;

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use self::series::{DayValue, EntitySeries};

/// Storage for whole series, keyed by repository.
pub trait SeriesBackend: Send + Sync + 'static {
    /// Whether persisted storage has been created at all.
    fn exists(&self) -> bool;

    /// Create the storage location if missing.
    fn init(&self) -> Result<()>;

    /// Load a repository's series, or `None` if it has never been written.
    fn load(&self, entity: &str) -> Result<Option<EntitySeries>>;

    /// Replace a repository's series.
    fn save(&self, entity: &str, series: &EntitySeries) -> Result<()>;

    /// Delete a repository's series. Returns whether one existed.
    fn remove(&self, entity: &str) -> Result<bool>;

    /// All repositories with a stored series, sorted.
    fn entities(&self) -> Result<Vec<String>>;

    /// Delete every stored series. Returns how many were removed.
    fn clear(&self) -> Result<usize>;
}

/// Why a run has to rebuild history from scratch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebuildDecision {
    NotNeeded,
    /// Nothing has been persisted yet.
    StorageAbsent,
    /// These tracked repositories hold fewer records than the window.
    ShortHistories(Vec<String>),
}

impl RebuildDecision {
    pub fn is_needed(&self) -> bool {
        !matches!(self, Self::NotNeeded)
    }
}

/// Result of writing one day for every tracked repository.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DayWrite {
    pub written: usize,
    pub failed: Vec<String>,
}

/// Window-bounded series store with per-repository write serialization.
pub struct SeriesStore<B> {
    backend: B,
    window: usize,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl<B: SeriesBackend> SeriesStore<B> {
    pub fn new(backend: B, window: usize) -> Self {
        Self {
            backend,
            window,
            locks: DashMap::new(),
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn lock_for(&self, entity: &str) -> Arc<Mutex<()>> {
        if let Some(lock) = self.locks.get(entity) {
            return Arc::clone(lock.value());
        }
        Arc::clone(
            self.locks
                .entry(entity.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }

    /// Load a series. Repositories never written load as an empty series.
    pub fn load(&self, entity: &str) -> Result<EntitySeries> {
        Ok(self
            .backend
            .load(entity)
            .with_context(|| format!("loading series for {entity}"))?
            .unwrap_or_default())
    }

    /// Insert or overwrite the record for `(entity, date)`, then truncate the
    /// series to the retention window.
    pub fn upsert(&self, entity: &str, date: NaiveDate, value: DayValue) -> Result<()> {
        let lock = self.lock_for(entity);
        let _guard = lock.lock();

        let mut series = self.load(entity)?;
        series.upsert(date, value);
        series.truncate(self.window);

        self.backend
            .save(entity, &series)
            .with_context(|| format!("saving series for {entity}"))
    }

    /// Write one day's values for many repositories. A failure on one
    /// repository is logged and does not stop the others.
    pub fn upsert_day<'a>(
        &self,
        date: NaiveDate,
        values: impl IntoIterator<Item = (&'a str, DayValue)>,
    ) -> DayWrite {
        let mut out = DayWrite::default();

        for (entity, value) in values {
            match self.upsert(entity, date, value) {
                Ok(()) => out.written += 1,
                Err(e) => {
                    warn!(entity, %date, error = %format!("{e:#}"), "failed to write day");
                    out.failed.push(entity.to_string());
                }
            }
        }

        debug!(%date, written = out.written, failed = out.failed.len(), "wrote day");

        out
    }

    /// First-run detection: storage missing, or any tracked repository with
    /// a stored series shorter than the window.
    pub fn needs_rebuild(&self, tracked: &[String]) -> RebuildDecision {
        if !self.backend.exists() {
            return RebuildDecision::StorageAbsent;
        }

        let mut short = Vec::new();
        for entity in tracked {
            match self.backend.load(entity) {
                Ok(Some(series)) if series.len() < self.window => short.push(entity.clone()),
                Ok(_) => {}
                Err(e) => {
                    warn!(entity = %entity, error = %format!("{e:#}"), "unreadable series, treating as short");
                    short.push(entity.clone());
                }
            }
        }

        if short.is_empty() {
            RebuildDecision::NotNeeded
        } else {
            RebuildDecision::ShortHistories(short)
        }
    }

    /// Create storage if missing.
    pub fn init(&self) -> Result<()> {
        self.backend.init().context("initializing series storage")
    }

    /// Delete every stored series.
    pub fn clear_all(&self) -> Result<usize> {
        self.backend.clear().context("clearing series storage")
    }

    /// Delete the series of the given repositories.
    pub fn clear_entities(&self, entities: &[String]) -> Result<usize> {
        let mut removed = 0;
        for entity in entities {
            let lock = self.lock_for(entity);
            let _guard = lock.lock();
            if self
                .backend
                .remove(entity)
                .with_context(|| format!("removing series for {entity}"))?
            {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Delete series of repositories that are no longer tracked. Returns the
    /// repositories removed.
    pub fn prune(&self, tracked: &HashSet<String>) -> Result<Vec<String>> {
        let stale: Vec<String> = self
            .backend
            .entities()
            .context("listing stored series")?
            .into_iter()
            .filter(|entity| !tracked.contains(entity))
            .collect();

        self.clear_entities(&stale)?;

        Ok(stale)
    }
}
