use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use dashmap::DashMap;

use super::series::EntitySeries;
use super::SeriesBackend;

/// Series kept in process memory. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    series: DashMap<String, EntitySeries>,
    present: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend that already holds the given histories.
    pub fn with_series(series: impl IntoIterator<Item = (String, EntitySeries)>) -> Self {
        let backend = Self::new();
        for (entity, s) in series {
            backend.series.insert(entity, s);
        }
        backend.present.store(true, Ordering::Release);
        backend
    }
}

impl SeriesBackend for MemoryBackend {
    fn exists(&self) -> bool {
        self.present.load(Ordering::Acquire)
    }

    fn init(&self) -> Result<()> {
        self.present.store(true, Ordering::Release);
        Ok(())
    }

    fn load(&self, entity: &str) -> Result<Option<EntitySeries>> {
        Ok(self.series.get(entity).map(|s| s.value().clone()))
    }

    fn save(&self, entity: &str, series: &EntitySeries) -> Result<()> {
        self.present.store(true, Ordering::Release);
        self.series.insert(entity.to_string(), series.clone());
        Ok(())
    }

    fn remove(&self, entity: &str) -> Result<bool> {
        Ok(self.series.remove(entity).is_some())
    }

    fn entities(&self) -> Result<Vec<String>> {
        let mut entities: Vec<String> = self.series.iter().map(|e| e.key().clone()).collect();
        entities.sort();
        Ok(entities)
    }

    fn clear(&self) -> Result<usize> {
        let removed = self.series.len();
        self.series.clear();
        Ok(removed)
    }
}
