//! Tracked repository catalog.
//!
//! The catalog is produced elsewhere (repository discovery) as a CSV index
//! whose first column is the repository's `owner/name`. It is read once per
//! run and never modified here.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, info};

/// Ordered, de-duplicated list of tracked repositories.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Catalog {
    entities: Vec<String>,
}

impl Catalog {
    pub fn new(entities: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let mut seen = HashSet::new();
        let entities = entities
            .into_iter()
            .map(Into::into)
            .filter(|e: &String| !e.is_empty() && seen.insert(e.clone()))
            .collect();
        Self { entities }
    }

    /// Load the repository index. The first row is a header.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading repository index {}", path.display()))?;
        let catalog = Self::parse(&data);

        info!(
            path = %path.display(),
            repositories = catalog.len(),
            "loaded repository index",
        );

        Ok(catalog)
    }

    /// Parse index CSV text. Blank rows and empty ids are skipped.
    pub fn parse(data: &str) -> Self {
        let ids = data.lines().skip(1).filter_map(|row| {
            let id = first_column(row);
            if id.is_empty() {
                debug!(row, "skipping index row without repository");
                None
            } else {
                Some(id.to_string())
            }
        });
        Self::new(ids)
    }

    pub fn entities(&self) -> &[String] {
        &self.entities
    }

    pub fn to_set(&self) -> HashSet<String> {
        self.entities.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

fn first_column(row: &str) -> &str {
    let field = row.split(',').next().unwrap_or("").trim();
    field
        .strip_prefix('"')
        .and_then(|f| f.strip_suffix('"'))
        .unwrap_or(field)
        .trim()
}
