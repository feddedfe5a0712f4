use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use tracing::{debug, info, warn};

const STAGING_PREFIX: &str = "temp_";
const STAGING_SUFFIX: &str = ".json.gz";

/// Staging file name for one hourly shard.
pub fn staged_name(date: NaiveDate, hour: u8) -> String {
    format!("{STAGING_PREFIX}{}-{hour}{STAGING_SUFFIX}", date.format("%Y-%m-%d"))
}

/// A downloaded shard on local disk. The file is removed when the guard
/// is dropped, whether aggregation finished, failed or panicked.
#[derive(Debug)]
pub struct StagedFile {
    path: PathBuf,
}

impl StagedFile {
    /// Takes ownership of an already written file.
    pub fn adopt(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn open(&self) -> Result<BufReader<File>> {
        let file = File::open(&self.path)
            .with_context(|| format!("opening staged shard {}", self.path.display()))?;
        Ok(BufReader::new(file))
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "released staged shard"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to remove staged shard")
            }
        }
    }
}

fn is_staged_name(name: &str) -> bool {
    name.starts_with(STAGING_PREFIX) && name.ends_with(STAGING_SUFFIX)
}

/// Removes staged shards left behind by interrupted runs.
///
/// Returns how many files were deleted. A missing directory counts as clean.
pub fn cleanup_staging(dir: &Path) -> Result<usize> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => {
            return Err(e).with_context(|| format!("listing staging dir {}", dir.display()));
        }
    };

    let mut removed = 0;
    for entry in entries {
        let entry = entry.with_context(|| format!("reading staging dir {}", dir.display()))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !is_staged_name(name) {
            continue;
        }

        match std::fs::remove_file(entry.path()) {
            Ok(()) => {
                info!(file = name, "deleted leftover staged shard");
                removed += 1;
            }
            Err(e) => warn!(file = name, error = %e, "failed to delete leftover staged shard"),
        }
    }

    Ok(removed)
}
