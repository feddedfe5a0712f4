use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use super::series::{DailyRecord, EntitySeries};
use super::SeriesBackend;

const HISTORY_SUFFIX: &str = ".csv";
const TMP_SUFFIX: &str = ".tmp";

/// File name holding the history of `entity` ("owner/name" -> "owner_name.csv").
pub fn history_file_name(entity: &str) -> String {
    format!("{}{HISTORY_SUFFIX}", entity.replacen('/', "_", 1))
}

/// Inverse of [`history_file_name`]. Owner logins cannot contain `_`, so the
/// first underscore is the separator.
pub fn entity_from_file_name(file_name: &str) -> Option<String> {
    let stem = file_name.strip_suffix(HISTORY_SUFFIX)?;
    if stem.is_empty() || stem.starts_with('.') {
        return None;
    }
    Some(stem.replacen('_', "/", 1))
}

/// One CSV file per repository inside a directory.
///
/// Each line is `YYYY-MM-DD,N` or `YYYY-MM-DD,NA`, sorted by date. Writes
/// go through a temporary sibling file and a rename, so readers never see a
/// half-written history.
#[derive(Debug, Clone)]
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, entity: &str) -> PathBuf {
        self.dir.join(history_file_name(entity))
    }

    fn history_files(&self) -> Result<Vec<(String, PathBuf)>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("listing history dir {}", self.dir.display()));
            }
        };

        let mut files = Vec::new();
        for entry in entries {
            let entry =
                entry.with_context(|| format!("reading history dir {}", self.dir.display()))?;
            let name = entry.file_name();
            let Some(entity) = name.to_str().and_then(entity_from_file_name) else {
                continue;
            };
            files.push((entity, entry.path()));
        }
        files.sort();

        Ok(files)
    }
}

impl SeriesBackend for FileBackend {
    fn exists(&self) -> bool {
        self.dir.is_dir()
    }

    fn init(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating history dir {}", self.dir.display()))
    }

    fn load(&self, entity: &str) -> Result<Option<EntitySeries>> {
        let path = self.path_for(entity);
        let data = match std::fs::read_to_string(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("reading history {}", path.display()));
            }
        };

        let mut records = Vec::new();
        for (idx, line) in data.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record = DailyRecord::parse_line(line)
                .with_context(|| format!("{}:{}", path.display(), idx + 1))?;
            records.push(record);
        }

        Ok(Some(EntitySeries::from_records(records)))
    }

    fn save(&self, entity: &str, series: &EntitySeries) -> Result<()> {
        self.init()?;

        let path = self.path_for(entity);
        let mut tmp_name = path.clone().into_os_string();
        tmp_name.push(TMP_SUFFIX);
        let tmp = PathBuf::from(tmp_name);

        let mut buf = Vec::with_capacity(series.len() * 16);
        for record in series.records() {
            writeln!(buf, "{record}").context("formatting history record")?;
        }

        std::fs::write(&tmp, &buf).with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("replacing history {}", path.display()))?;

        debug!(entity, records = series.len(), "saved history");

        Ok(())
    }

    fn remove(&self, entity: &str) -> Result<bool> {
        let path = self.path_for(entity);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("removing history {}", path.display())),
        }
    }

    fn entities(&self) -> Result<Vec<String>> {
        Ok(self
            .history_files()?
            .into_iter()
            .map(|(entity, _)| entity)
            .collect())
    }

    fn clear(&self) -> Result<usize> {
        let files = self.history_files()?;
        for (_, path) in &files {
            std::fs::remove_file(path)
                .with_context(|| format!("removing history {}", path.display()))?;
        }
        Ok(files.len())
    }
}
