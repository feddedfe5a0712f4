use std::fmt;

use chrono::NaiveDate;
use thiserror::Error;

/// Marker written for a day whose source data could not be obtained.
pub const NO_DATA_MARKER: &str = "NA";

/// Value stored for one repository on one day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DayValue {
    /// Qualifying events observed that day (possibly zero).
    Count(u64),
    /// No archive shard could be fetched for that day.
    NoData,
}

impl DayValue {
    pub fn count(&self) -> Option<u64> {
        match self {
            Self::Count(n) => Some(*n),
            Self::NoData => None,
        }
    }
}

impl fmt::Display for DayValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Count(n) => write!(f, "{n}"),
            Self::NoData => f.write_str(NO_DATA_MARKER),
        }
    }
}

/// What the series knows about a given day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    Count(u64),
    NoData,
    /// No record exists for that day.
    Unseen,
}

impl From<Option<DayValue>> for Observation {
    fn from(value: Option<DayValue>) -> Self {
        match value {
            Some(DayValue::Count(n)) => Self::Count(n),
            Some(DayValue::NoData) => Self::NoData,
            None => Self::Unseen,
        }
    }
}

/// One dated entry in a repository series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailyRecord {
    pub date: NaiveDate,
    pub value: DayValue,
}

impl DailyRecord {
    pub fn new(date: NaiveDate, value: DayValue) -> Self {
        Self { date, value }
    }
}

/// Errors decoding a persisted record line.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RecordParseError {
    #[error("expected `date,value`, got {line:?}")]
    MissingField { line: String },

    #[error("invalid date {raw:?}")]
    InvalidDate { raw: String },

    #[error("invalid value {raw:?}")]
    InvalidValue { raw: String },
}

impl DailyRecord {
    /// Parse a `YYYY-MM-DD,N` or `YYYY-MM-DD,NA` line.
    pub fn parse_line(line: &str) -> Result<Self, RecordParseError> {
        let Some((date_raw, value_raw)) = line.trim().split_once(',') else {
            return Err(RecordParseError::MissingField {
                line: line.to_string(),
            });
        };

        let date_raw = date_raw.trim();
        let date = NaiveDate::parse_from_str(date_raw, "%Y-%m-%d").map_err(|_| {
            RecordParseError::InvalidDate {
                raw: date_raw.to_string(),
            }
        })?;

        let value_raw = value_raw.trim();
        let value = if value_raw == NO_DATA_MARKER {
            DayValue::NoData
        } else {
            value_raw
                .parse::<u64>()
                .map(DayValue::Count)
                .map_err(|_| RecordParseError::InvalidValue {
                    raw: value_raw.to_string(),
                })?
        };

        Ok(Self { date, value })
    }
}

impl fmt::Display for DailyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.date.format("%Y-%m-%d"), self.value)
    }
}

/// Ordered daily history for one repository.
///
/// Dates are strictly increasing; `upsert` is the only way to add records,
/// so ordering and uniqueness hold by construction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntitySeries {
    records: Vec<DailyRecord>,
}

impl EntitySeries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a series from records in any order. Later duplicates win,
    /// matching the effect of upserting them in sequence.
    pub fn from_records(records: impl IntoIterator<Item = DailyRecord>) -> Self {
        let mut series = Self::new();
        for record in records {
            series.upsert(record.date, record.value);
        }
        series
    }

    /// Insert or overwrite the record for `date`.
    pub fn upsert(&mut self, date: NaiveDate, value: DayValue) {
        match self.records.binary_search_by_key(&date, |r| r.date) {
            Ok(idx) => self.records[idx].value = value,
            Err(idx) => self.records.insert(idx, DailyRecord::new(date, value)),
        }
    }

    /// Keep only the most recent `window` records.
    pub fn truncate(&mut self, window: usize) {
        if self.records.len() > window {
            let excess = self.records.len() - window;
            self.records.drain(..excess);
        }
    }

    pub fn observation(&self, date: NaiveDate) -> Observation {
        self.records
            .binary_search_by_key(&date, |r| r.date)
            .ok()
            .map(|idx| self.records[idx].value)
            .into()
    }

    pub fn records(&self) -> &[DailyRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn first_date(&self) -> Option<NaiveDate> {
        self.records.first().map(|r| r.date)
    }

    pub fn last_date(&self) -> Option<NaiveDate> {
        self.records.last().map(|r| r.date)
    }
}
