//! Shard aggregation.
//!
//! Decodes one gzip-compressed NDJSON shard and counts qualifying events per
//! tracked repository. Records are decoded one line at a time; a bad record
//! never stops the rest of the shard from being counted.

use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::io::BufRead;

use flate2::bufread::MultiGzDecoder;
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use crate::archive::ShardPayload;

/// Errors that prevent a shard from being read at all.
#[derive(Error, Debug)]
pub enum AggregateError {
    #[error("opening shard payload: {0:#}")]
    Open(anyhow::Error),
}

/// Per-repository counts for one hourly shard.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ShardCounts {
    /// Qualifying events per tracked repository. Only repositories with at
    /// least one event appear.
    pub counts: HashMap<String, u64>,
    /// Records that could not be decoded.
    pub malformed: u64,
    /// Records decoded, including ones that did not qualify.
    pub records: u64,
    /// Whether decompression failed before the end of the stream.
    pub truncated: bool,
}

#[derive(Deserialize)]
struct RawEvent<'a> {
    #[serde(rename = "type", borrow)]
    kind: Cow<'a, str>,
    #[serde(borrow)]
    repo: RawRepo<'a>,
}

#[derive(Deserialize)]
struct RawRepo<'a> {
    #[serde(borrow)]
    name: Cow<'a, str>,
}

/// Counts qualifying events for tracked repositories.
#[derive(Debug, Clone)]
pub struct Aggregator {
    qualifying_event: String,
}

impl Aggregator {
    pub fn new(qualifying_event: impl Into<String>) -> Self {
        Self {
            qualifying_event: qualifying_event.into(),
        }
    }

    pub fn qualifying_event(&self) -> &str {
        &self.qualifying_event
    }

    /// Aggregate a shard payload. The payload is consumed, so a staged file
    /// is released as soon as this returns.
    pub fn aggregate(
        &self,
        payload: ShardPayload,
        tracked: &HashSet<String>,
    ) -> Result<ShardCounts, AggregateError> {
        let reader = payload.reader().map_err(AggregateError::Open)?;
        Ok(self.aggregate_gzip(reader, tracked))
    }

    /// Aggregate a gzip-compressed NDJSON stream.
    pub fn aggregate_gzip<R: BufRead>(&self, reader: R, tracked: &HashSet<String>) -> ShardCounts {
        let decoder = std::io::BufReader::new(MultiGzDecoder::new(reader));
        self.aggregate_lines(decoder, tracked)
    }

    /// Aggregate an uncompressed NDJSON stream.
    pub fn aggregate_lines<R: BufRead>(
        &self,
        mut reader: R,
        tracked: &HashSet<String>,
    ) -> ShardCounts {
        let mut out = ShardCounts::default();
        let mut line = Vec::with_capacity(4096);

        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, records = out.records, "shard stream ended early");
                    out.truncated = true;
                    break;
                }
            }

            let record = trim_line(&line);
            if record.is_empty() {
                continue;
            }

            match serde_json::from_slice::<RawEvent<'_>>(record) {
                Ok(event) => {
                    out.records += 1;
                    if event.kind.as_ref() != self.qualifying_event.as_str() {
                        continue;
                    }
                    let name = event.repo.name.as_ref();
                    if !tracked.contains(name) {
                        continue;
                    }
                    match out.counts.get_mut(name) {
                        Some(count) => *count += 1,
                        None => {
                            out.counts.insert(name.to_string(), 1);
                        }
                    }
                }
                Err(_) => out.malformed += 1,
            }
        }

        out
    }
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new("WatchEvent")
    }
}

fn trim_line(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && matches!(line[end - 1], b'\n' | b'\r' | b' ' | b'\t') {
        end -= 1;
    }
    &line[..end]
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};

    use flate2::write::GzEncoder;
    use flate2::Compression;

    use super::*;

    fn tracked(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).expect("gzip write");
        encoder.finish().expect("gzip finish")
    }

    fn event(kind: &str, repo: &str) -> String {
        format!(r#"{{"id":"1","type":"{kind}","actor":{{"login":"u"}},"repo":{{"id":9,"name":"{repo}"}},"payload":{{"action":"started"}}}}"#)
    }

    #[test]
    fn test_counts_only_qualifying_tracked_events() {
        let data = [
            event("WatchEvent", "a/one"),
            event("WatchEvent", "a/one"),
            event("PushEvent", "a/one"),
            event("WatchEvent", "b/two"),
            event("WatchEvent", "c/untracked"),
        ]
        .join("\n");

        let out = Aggregator::default()
            .aggregate_lines(data.as_bytes(), &tracked(&["a/one", "b/two", "d/quiet"]));

        assert_eq!(out.counts.get("a/one"), Some(&2));
        assert_eq!(out.counts.get("b/two"), Some(&1));
        assert!(!out.counts.contains_key("c/untracked"));
        // Repositories without events are absent, not zero.
        assert!(!out.counts.contains_key("d/quiet"));
        assert_eq!(out.records, 5);
        assert_eq!(out.malformed, 0);
    }

    #[test]
    fn test_malformed_records_are_skipped() {
        let mut data = Vec::new();
        data.extend_from_slice(event("WatchEvent", "a/one").as_bytes());
        data.extend_from_slice(b"\n{not json\n");
        data.extend_from_slice(b"{\"type\":\"WatchEvent\"}\n");
        data.extend_from_slice(b"{\"type\":\"WatchEvent\",\"repo\":{\"name\":7}}\n");
        data.extend_from_slice(&[0xff, 0xfe, b'\n']);
        data.extend_from_slice(b"\n\r\n");
        data.extend_from_slice(event("WatchEvent", "a/one").as_bytes());

        let out = Aggregator::default().aggregate_lines(data.as_slice(), &tracked(&["a/one"]));

        assert_eq!(out.counts.get("a/one"), Some(&2));
        assert_eq!(out.malformed, 4);
        assert_eq!(out.records, 2);
    }

    #[test]
    fn test_escaped_repo_name_decodes() {
        let data = r#"{"type":"WatchEvent","repo":{"name":"a\/one"}}"#;
        let out = Aggregator::default().aggregate_lines(data.as_bytes(), &tracked(&["a/one"]));
        assert_eq!(out.counts.get("a/one"), Some(&1));
    }

    #[test]
    fn test_custom_qualifying_event() {
        let data = [event("WatchEvent", "a/one"), event("ForkEvent", "a/one")].join("\n");
        let out = Aggregator::new("ForkEvent").aggregate_lines(data.as_bytes(), &tracked(&["a/one"]));
        assert_eq!(out.counts.get("a/one"), Some(&1));
    }

    #[test]
    fn test_gzip_payload() {
        let data = [event("WatchEvent", "a/one"), event("WatchEvent", "a/one")].join("\n");
        let payload = ShardPayload::Memory(gzip(data.as_bytes()));

        let out = Aggregator::default()
            .aggregate(payload, &tracked(&["a/one"]))
            .expect("aggregate");
        assert_eq!(out.counts.get("a/one"), Some(&2));
        assert!(!out.truncated);
    }

    #[test]
    fn test_multi_member_gzip() {
        let mut bytes = gzip(format!("{}\n", event("WatchEvent", "a/one")).as_bytes());
        bytes.extend(gzip(event("WatchEvent", "a/one").as_bytes()));

        let out = Aggregator::default()
            .aggregate(ShardPayload::Memory(bytes), &tracked(&["a/one"]))
            .expect("aggregate");
        assert_eq!(out.counts.get("a/one"), Some(&2));
    }

    /// Yields its data, then fails like a corrupt stream would.
    struct FailingReader {
        data: std::io::Cursor<Vec<u8>>,
    }

    impl std::io::Read for FailingReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = self.data.read(buf)?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "corrupt deflate stream",
                ));
            }
            Ok(n)
        }
    }

    #[test]
    fn test_stream_error_keeps_partial_counts() {
        let data = format!(
            "{}\n{}\n",
            event("WatchEvent", "a/one"),
            event("WatchEvent", "a/one")
        );
        let reader = std::io::BufReader::new(FailingReader {
            data: std::io::Cursor::new(data.into_bytes()),
        });

        let out = Aggregator::default().aggregate_lines(reader, &tracked(&["a/one"]));
        assert!(out.truncated);
        assert_eq!(out.counts.get("a/one"), Some(&2));
    }

    #[test]
    fn test_corrupt_gzip_does_not_panic() {
        let data = (0..2000)
            .map(|_| event("WatchEvent", "a/one"))
            .collect::<Vec<_>>()
            .join("\n");
        let mut bytes = gzip(data.as_bytes());
        let keep = bytes.len() / 2;
        bytes.truncate(keep);

        let out = Aggregator::default()
            .aggregate(ShardPayload::Memory(bytes), &tracked(&["a/one"]))
            .expect("aggregate");
        assert!(out.counts.get("a/one").copied().unwrap_or(0) < 2000);
    }

    #[test]
    fn test_staged_payload_released_after_aggregate() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("temp_2024-01-01-0.json.gz");
        std::fs::write(&path, gzip(event("WatchEvent", "a/one").as_bytes())).expect("write");

        let payload = ShardPayload::Staged(crate::archive::staging::StagedFile::adopt(path.clone()));
        let out = Aggregator::default()
            .aggregate(payload, &tracked(&["a/one"]))
            .expect("aggregate");

        assert_eq!(out.counts.get("a/one"), Some(&1));
        assert!(!path.exists());
    }

    #[test]
    fn test_missing_staged_file_is_open_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let payload = ShardPayload::Staged(crate::archive::staging::StagedFile::adopt(
            dir.path().join("temp_missing.json.gz"),
        ));
        let err = Aggregator::default()
            .aggregate(payload, &tracked(&["a/one"]))
            .expect_err("should fail");
        assert!(err.to_string().contains("opening"));
    }
}
