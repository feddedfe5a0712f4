use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path as UrlPath, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use chrono::NaiveDate;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use starwatch::aggregate::Aggregator;
use starwatch::archive::{ArchiveSource, FetchOutcome, HttpArchive, ShardPayload};
use starwatch::config::{ArchiveConfig, RetryConfig};

/// Requests seen per shard name.
#[derive(Default)]
struct Hits(Mutex<HashMap<String, usize>>);

impl Hits {
    fn bump(&self, shard: &str) -> usize {
        let mut hits = self.0.lock();
        let n = hits.entry(shard.to_string()).or_insert(0);
        *n += 1;
        *n
    }

    fn get(&self, shard: &str) -> usize {
        self.0.lock().get(shard).copied().unwrap_or(0)
    }
}

fn shard_body() -> Vec<u8> {
    let lines = [
        r#"{"type":"WatchEvent","repo":{"name":"acme/rocket"}}"#,
        r#"{"type":"WatchEvent","repo":{"name":"acme/rocket"}}"#,
        r#"{"type":"IssuesEvent","repo":{"name":"acme/rocket"}}"#,
    ];
    let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
    encoder
        .write_all(lines.join("\n").as_bytes())
        .expect("gzip write");
    encoder.finish().expect("gzip finish")
}

/// Hour 0 fails once with 500 then succeeds, hour 1 is missing, hour 2 is
/// always overloaded, hour 3 is rate limited once.
async fn shard_handler(
    State(hits): State<Arc<Hits>>,
    UrlPath(shard): UrlPath<String>,
) -> (StatusCode, Vec<u8>) {
    let n = hits.bump(&shard);
    match shard.as_str() {
        "2024-01-05-0.json.gz" if n == 1 => (StatusCode::INTERNAL_SERVER_ERROR, Vec::new()),
        "2024-01-05-0.json.gz" => (StatusCode::OK, shard_body()),
        "2024-01-05-2.json.gz" => (StatusCode::SERVICE_UNAVAILABLE, Vec::new()),
        "2024-01-05-3.json.gz" if n == 1 => (StatusCode::TOO_MANY_REQUESTS, Vec::new()),
        "2024-01-05-3.json.gz" => (StatusCode::OK, shard_body()),
        _ => (StatusCode::NOT_FOUND, Vec::new()),
    }
}

async fn serve(hits: Arc<Hits>) -> SocketAddr {
    let app = Router::new()
        .route("/:shard", get(shard_handler))
        .with_state(hits);
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    addr
}

/// Answers every request with a 200 whose body trickles in `chunks` KiB
/// pieces, one every `gap`.
async fn serve_trickle(chunks: usize, gap: Duration) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut request = [0u8; 4096];
                let _ = socket.read(&mut request).await;

                let head = format!(
                    "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                    chunks * 1024
                );
                if socket.write_all(head.as_bytes()).await.is_err() {
                    return;
                }
                let chunk = vec![b'x'; 1024];
                for _ in 0..chunks {
                    tokio::time::sleep(gap).await;
                    if socket.write_all(&chunk).await.is_err() {
                        return;
                    }
                }
                let _ = socket.shutdown().await;
            });
        }
    });
    addr
}

fn archive_config(addr: SocketAddr, staging: &Path) -> ArchiveConfig {
    ArchiveConfig {
        base_url: format!("http://{addr}"),
        timeout: Duration::from_secs(5),
        slow_threshold: Duration::from_secs(10),
        staging_dir: staging.to_path_buf(),
        retry: RetryConfig {
            max_retries: 2,
            base_delay: Duration::from_millis(10),
            multiplier: 2,
        },
    }
}

fn date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 5).expect("valid date")
}

fn staged_files(dir: &Path) -> usize {
    std::fs::read_dir(dir).expect("read staging dir").count()
}

#[tokio::test]
async fn test_retries_server_error_then_succeeds() {
    let hits = Arc::new(Hits::default());
    let addr = serve(Arc::clone(&hits)).await;
    let staging = tempfile::tempdir().expect("tempdir");

    let statuses = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&statuses);
    let archive = HttpArchive::new(&archive_config(addr, staging.path()))
        .expect("archive")
        .with_metrics(Box::new(move |status, _| {
            recorded.lock().push(status.to_string());
        }));

    let FetchOutcome::Payload(payload) = archive.fetch(date(), 0).await else {
        panic!("expected a payload after retry");
    };
    assert_eq!(hits.get("2024-01-05-0.json.gz"), 2);
    assert!(matches!(payload, ShardPayload::Staged(_)));
    assert_eq!(staged_files(staging.path()), 1);

    let tracked: HashSet<String> = ["acme/rocket".to_string()].into_iter().collect();
    let counts = Aggregator::default()
        .aggregate(payload, &tracked)
        .expect("aggregate");
    assert_eq!(counts.counts.get("acme/rocket"), Some(&2));
    assert_eq!(counts.records, 3);

    // Aggregation consumed the payload and released the staged file.
    assert_eq!(staged_files(staging.path()), 0);
    assert_eq!(*statuses.lock(), vec!["error", "success"]);
}

#[tokio::test]
async fn test_missing_shard_is_not_retried() {
    let hits = Arc::new(Hits::default());
    let addr = serve(Arc::clone(&hits)).await;
    let staging = tempfile::tempdir().expect("tempdir");
    let archive = HttpArchive::new(&archive_config(addr, staging.path())).expect("archive");

    let outcome = archive.fetch(date(), 1).await;
    assert!(!outcome.is_available());
    assert_eq!(hits.get("2024-01-05-1.json.gz"), 1);
    assert_eq!(staged_files(staging.path()), 0);
}

#[tokio::test]
async fn test_gives_up_after_retries() {
    let hits = Arc::new(Hits::default());
    let addr = serve(Arc::clone(&hits)).await;
    let staging = tempfile::tempdir().expect("tempdir");
    let archive = HttpArchive::new(&archive_config(addr, staging.path())).expect("archive");

    let outcome = archive.fetch(date(), 2).await;
    assert!(!outcome.is_available());
    // First attempt plus two retries.
    assert_eq!(hits.get("2024-01-05-2.json.gz"), 3);
    assert_eq!(staged_files(staging.path()), 0);
}

#[tokio::test]
async fn test_rate_limit_is_retried() {
    let hits = Arc::new(Hits::default());
    let addr = serve(Arc::clone(&hits)).await;
    let staging = tempfile::tempdir().expect("tempdir");
    let archive = HttpArchive::new(&archive_config(addr, staging.path())).expect("archive");

    let outcome = archive.fetch(date(), 3).await;
    assert!(outcome.is_available());
    assert_eq!(hits.get("2024-01-05-3.json.gz"), 2);
}

#[tokio::test]
async fn test_unreachable_archive_is_unavailable() {
    // Bind and immediately drop a listener to get a port nobody serves.
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        listener.local_addr().expect("local addr")
    };
    let staging = tempfile::tempdir().expect("tempdir");
    let mut cfg = archive_config(addr, staging.path());
    cfg.retry.max_retries = 1;
    let archive = HttpArchive::new(&cfg).expect("archive");

    assert!(!archive.fetch(date(), 0).await.is_available());
    assert_eq!(staged_files(staging.path()), 0);
}

#[tokio::test]
async fn test_steady_transfer_outlasting_timeout_completes() {
    // 8 chunks 200ms apart: 1.6s in total against a 500ms timeout.
    let addr = serve_trickle(8, Duration::from_millis(200)).await;
    let staging = tempfile::tempdir().expect("tempdir");
    let mut cfg = archive_config(addr, staging.path());
    cfg.timeout = Duration::from_millis(500);
    cfg.retry.max_retries = 0;

    let statuses = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&statuses);
    let archive = HttpArchive::new(&cfg)
        .expect("archive")
        .with_metrics(Box::new(move |status, _| {
            recorded.lock().push(status.to_string());
        }));

    let FetchOutcome::Payload(ShardPayload::Staged(staged)) = archive.fetch(date(), 0).await else {
        panic!("a transfer that keeps streaming must not time out");
    };
    let size = std::fs::metadata(staged.path()).expect("staged file").len();
    assert_eq!(size, 8 * 1024);
    assert_eq!(*statuses.lock(), vec!["success"]);
}

#[tokio::test]
async fn test_stalled_transfer_times_out() {
    // One chunk after a pause longer than the timeout.
    let addr = serve_trickle(1, Duration::from_millis(800)).await;
    let staging = tempfile::tempdir().expect("tempdir");
    let mut cfg = archive_config(addr, staging.path());
    cfg.timeout = Duration::from_millis(200);
    cfg.retry.max_retries = 0;
    let archive = HttpArchive::new(&cfg).expect("archive");

    assert!(!archive.fetch(date(), 0).await.is_available());
    assert_eq!(staged_files(staging.path()), 0);
}
