use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Prometheus metrics for ingestion runs.
///
/// All metrics use the "starwatch" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Shard download attempts by status (success/slow/error/unavailable).
    pub fetch_attempts: CounterVec,
    /// Shard download attempt duration.
    pub fetch_duration: Histogram,
    /// Shards fully aggregated.
    pub shards_aggregated: Counter,
    /// Malformed records skipped during aggregation.
    pub malformed_records: Counter,
    /// Days processed by status (available/unavailable/failed).
    pub days_processed: CounterVec,
    /// Wall time of one day task.
    pub day_duration: Histogram,
    /// Daily records written to the series store.
    pub records_written: Counter,
    /// Daily records that failed to write.
    pub record_write_errors: Counter,
    /// Runs that discarded history because of first-run detection.
    pub rebuilds: Counter,
    /// Repositories tracked by the current run.
    pub tracked_entities: Gauge,
    /// Unix time of the last completed run.
    pub last_run_completed: Gauge,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let fetch_attempts = CounterVec::new(
            Opts::new(
                "shard_fetch_attempts_total",
                "Shard download attempts by status.",
            )
            .namespace("starwatch"),
            &["status"],
        )?;
        let fetch_duration = Histogram::with_opts(
            HistogramOpts::new(
                "shard_fetch_duration_seconds",
                "Duration of one shard download attempt.",
            )
            .namespace("starwatch")
            .buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 15.0, 30.0]),
        )?;
        let shards_aggregated = Counter::with_opts(
            Opts::new("shards_aggregated_total", "Shards fully aggregated.")
                .namespace("starwatch"),
        )?;
        let malformed_records = Counter::with_opts(
            Opts::new(
                "malformed_records_total",
                "Malformed archive records skipped during aggregation.",
            )
            .namespace("starwatch"),
        )?;
        let days_processed = CounterVec::new(
            Opts::new("days_processed_total", "Days processed by status.").namespace("starwatch"),
            &["status"],
        )?;
        let day_duration = Histogram::with_opts(
            HistogramOpts::new("day_duration_seconds", "Wall time of one day task.")
                .namespace("starwatch")
                .buckets(vec![1.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1200.0]),
        )?;
        let records_written = Counter::with_opts(
            Opts::new(
                "records_written_total",
                "Daily records written to the series store.",
            )
            .namespace("starwatch"),
        )?;
        let record_write_errors = Counter::with_opts(
            Opts::new(
                "record_write_errors_total",
                "Daily records that failed to write.",
            )
            .namespace("starwatch"),
        )?;
        let rebuilds = Counter::with_opts(
            Opts::new(
                "rebuilds_total",
                "Runs that discarded history on first-run detection.",
            )
            .namespace("starwatch"),
        )?;
        let tracked_entities = Gauge::with_opts(
            Opts::new("tracked_entities", "Repositories tracked by the current run.")
                .namespace("starwatch"),
        )?;
        let last_run_completed = Gauge::with_opts(
            Opts::new(
                "last_run_completed_timestamp_seconds",
                "Unix time of the last completed run.",
            )
            .namespace("starwatch"),
        )?;

        registry.register(Box::new(fetch_attempts.clone()))?;
        registry.register(Box::new(fetch_duration.clone()))?;
        registry.register(Box::new(shards_aggregated.clone()))?;
        registry.register(Box::new(malformed_records.clone()))?;
        registry.register(Box::new(days_processed.clone()))?;
        registry.register(Box::new(day_duration.clone()))?;
        registry.register(Box::new(records_written.clone()))?;
        registry.register(Box::new(record_write_errors.clone()))?;
        registry.register(Box::new(rebuilds.clone()))?;
        registry.register(Box::new(tracked_entities.clone()))?;
        registry.register(Box::new(last_run_completed.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            fetch_attempts,
            fetch_duration,
            shards_aggregated,
            malformed_records,
            days_processed,
            day_duration,
            records_written,
            record_write_errors,
            rebuilds,
            tracked_entities,
            last_run_completed,
        })
    }

    /// Renders all metrics in the Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode_registry(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let registry = self.registry.clone();
        let app_state = Arc::new(AppState { registry });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

fn encode_registry(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode_registry(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
