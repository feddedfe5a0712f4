use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use starwatch::aggregate::Aggregator;
use starwatch::archive::HttpArchive;
use starwatch::catalog::Catalog;
use starwatch::config::Config;
use starwatch::day::DayProcessor;
use starwatch::export::health::HealthMetrics;
use starwatch::pipeline::Pipeline;
use starwatch::store::file::FileBackend;
use starwatch::store::SeriesStore;

/// Daily star-history ingestion from the public GitHub event archive.
#[derive(Parser)]
#[command(name = "starwatch", about)]
struct Cli {
    /// Path to the YAML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    /// Overrides `log_level` from the config file.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest the retention window ending yesterday (the default).
    Run {
        /// Treat this day (YYYY-MM-DD) as today, reprocessing the window before it.
        /// Stored histories keep only the most recent days, so a date older than
        /// what is already stored leaves those histories unchanged.
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Delete histories of repositories no longer in the index.
    Prune,
    /// Print version information and exit.
    Version,
}

/// Build-time version info.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("starwatch {}", version::full());
        return Ok(());
    }

    let cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => {
            let cfg = Config::default();
            cfg.validate()?;
            cfg
        }
    };

    let log_level = cli.log_level.as_deref().unwrap_or(&cfg.log_level);
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("invalid log level: {log_level}"))?;

    fmt().with_env_filter(filter).with_target(true).init();

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting starwatch",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    match cli.command {
        Some(Command::Prune) => prune(&cfg),
        Some(Command::Run { date }) => rt.block_on(run(cfg, date)),
        None => rt.block_on(run(cfg, None)),
        Some(Command::Version) => Ok(()),
    }
}

async fn run(cfg: Config, date: Option<NaiveDate>) -> Result<()> {
    let catalog = Catalog::load(&cfg.catalog.path)?;
    if catalog.is_empty() {
        bail!(
            "no repositories in {}, nothing to track",
            cfg.catalog.path.display()
        );
    }

    let health = Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);
    if cfg.health.enabled {
        health
            .start()
            .await
            .context("starting health metrics server")?;
    }

    let fetch_metrics = Arc::clone(&health);
    let archive = HttpArchive::new(&cfg.archive)?.with_metrics(Box::new(move |status, elapsed| {
        fetch_metrics
            .fetch_attempts
            .with_label_values(&[status])
            .inc();
        fetch_metrics.fetch_duration.observe(elapsed.as_secs_f64());
    }));

    let shard_metrics = Arc::clone(&health);
    let processor = DayProcessor::new(
        Arc::new(archive),
        Aggregator::new(cfg.pipeline.qualifying_event.clone()),
    )
    .with_shard_callback(Box::new(move |malformed| {
        shard_metrics.shards_aggregated.inc();
        shard_metrics.malformed_records.inc_by(malformed as f64);
    }));

    let store = Arc::new(SeriesStore::new(
        FileBackend::new(cfg.store.dir.clone()),
        cfg.store.retention_days,
    ));

    let pipeline = Pipeline::new(processor, store)
        .with_workers(cfg.pipeline.workers)
        .with_rebuild_scope(cfg.pipeline.rebuild_scope)
        .with_staging_dir(cfg.archive.staging_dir.clone())
        .with_metrics(Arc::clone(&health));

    let now = match date {
        Some(day) => day
            .and_hms_opt(0, 0, 0)
            .context("building run timestamp")?
            .and_utc(),
        None => Utc::now(),
    };

    let result = pipeline.run(catalog.entities(), now).await;

    health.stop().await?;

    let report = result?;
    tracing::info!(
        window_start = %report.window_start,
        window_end = %report.window_end,
        repositories = report.entities,
        records = report.records_written(),
        "star history update complete",
    );

    Ok(())
}

fn prune(cfg: &Config) -> Result<()> {
    let catalog = Catalog::load(&cfg.catalog.path)?;
    if catalog.is_empty() {
        bail!(
            "no repositories in {}, refusing to prune every history",
            cfg.catalog.path.display()
        );
    }

    let store = SeriesStore::new(
        FileBackend::new(cfg.store.dir.clone()),
        cfg.store.retention_days,
    );
    let removed = store.prune(&catalog.to_set())?;

    for entity in &removed {
        tracing::info!(repository = %entity, "removed outdated history");
    }
    tracing::info!(removed = removed.len(), "prune complete");

    Ok(())
}
