//! Duty pharmacy ingestion, binary entrypoint.
//!
//! `serve` runs the scheduler (and the metrics endpoint when configured),
//! `pull` runs one province synchronously, `init-db` prepares the database.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use pharmacy_duty_ingest::config::AppConfig;
use pharmacy_duty_ingest::ingest::config::load_endpoints_default;
use pharmacy_duty_ingest::ingest::providers::HttpAdapters;
use pharmacy_duty_ingest::ingest::repository::{ConditionalCache, SourceRepository};
use pharmacy_duty_ingest::ingest::scheduler::{spawn_recurring, Scheduler};
use pharmacy_duty_ingest::ingest::ensure_metrics_described;
use pharmacy_duty_ingest::metrics::Metrics;
use pharmacy_duty_ingest::notify::NotifyHub;
use pharmacy_duty_ingest::{IngestStore, Pipeline, SqliteStore};

#[derive(Parser)]
#[command(name = "duty-ingest", version, about = "Duty pharmacy ingestion and reconciliation")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler until Ctrl-C.
    Serve {
        /// Skip the full sync queued at start.
        #[arg(long)]
        no_initial_sync: bool,
    },
    /// Pull one province now and print the report as JSON.
    Pull { province: String },
    /// Create the schema, seed provinces and the built-in endpoints.
    InitDb,
}

/// Compact logs by default, JSON with `LOG_FORMAT=json`.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("pharmacy_duty_ingest=info,warn"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().compact()).init();
    }
}

async fn build_pipeline(cfg: &AppConfig, store: SqliteStore) -> Result<Pipeline> {
    let cache = Arc::new(ConditionalCache::new());
    match store.latest_validators().await {
        Ok(v) => cache.seed(v),
        Err(e) => tracing::warn!(target: "ingest", error = %e, "validators not restored"),
    }
    let store: Arc<dyn IngestStore> = Arc::new(store);
    let adapters = Arc::new(HttpAdapters::new(&cfg.fetch));
    let mut repo = SourceRepository::new(
        store.clone(),
        adapters,
        cache,
        cfg.orchestrator.clone(),
        cfg.authority.clone(),
    );
    let hub = NotifyHub::from_config(&cfg.notify);
    if !hub.is_empty() {
        repo = repo.with_notify(Arc::new(hub));
    }
    Ok(Pipeline::new(
        Arc::new(repo),
        store,
        Duration::from_secs(cfg.scheduler.province_budget_secs),
    ))
}

async fn serve(cfg: AppConfig, store: SqliteStore, no_initial_sync: bool) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    if let Some(addr) = cfg.metrics.addr.clone() {
        let metrics = Metrics::init()?;
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("binding metrics listener on {addr}"))?;
        tracing::info!(%addr, "metrics endpoint listening");
        let router = metrics.router();
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                tracing::warn!(error = %e, "metrics server stopped");
            }
        });
    } else {
        ensure_metrics_described();
    }

    let pipeline = Arc::new(build_pipeline(&cfg, store).await?);
    let (scheduler, handle) = Scheduler::new(pipeline, &cfg.scheduler);
    let pool = tokio::spawn(scheduler.run(shutdown_rx.clone()));
    let ticker = spawn_recurring(
        handle.clone(),
        Duration::from_secs(cfg.scheduler.recurring_interval_secs),
        cfg.scheduler.provinces.clone(),
        shutdown_rx,
    );
    if !no_initial_sync {
        handle.full_sync("startup");
    }

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("shutdown requested, waiting for running pulls");
    let _ = shutdown_tx.send(true);
    let _ = ticker.await;
    let _ = pool.await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    let cfg = AppConfig::load_default().context("loading configuration")?;
    let store = SqliteStore::open(Path::new(&cfg.database.path))
        .with_context(|| format!("opening database {}", cfg.database.path))?;

    match cli.command {
        Command::Serve { no_initial_sync } => serve(cfg, store, no_initial_sync).await,
        Command::Pull { province } => {
            ensure_metrics_described();
            let pipeline = build_pipeline(&cfg, store).await?;
            let report = pipeline
                .pull_province(&province)
                .await
                .with_context(|| format!("pulling {province}"))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::InitDb => {
            let endpoints = load_endpoints_default(&cfg.authority)?;
            let n = store.seed_endpoints(&endpoints).await?;
            tracing::info!(path = %cfg.database.path, endpoints = n, "database initialised");
            println!("seeded {n} endpoints into {}", cfg.database.path);
            Ok(())
        }
    }
}
