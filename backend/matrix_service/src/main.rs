//! Matrix Service entry point.
//!
//! Hosts the in-memory matrix engine behind an Axum REST API. Placements are
//! answered synchronously; the resulting fill and cycle events are handed to a
//! background payout worker that writes the SQLite ledger, runs re-entries and
//! forwards events to an optional webhook.

mod api;
mod config;
mod db;
mod errors;
mod events;
mod notify;
mod worker;

use std::sync::Arc;

use matrix_engine::{MatrixEngine, MatrixStore};
use reqwest::Client;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::Config;
use notify::Notifier;
use worker::WorkerState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging (RUST_LOG controls verbosity).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;

    // Set up the SQLite ledger and run migrations.
    let pool = db::init_pool(&config.database_url).await?;

    // ─── Engine ───────────────────────────────────────────
    // Ids restart with the in-memory engine; the run keeps ledger keys apart.
    let run = db::start_run(&pool).await?;
    info!("Engine run {run} started");
    let engine = MatrixEngine::new(Arc::new(MatrixStore::with_run(run)));
    if let Some(path) = &config.matrix_config_path {
        for matrix in config::load_matrix_configs(path)? {
            let created = engine.create_matrix(matrix)?;
            info!(
                "Matrix {} ({}) loaded: {}x{}",
                created.id, created.name, created.width, created.depth
            );
        }
    }

    // ─── Payout worker ────────────────────────────────────
    let notifier = match &config.notify_webhook_url {
        Some(url) => {
            let client = Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()?;
            Some(Notifier::new(client, url.clone(), config.notify_max_attempts))
        }
        None => {
            warn!("NOTIFY_WEBHOOK_URL not set; events will not be forwarded");
            None
        }
    };

    let (events_tx, events_rx) = mpsc::channel(config.payout_queue_capacity.max(1));
    let cancel = CancellationToken::new();
    let worker_state = Arc::new(WorkerState {
        engine: engine.clone(),
        pool: pool.clone(),
        notifier,
        payout_max_retries: config.payout_max_retries.max(1),
    });
    let worker = tokio::spawn(worker::run(worker_state, events_rx, cancel.clone()));

    // ─── REST API ─────────────────────────────────────────
    let api_state = Arc::new(api::ApiState {
        engine,
        pool,
        events: events_tx,
    });
    let app = api::router(api_state);

    let addr = format!("0.0.0.0:{}", config.api_port);
    info!("API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // The router (and its sender) is gone; let the worker drain what is queued.
    cancel.cancel();
    worker.await?;
    info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
