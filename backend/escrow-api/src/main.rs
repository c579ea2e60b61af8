//! Milestone escrow service, the entry point.
//!
//! Restores the escrow ledger from SQLite, exposes its operations over an Axum
//! REST API, and settles every payout through the external transfer service.
//! A background task retries transfers that failed under the `reconcile`
//! policy.

mod api;
mod config;
mod db;
mod errors;
mod events;
mod settlement;
mod store;
mod transfer;

use std::sync::Arc;
use std::time::Duration;

use milestone_escrow::SharedLedger;
use reqwest::Client;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::Config;
use settlement::Settlement;
use store::LedgerStore;
use transfer::HttpTransfer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging (RUST_LOG controls verbosity).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    // Load config from environment.
    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;

    // Set up the SQLite connection pool and run migrations.
    let pool = db::init_pool(&config.database_url).await?;

    // ─── Ledger state ─────────────────────────────────────
    let records = db::load_records(&pool).await?;
    let record_count = records.len();
    let ledger = Arc::new(
        SharedLedger::restore(records).map_err(|e| anyhow::anyhow!("restoring ledger: {e}"))?,
    );
    info!(
        "Restored {} project(s) from {record_count} record(s), settlement policy: {}",
        ledger.len(),
        config.failure_policy.as_str()
    );

    // HTTP client for the transfer service.
    let client = Client::builder()
        .timeout(Duration::from_secs(config.transfer_timeout_secs))
        .build()?;
    let transfer = HttpTransfer::new(
        client,
        config.transfer_url.clone(),
        config.transfer_max_attempts,
    );

    let store = Arc::new(LedgerStore::new(ledger, pool.clone()));

    let settlement = Arc::new(Settlement {
        pool: pool.clone(),
        store: Arc::clone(&store),
        transfer: Arc::new(transfer),
        payer: config.escrow_account.clone(),
        policy: config.failure_policy,
    });

    // ─── Background reconciler ────────────────────────────
    tokio::spawn(settlement::run(
        Arc::clone(&settlement),
        Duration::from_secs(config.reconcile_interval_secs),
    ));

    // ─── REST API ─────────────────────────────────────────
    let api_state = Arc::new(api::ApiState {
        store,
        pool,
        settlement,
    });
    let app = api::router(api_state);

    let addr = format!("0.0.0.0:{}", config.api_port);
    info!("API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
