// =============================================================================
// Chartflow — candle ingestion and chart-serving backend
// =============================================================================
//
// Startup order: config → shared state → API server → bootstrap + scheduled
// refresh. Bootstrap runs in its own task so incoming reads are never
// blocked; they simply see an empty (or synthetic) cache until it completes.
// =============================================================================

mod api;
mod app_state;
mod broadcast;
mod cache;
mod config;
mod pipeline;
mod store;
mod types;
mod upbit;

use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::config::AppConfig;
use crate::pipeline::Pipeline;
use crate::upbit::UpbitClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Chartflow starting up");

    let mut config = AppConfig::load("chartflow.json").unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    // Environment overrides for deploy-time knobs.
    if let Ok(market) = std::env::var("CHARTFLOW_MARKET") {
        if !market.trim().is_empty() {
            config.default_market = market.trim().to_uppercase();
        }
    }
    if let Ok(url) = std::env::var("CHARTFLOW_REDIS_URL") {
        config.redis_url = url;
    }
    if let Ok(path) = std::env::var("CHARTFLOW_DB_PATH") {
        config.db_path = path;
    }
    if let Ok(addr) = std::env::var("CHARTFLOW_BIND_ADDR") {
        config.bind_addr = addr;
    }
    if let Ok(flag) = std::env::var("CHARTFLOW_INGEST_ENABLED") {
        config.ingest_enabled = flag != "0" && !flag.eq_ignore_ascii_case("false");
    }

    info!(
        market = %config.default_market,
        ingest_enabled = config.ingest_enabled,
        bind_addr = %config.bind_addr,
        "configuration resolved"
    );

    // ── 2. Build shared state ────────────────────────────────────────────
    let state = Arc::new(AppState::new(config.clone())?);

    // ── 3. Start the API server ──────────────────────────────────────────
    let api_state = state.clone();
    let bind_addr = config.bind_addr.clone();
    tokio::spawn(async move {
        let app = api::rest::router(api_state);
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .expect("Failed to bind API server");
        info!(addr = %bind_addr, "API server listening");
        axum::serve(listener, app).await.expect("API server failed");
    });

    // ── 4. Ingestion pipeline ────────────────────────────────────────────
    if config.ingest_enabled {
        let source = Arc::new(UpbitClient::new(config.upbit_api_url.clone()));
        let pipeline = Arc::new(Pipeline::new(state.clone(), source));

        // One-time history load, off the serving path.
        let boot = pipeline.clone();
        tokio::spawn(async move {
            boot.bootstrap().await;
        });

        // Minute-aligned refresh, runs until shutdown.
        tokio::spawn(async move {
            pipeline.run_refresh_loop().await;
        });
    } else {
        info!("ingestion disabled; serving existing cache and store only");
    }

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 5. Shutdown ──────────────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping");

    info!("Chartflow shut down complete.");
    Ok(())
}
