// =============================================================================
// REST API endpoints — Axum 0.7
// =============================================================================
//
// Thin adapters over the cache and store; no pipeline logic lives here. All
// chart endpoints answer from local state only and degrade to an empty series
// instead of erroring, so the dashboard always renders.
//
// CORS is configured permissively for development; tighten `allowed_origins`
// in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    response::IntoResponse,
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use crate::app_state::AppState;
use crate::types::{Candle, LightweightCandle};

/// History rows returned when the caller does not ask for a specific limit.
const DEFAULT_HISTORY_LIMIT: usize = 200;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST + WebSocket router with CORS middleware and shared
/// state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/chart/:market", get(chart_data))
        .route("/api/v1/chart/:market/history", get(chart_history))
        .route("/api/v1/chart/:market/summary", get(chart_summary))
        .route("/api/v1/ws/chart", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    bootstrap_done: bool,
    refresh_ok: u64,
    refresh_failed: u64,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let resp = HealthResponse {
        status: "ok",
        uptime_secs: state.uptime_secs(),
        bootstrap_done: state.bootstrap_done.load(std::sync::atomic::Ordering::Relaxed),
        refresh_ok: state.refresh_ok.load(std::sync::atomic::Ordering::Relaxed),
        refresh_failed: state.refresh_failed.load(std::sync::atomic::Ordering::Relaxed),
        server_time: chrono::Utc::now().timestamp_millis(),
    };
    Json(resp)
}

// =============================================================================
// Chart data (fast path — cache only, no upstream call)
// =============================================================================

async fn chart_data(
    Path(market): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let candles = state.cache.get(&market).await;
    Json(to_chart_series(&candles))
}

/// Convert a newest-first candle window into the ascending series the chart
/// frontend expects.
fn to_chart_series(candles: &[Candle]) -> Vec<LightweightCandle> {
    let mut series: Vec<LightweightCandle> = candles.iter().map(LightweightCandle::from).collect();
    series.sort_by_key(|c| c.time);
    series
}

// =============================================================================
// Chart history (durable path — persistence store)
// =============================================================================

#[derive(Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

async fn chart_history(
    Path(market): Path<String>,
    Query(query): Query<HistoryQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);

    let rows = match state.store.query_recent(&market, limit) {
        Ok(rows) => rows,
        Err(e) => {
            warn!(market = %market, error = %e, "history query failed, returning empty series");
            Vec::new()
        }
    };

    let mut series: Vec<LightweightCandle> = rows
        .iter()
        .map(|row| LightweightCandle {
            time: row.candle_time,
            open: row.open_price,
            high: row.high_price,
            low: row.low_price,
            close: row.close_price,
        })
        .collect();
    series.sort_by_key(|c| c.time);

    Json(series)
}

// =============================================================================
// Store summary (diagnostics)
// =============================================================================

async fn chart_summary(
    Path(market): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    Json(state.store.summarize(&market))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tests::candle_at;

    #[test]
    fn chart_series_is_ascending() {
        let window = vec![candle_at(220, "12"), candle_at(160, "11"), candle_at(100, "10")];
        let series = to_chart_series(&window);
        let times: Vec<i64> = series.iter().map(|c| c.time).collect();
        assert_eq!(times, vec![100, 160, 220]);
    }
}
