// =============================================================================
// WebSocket handler — live candle updates per market
// =============================================================================
//
// Clients connect to `/api/v1/ws/chart?market=<market>` and receive one JSON
// frame per published candle update on that market's channel. A missing or
// blank market falls back to the configured default.
//
// Each connection owns its own broadcast receiver, so a slow or disconnected
// client lags or drops alone; the pipeline and other subscribers are
// unaffected.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::app_state::AppState;

#[derive(Deserialize)]
pub struct WsQuery {
    market: Option<String>,
}

/// Axum handler for the WebSocket upgrade request.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let market = query
        .market
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| state.config.default_market.clone());

    info!(market = %market, "chart WebSocket connection accepted");
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state, market))
}

/// Forward the market's broadcast channel to one client until either side
/// goes away.
async fn handle_ws_connection(socket: WebSocket, state: Arc<AppState>, market: String) {
    let mut updates = state.broadcaster.subscribe(&market);
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            update = updates.recv() => {
                match update {
                    Ok(update) => {
                        let json = match serde_json::to_string(&update) {
                            Ok(json) => json,
                            Err(e) => {
                                warn!(market = %market, error = %e, "failed to serialise candle update");
                                continue;
                            }
                        };
                        if sender.send(Message::Text(json)).await.is_err() {
                            debug!(market = %market, "WebSocket send failed, disconnecting");
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        // Only this subscriber misses the skipped updates.
                        warn!(market = %market, skipped, "slow chart subscriber lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => {
                        info!(market = %market, "chart WebSocket closed by client");
                        break;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(_)) => {
                        // Text / binary / pong frames carry nothing we need.
                        debug!(market = %market, "ignoring inbound WebSocket frame");
                    }
                    Some(Err(e)) => {
                        warn!(market = %market, error = %e, "WebSocket receive error, disconnecting");
                        break;
                    }
                }
            }
        }
    }

    info!(market = %market, "chart WebSocket connection closed");
}
