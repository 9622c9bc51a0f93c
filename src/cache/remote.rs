// =============================================================================
// Remote cache tier (Redis)
// =============================================================================
//
// Key format: `candles:{market}`, value: JSON-serialised candle list, TTL
// applied on every write. Every operation carries its own fixed timeout so a
// wedged connection degrades to the in-process tier instead of hanging the
// caller.
// =============================================================================

use std::time::Duration;

use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use crate::types::Candle;

/// Fixed ceiling on any single remote operation, connect included.
const OP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote cache operation timed out")]
    Timeout,

    #[error("remote cache error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("remote cache payload corrupt: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Primary candle cache tier. The multiplexed connection is established
/// lazily and dropped after any failure so the next call reconnects.
pub struct RemoteTier {
    client: redis::Client,
    conn: Mutex<Option<MultiplexedConnection>>,
    ttl_secs: u64,
}

impl RemoteTier {
    /// Build a tier for `url`. No I/O happens here; the first operation
    /// connects.
    pub fn new(url: &str, ttl_secs: u64) -> Result<Self, RemoteError> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            conn: Mutex::new(None),
            ttl_secs,
        })
    }

    fn key(market: &str) -> String {
        format!("candles:{market}")
    }

    async fn connection(&self) -> Result<MultiplexedConnection, RemoteError> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        let conn = tokio::time::timeout(OP_TIMEOUT, self.client.get_multiplexed_tokio_connection())
            .await
            .map_err(|_| RemoteError::Timeout)??;

        *guard = Some(conn.clone());
        debug!("remote cache connection established");
        Ok(conn)
    }

    /// Forget the cached connection after a failure.
    async fn reset(&self) {
        *self.conn.lock().await = None;
    }

    /// Read the market's candle window. A missing key is an empty window,
    /// not an error.
    pub async fn get(&self, market: &str) -> Result<Vec<Candle>, RemoteError> {
        let mut conn = self.connection().await?;

        let value: Option<String> =
            match tokio::time::timeout(OP_TIMEOUT, conn.get(Self::key(market))).await {
                Err(_) => {
                    self.reset().await;
                    return Err(RemoteError::Timeout);
                }
                Ok(Err(e)) => {
                    self.reset().await;
                    return Err(e.into());
                }
                Ok(Ok(v)) => v,
            };

        match value {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(Vec::new()),
        }
    }

    /// Replace the market's candle window, refreshing the TTL.
    pub async fn put(&self, market: &str, candles: &[Candle]) -> Result<(), RemoteError> {
        let json = serde_json::to_string(candles)?;
        let mut conn = self.connection().await?;

        match tokio::time::timeout(
            OP_TIMEOUT,
            conn.set_ex::<_, _, ()>(Self::key(market), json, self.ttl_secs),
        )
        .await
        {
            Err(_) => {
                self.reset().await;
                Err(RemoteError::Timeout)
            }
            Ok(Err(e)) => {
                self.reset().await;
                Err(e.into())
            }
            Ok(Ok(())) => {
                debug!(market, count = candles.len(), "candle window written to remote cache");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_format_matches_protocol() {
        assert_eq!(RemoteTier::key("KRW-BTC"), "candles:KRW-BTC");
    }

    #[tokio::test]
    async fn unreachable_remote_fails_instead_of_hanging() {
        let tier = RemoteTier::new("redis://127.0.0.1:1/", 60).unwrap();
        let started = std::time::Instant::now();
        assert!(tier.get("KRW-BTC").await.is_err());
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
