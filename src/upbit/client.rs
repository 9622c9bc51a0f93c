// =============================================================================
// Upbit REST API client — minute-candle fetches with retry/backoff
// =============================================================================
//
// Only the public candle endpoint is used; no request signing. Upbit caps a
// single candle request at 200 rows, so larger history fetches page backwards
// with the `to` cursor.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use crate::types::{Candle, UpbitCandle};

/// Documented upstream ceiling on candles per request.
const MAX_COUNT_PER_REQUEST: usize = 200;
/// Attempt budget for one HTTP request.
const RETRY_ATTEMPTS: u32 = 3;
/// Fixed delay between attempts.
const RETRY_BACKOFF: Duration = Duration::from_secs(1);
/// Outer HTTP timeout applied to every request.
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// Errors
// =============================================================================

/// Failure modes of an upstream fetch. All of them are "temporarily
/// unavailable" from the orchestrator's point of view; none are fatal.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("upstream request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("upstream returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("upstream response malformed: {0}")]
    Malformed(String),

    #[error("no latest candle returned for market {0}")]
    EmptyLatest(String),
}

// =============================================================================
// CandleSource trait
// =============================================================================

/// The upstream seam the orchestrator is written against. The production
/// implementation is [`UpbitClient`]; tests substitute a canned source.
#[async_trait]
pub trait CandleSource: Send + Sync {
    /// Fetch up to `count` most recent candles for `market`, newest first.
    async fn fetch_recent(&self, market: &str, count: usize) -> Result<Vec<Candle>, FetchError>;

    /// Fetch exactly the latest candle. Zero candles is an operational
    /// anomaly and surfaces as an error rather than a silent empty result.
    async fn fetch_latest(&self, market: &str) -> Result<Candle, FetchError> {
        let mut candles = self.fetch_recent(market, 1).await?;
        if candles.is_empty() {
            return Err(FetchError::EmptyLatest(market.to_string()));
        }
        Ok(candles.remove(0))
    }
}

// =============================================================================
// UpbitClient
// =============================================================================

/// Upbit REST client for 1-minute candles.
pub struct UpbitClient {
    client: reqwest::Client,
    base_url: String,
    /// Running count of candles dropped by validation, for diagnostics.
    dropped_invalid: AtomicU64,
}

impl UpbitClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");

        Self {
            client,
            base_url: base_url.into(),
            dropped_invalid: AtomicU64::new(0),
        }
    }

    /// Total candles dropped by validation since startup.
    pub fn dropped_invalid(&self) -> u64 {
        self.dropped_invalid.load(Ordering::Relaxed)
    }

    /// One GET of at most [`MAX_COUNT_PER_REQUEST`] candles, retried up to
    /// [`RETRY_ATTEMPTS`] times with fixed backoff. `to` pages backwards:
    /// when set, only candles strictly older than it are returned.
    async fn fetch_page(
        &self,
        market: &str,
        count: usize,
        to: Option<&str>,
    ) -> Result<Vec<UpbitCandle>, FetchError> {
        let mut url = format!(
            "{}/v1/candles/minutes/1?market={}&count={}",
            self.base_url, market, count
        );
        if let Some(cursor) = to {
            url.push_str(&format!("&to={cursor}"));
        }

        let mut last_err = None;

        for attempt in 1..=RETRY_ATTEMPTS {
            match self.try_fetch_page(&url).await {
                Ok(batch) => {
                    debug!(market, count = batch.len(), attempt, "candle page fetched");
                    return Ok(batch);
                }
                Err(e) => {
                    warn!(
                        market,
                        attempt,
                        max_attempts = RETRY_ATTEMPTS,
                        error = %e,
                        "candle fetch attempt failed"
                    );
                    last_err = Some(e);
                    if attempt < RETRY_ATTEMPTS {
                        tokio::time::sleep(RETRY_BACKOFF).await;
                    }
                }
            }
        }

        Err(last_err.expect("retry loop runs at least once"))
    }

    async fn try_fetch_page(&self, url: &str) -> Result<Vec<UpbitCandle>, FetchError> {
        let resp = self.client.get(url).send().await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(FetchError::Status { status, body });
        }

        let batch: Vec<UpbitCandle> = resp.json().await?;
        Ok(batch)
    }

    /// Validate and convert a raw page. Invalid entries are dropped and
    /// counted; a non-empty page in which nothing validates is an error.
    fn convert_page(&self, market: &str, raw: Vec<UpbitCandle>) -> Result<Vec<Candle>, FetchError> {
        let total = raw.len();
        let candles: Vec<Candle> = raw.into_iter().filter_map(UpbitCandle::into_candle).collect();

        let dropped = total - candles.len();
        if dropped > 0 {
            self.dropped_invalid.fetch_add(dropped as u64, Ordering::Relaxed);
            warn!(market, dropped, total, "invalid candles filtered out");
        }

        if candles.is_empty() && total > 0 {
            return Err(FetchError::Malformed(format!(
                "all {total} candles in batch failed validation"
            )));
        }

        Ok(candles)
    }
}

#[async_trait]
impl CandleSource for UpbitClient {
    async fn fetch_recent(&self, market: &str, count: usize) -> Result<Vec<Candle>, FetchError> {
        let mut collected: Vec<Candle> = Vec::with_capacity(count);
        let mut cursor: Option<String> = None;

        while collected.len() < count {
            let page_size = (count - collected.len()).min(MAX_COUNT_PER_REQUEST);
            let raw = self.fetch_page(market, page_size, cursor.as_deref()).await?;

            if raw.is_empty() {
                break;
            }

            // Pages arrive newest-first; the last row anchors the next page.
            cursor = raw
                .last()
                .and_then(|c| c.candle_date_time_utc.clone());

            let exhausted = raw.len() < page_size || cursor.is_none();
            collected.extend(self.convert_page(market, raw)?);

            if exhausted {
                break;
            }
        }

        collected.truncate(count);
        debug!(market, count = collected.len(), "recent candles fetched");
        Ok(collected)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_candle(utc: &str, close: &str) -> UpbitCandle {
        serde_json::from_value(serde_json::json!({
            "market": "KRW-BTC",
            "candle_date_time_utc": utc,
            "candle_date_time_kst": "ignored",
            "opening_price": 95000000.0,
            "high_price": 95100000.0,
            "low_price": 94900000.0,
            "trade_price": close.parse::<f64>().unwrap(),
            "timestamp": 1700000000123i64,
            "candle_acc_trade_price": 1.0,
            "candle_acc_trade_volume": 2.0,
            "unit": 1
        }))
        .unwrap()
    }

    #[test]
    fn convert_page_filters_invalid_and_counts() {
        let client = UpbitClient::new("https://api.upbit.com");
        let mut bad = raw_candle("2023-01-01T00:01:00", "95000000");
        bad.trade_price = Some("-1".parse().unwrap());

        let page = vec![raw_candle("2023-01-01T00:02:00", "95000000"), bad];
        let candles = client.convert_page("KRW-BTC", page).unwrap();

        assert_eq!(candles.len(), 1);
        assert_eq!(client.dropped_invalid(), 1);
    }

    #[test]
    fn convert_page_rejects_fully_invalid_batch() {
        let client = UpbitClient::new("https://api.upbit.com");
        let mut bad = raw_candle("2023-01-01T00:01:00", "95000000");
        bad.opening_price = None;

        let result = client.convert_page("KRW-BTC", vec![bad]);
        assert!(matches!(result, Err(FetchError::Malformed(_))));
    }

    #[test]
    fn convert_page_accepts_empty_page() {
        let client = UpbitClient::new("https://api.upbit.com");
        assert!(client.convert_page("KRW-BTC", vec![]).unwrap().is_empty());
    }

    #[test]
    fn wire_parse_ignores_unknown_fields() {
        let raw = raw_candle("2023-01-01T00:01:00", "95000000");
        let candle = raw.into_candle().unwrap();
        assert_eq!(candle.market, "KRW-BTC");
        assert_eq!(candle.candle_time, 1_672_531_260);
        assert_eq!(candle.source_timestamp, 1_700_000_000_123);
    }
}
