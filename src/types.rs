// =============================================================================
// Shared types used across the Chartflow pipeline
// =============================================================================

use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Candle bucket width in seconds (Upbit 1-minute candles).
pub const CANDLE_BUCKET_SECS: i64 = 60;

/// One OHLC summary for a fixed time bucket of a market.
///
/// `candle_time` is the bucket start in epoch seconds and, together with
/// `market`, uniquely identifies a candle everywhere in the pipeline.
/// `source_timestamp` is the original capture instant in milliseconds and is
/// carried for audit only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub market: String,
    pub candle_time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    #[serde(default)]
    pub volume: Option<Decimal>,
    pub source_timestamp: i64,
}

impl Candle {
    /// A candle is usable only when its market is set, its bucket time is
    /// known, and every price is strictly positive. Invalid candles are
    /// dropped at the point of ingestion and never reach cache or store.
    pub fn is_valid(&self) -> bool {
        !self.market.trim().is_empty()
            && self.candle_time > 0
            && self.open > Decimal::ZERO
            && self.high > Decimal::ZERO
            && self.low > Decimal::ZERO
            && self.close > Decimal::ZERO
    }

    /// Bucket time formatted as the exchange's UTC date-time string
    /// (`2023-01-01T00:00:00`). Stored alongside the row for audit.
    pub fn utc_date_time(&self) -> String {
        chrono::DateTime::from_timestamp(self.candle_time, 0)
            .map(|dt| dt.naive_utc().format("%Y-%m-%dT%H:%M:%S").to_string())
            .unwrap_or_default()
    }
}

// =============================================================================
// Upstream wire format (Upbit minute-candle REST response)
// =============================================================================

/// Raw candle object as returned by `GET /v1/candles/minutes/1`. Unknown
/// fields are ignored; every field is optional so one malformed entry never
/// fails the whole batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpbitCandle {
    #[serde(default)]
    pub market: Option<String>,
    #[serde(default)]
    pub candle_date_time_utc: Option<String>,
    #[serde(default)]
    pub candle_date_time_kst: Option<String>,
    #[serde(default)]
    pub opening_price: Option<Decimal>,
    #[serde(default)]
    pub high_price: Option<Decimal>,
    #[serde(default)]
    pub low_price: Option<Decimal>,
    #[serde(default)]
    pub trade_price: Option<Decimal>,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub candle_acc_trade_price: Option<Decimal>,
    #[serde(default)]
    pub candle_acc_trade_volume: Option<Decimal>,
}

impl UpbitCandle {
    /// Bucket time in epoch seconds. Prefers the UTC bucket string; falls
    /// back to the capture timestamp truncated to the bucket width.
    pub fn bucket_time(&self) -> Option<i64> {
        if let Some(utc) = self.candle_date_time_utc.as_deref() {
            if let Ok(dt) = utc.parse::<NaiveDateTime>() {
                return Some(dt.and_utc().timestamp());
            }
        }
        self.timestamp
            .map(|ms| ms / 1000 / CANDLE_BUCKET_SECS * CANDLE_BUCKET_SECS)
    }

    /// Convert into the domain [`Candle`], or `None` when any required field
    /// is missing or fails validation.
    pub fn into_candle(self) -> Option<Candle> {
        let candle_time = self.bucket_time()?;
        let candle = Candle {
            market: self.market?,
            candle_time,
            open: self.opening_price?,
            high: self.high_price?,
            low: self.low_price?,
            close: self.trade_price?,
            volume: self.candle_acc_trade_volume,
            source_timestamp: self.timestamp.unwrap_or(candle_time * 1000),
        };
        candle.is_valid().then_some(candle)
    }
}

// =============================================================================
// Broadcast / chart payloads
// =============================================================================

/// Candle in the shape the chart frontend consumes, ordered by `time`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LightweightCandle {
    pub time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
}

impl From<&Candle> for LightweightCandle {
    fn from(c: &Candle) -> Self {
        Self {
            time: c.candle_time,
            open: c.open,
            high: c.high,
            low: c.low,
            close: c.close,
        }
    }
}

/// Realtime update pushed to a market's subscribers after each refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeUpdate {
    pub market: String,
    pub time: i64,
    pub price: Decimal,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "candleData")]
    pub candle_data: LightweightCandle,
}

impl RealtimeUpdate {
    pub fn candle_update(market: &str, candle: &Candle) -> Self {
        Self {
            market: market.to_string(),
            time: candle.candle_time,
            price: candle.close,
            kind: "candle".to_string(),
            candle_data: LightweightCandle::from(candle),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
