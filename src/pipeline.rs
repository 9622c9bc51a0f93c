// =============================================================================
// Pipeline — bootstrap and scheduled candle refresh
// =============================================================================
//
// Two triggers, one data path. Bootstrap runs once at startup: a large
// history fetch into cache + store, degrading to synthetic data when upstream
// has nothing. The scheduled refresh fires every minute, aligned to the
// minute boundary: fetch the latest candle, merge it into the cache, persist
// it once, hand it to the broadcaster.
//
// Every stage returns a Result that is logged and absorbed here; no failure
// aborts the schedule or the process.
// =============================================================================

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use tracing::{info, warn};

use crate::app_state::AppState;
use crate::types::{Candle, CANDLE_BUCKET_SECS};
use crate::upbit::CandleSource;

pub struct Pipeline {
    state: Arc<AppState>,
    source: Arc<dyn CandleSource>,
}

impl Pipeline {
    pub fn new(state: Arc<AppState>, source: Arc<dyn CandleSource>) -> Self {
        Self { state, source }
    }

    // ── Bootstrap ───────────────────────────────────────────────────────

    /// One-time historical load. On any upstream failure or an empty/unusable
    /// result, the cache is seeded with synthetic candles instead so the
    /// system is never cold.
    pub async fn bootstrap(&self) {
        let market = self.state.config.default_market.clone();
        let count = self.state.config.bootstrap_count;
        info!(market = %market, count, "bootstrapping candle history");

        match self.source.fetch_recent(&market, count).await {
            Ok(candles) => {
                let fetched = candles.len();
                let valid: Vec<Candle> = candles.into_iter().filter(|c| c.is_valid()).collect();
                if valid.len() < fetched {
                    warn!(
                        market = %market,
                        dropped = fetched - valid.len(),
                        "invalid candles dropped during bootstrap"
                    );
                }

                if valid.is_empty() {
                    warn!(market = %market, "bootstrap fetch returned no usable candles, seeding synthetic data");
                    self.seed_synthetic(&market).await;
                } else {
                    self.state.cache.save(&market, &valid).await;

                    match self.state.store.save_batch(&valid) {
                        Ok(inserted) => {
                            info!(market = %market, fetched = valid.len(), inserted, "bootstrap history persisted");
                        }
                        Err(e) => {
                            warn!(market = %market, error = %e, "bootstrap persistence failed, cache remains authoritative");
                        }
                    }
                }
            }
            Err(e) => {
                warn!(market = %market, error = %e, "upstream unavailable during bootstrap, seeding synthetic data");
                self.seed_synthetic(&market).await;
            }
        }

        self.state.bootstrap_done.store(true, Ordering::Relaxed);
        info!(market = %market, "bootstrap complete");
    }

    async fn seed_synthetic(&self, market: &str) {
        let dummy = synthesize_candles(market, self.state.config.dummy_count);
        self.state.cache.save(market, &dummy).await;
        info!(market, count = dummy.len(), "synthetic candles seeded into cache");
    }

    // ── Scheduled refresh ───────────────────────────────────────────────

    /// One refresh cycle: latest candle → cache → store → broadcast. Each
    /// stage failure is logged and the rest of the cycle continues where it
    /// still makes sense; an upstream failure skips the cycle entirely.
    pub async fn refresh_once(&self) {
        let market = self.state.config.default_market.clone();

        let candle = match self.source.fetch_latest(&market).await {
            Ok(candle) => candle,
            Err(e) => {
                self.state.record_refresh(false);
                warn!(market = %market, error = %e, "upstream unavailable, refresh skipped");
                return;
            }
        };

        if !candle.is_valid() {
            self.state.record_refresh(false);
            warn!(market = %market, "invalid latest candle dropped, refresh skipped");
            return;
        }

        self.state.cache.add_one(&market, &candle).await;

        if let Err(e) = self.state.store.save_one(&candle) {
            warn!(market = %market, error = %e, "refresh persistence failed, continuing");
        }

        let delivered = self.state.broadcaster.publish(&market, &candle);
        self.state.record_refresh(true);
        info!(
            market = %market,
            candle_time = candle.candle_time,
            delivered,
            "scheduled refresh complete"
        );
    }

    /// Drive [`refresh_once`] forever, aligned to the minute boundary. A
    /// failed cycle never stops the schedule; the next tick still fires.
    pub async fn run_refresh_loop(self: Arc<Self>) {
        let now = Utc::now().timestamp();
        let delay = CANDLE_BUCKET_SECS - now.rem_euclid(CANDLE_BUCKET_SECS);
        tokio::time::sleep(Duration::from_secs(delay as u64)).await;

        let mut interval = tokio::time::interval(Duration::from_secs(CANDLE_BUCKET_SECS as u64));
        loop {
            interval.tick().await;
            self.refresh_once().await;
        }
    }
}

// =============================================================================
// Synthetic data
// =============================================================================

/// Base price for synthetic candles, on the KRW-BTC scale.
const SYNTHETIC_BASE_PRICE: i64 = 95_000_000;
/// Per-candle price variation envelope.
const SYNTHETIC_VOLATILITY: f64 = 0.02;

fn factor(f: f64) -> Decimal {
    Decimal::from_f64(f).unwrap_or(Decimal::ONE)
}

fn round_price(d: Decimal) -> Decimal {
    d.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
}

/// Generate `count` one-minute candles ending at the current minute, oldest
/// first. Shapes are randomized but every candle satisfies the OHLC
/// invariants: positive prices, `high >= max(open, close)`,
/// `low <= min(open, close)`.
pub fn synthesize_candles(market: &str, count: usize) -> Vec<Candle> {
    let mut rng = rand::thread_rng();
    let base = Decimal::from(SYNTHETIC_BASE_PRICE);
    let now_bucket = Utc::now().timestamp() / CANDLE_BUCKET_SECS * CANDLE_BUCKET_SECS;

    let mut candles = Vec::with_capacity(count);
    for i in (0..count as i64).rev() {
        let time = now_bucket - i * CANDLE_BUCKET_SECS;

        let open = round_price(base * factor(1.0 + (rng.gen::<f64>() - 0.5) * SYNTHETIC_VOLATILITY));
        let close =
            round_price(open * factor(1.0 + (rng.gen::<f64>() - 0.5) * SYNTHETIC_VOLATILITY * 0.5));

        let body_high = open.max(close);
        let body_low = open.min(close);
        let high = round_price(body_high * factor(1.0 + rng.gen::<f64>() * SYNTHETIC_VOLATILITY * 0.3))
            .max(body_high);
        let low = round_price(body_low * factor(1.0 - rng.gen::<f64>() * SYNTHETIC_VOLATILITY * 0.3))
            .min(body_low);

        candles.push(Candle {
            market: market.to_string(),
            candle_time: time,
            open,
            high,
            low,
            close,
            volume: None,
            source_timestamp: time * 1000,
        });
    }

    candles
}

// =============================================================================
// Tests
// =============================================================================
