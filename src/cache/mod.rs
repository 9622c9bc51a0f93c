// =============================================================================
// CandleCache — two-tier per-market candle window
// =============================================================================
//
// Primary tier: shared Redis cache. Fallback tier: in-process map, used only
// when the remote tier fails. Callers never see a cache error: writes degrade
// to the fallback tier with a warning, reads return an empty window when
// neither tier has data.
//
// Both tiers hold at most `max_candles` candles per market, deduplicated by
// candle_time and sorted newest-first. The remote read-merge-write runs under
// a per-market async lock so concurrent saves cannot interleave.
// =============================================================================

pub mod memory;
pub mod remote;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::types::Candle;
use memory::MemoryTier;
use remote::RemoteTier;

/// Merge `incoming` into `existing`, replacing candles with the same
/// `candle_time` (upstream revises still-forming candles), then sort
/// newest-first and truncate to `cap`.
pub fn merge_and_limit(existing: &[Candle], incoming: &[Candle], cap: usize) -> Vec<Candle> {
    let mut by_time: HashMap<i64, &Candle> = HashMap::with_capacity(existing.len() + incoming.len());
    for candle in existing {
        by_time.insert(candle.candle_time, candle);
    }
    // Later writes win; an incoming candle replaces the cached one.
    for candle in incoming {
        by_time.insert(candle.candle_time, candle);
    }

    let mut merged: Vec<Candle> = by_time.into_values().cloned().collect();
    merged.sort_by(|a, b| b.candle_time.cmp(&a.candle_time));
    merged.truncate(cap);
    merged
}

/// Two-tier candle cache.
pub struct CandleCache {
    remote: Option<RemoteTier>,
    memory: MemoryTier,
    max_candles: usize,
    write_locks: parking_lot::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl CandleCache {
    pub fn new(remote: Option<RemoteTier>, max_candles: usize) -> Self {
        Self {
            remote,
            memory: MemoryTier::new(max_candles),
            max_candles,
            write_locks: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Cache with no remote tier; every operation hits the in-process store.
    pub fn memory_only(max_candles: usize) -> Self {
        Self::new(None, max_candles)
    }

    fn write_lock(&self, market: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.write_locks
            .lock()
            .entry(market.to_string())
            .or_default()
            .clone()
    }

    /// Merge `new_candles` into the market's window. Remote tier first; any
    /// remote failure falls back to the in-process tier. Never fails.
    pub async fn save(&self, market: &str, new_candles: &[Candle]) {
        if new_candles.is_empty() {
            warn!(market, "empty candle batch ignored");
            return;
        }

        let lock = self.write_lock(market);
        let _guard = lock.lock().await;

        let Some(remote) = &self.remote else {
            self.memory.merge(market, new_candles);
            return;
        };

        match remote.get(market).await {
            Ok(existing) => {
                let merged = merge_and_limit(&existing, new_candles, self.max_candles);
                match remote.put(market, &merged).await {
                    Ok(()) => {
                        debug!(market, count = merged.len(), "candles saved to remote cache");
                    }
                    Err(e) => {
                        warn!(market, error = %e, "remote cache write failed, using in-process tier");
                        self.memory.merge(market, new_candles);
                    }
                }
            }
            Err(e) => {
                warn!(market, error = %e, "remote cache read failed, using in-process tier");
                self.memory.merge(market, new_candles);
            }
        }
    }

    /// Merge a single candle. Invalid candles are rejected before touching
    /// either tier.
    pub async fn add_one(&self, market: &str, candle: &Candle) {
        if !candle.is_valid() {
            warn!(market, "invalid candle rejected by cache");
            return;
        }
        self.save(market, std::slice::from_ref(candle)).await;
    }

    /// Read the market's window, newest first. Falls back to the in-process
    /// tier when the remote tier fails or holds nothing. Never fails; an
    /// unknown market yields an empty window so chart display degrades to
    /// "no data" rather than an error.
    pub async fn get(&self, market: &str) -> Vec<Candle> {
        if let Some(remote) = &self.remote {
            match remote.get(market).await {
                Ok(candles) if !candles.is_empty() => {
                    debug!(market, count = candles.len(), "candles read from remote cache");
                    return candles;
                }
                Ok(_) => debug!(market, "remote cache empty, consulting in-process tier"),
                Err(e) => {
                    warn!(market, error = %e, "remote cache read failed, consulting in-process tier");
                }
            }
        }

        self.memory.get(market)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rust_decimal::Decimal;

    pub(crate) fn candle_at(time: i64, close: &str) -> Candle {
        let close: Decimal = close.parse().unwrap();
        Candle {
            market: "KRW-BTC".into(),
            candle_time: time,
            open: close,
            high: close + Decimal::ONE,
            low: close - Decimal::new(5, 1),
            close,
            volume: Some(Decimal::ONE),
            source_timestamp: time * 1000,
        }
    }

    #[test]
    fn merge_dedups_by_time_and_latest_write_wins() {
        let existing = vec![candle_at(100, "10"), candle_at(160, "11")];
        let incoming = vec![candle_at(160, "99"), candle_at(220, "12")];

        let merged = merge_and_limit(&existing, &incoming, 100);

        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].candle_time, 220);
        assert_eq!(merged[1].candle_time, 160);
        assert_eq!(merged[1].close, "99".parse().unwrap());
        assert_eq!(merged[2].candle_time, 100);
    }

    #[test]
    fn merge_enforces_cap_keeping_newest() {
        let existing: Vec<Candle> = (0..8i64).map(|i| candle_at(i * 60, "10")).collect();
        let incoming = vec![candle_at(9_000, "20")];

        let merged = merge_and_limit(&existing, &incoming, 5);

        let times: Vec<i64> = merged.iter().map(|c| c.candle_time).collect();
        // Oldest beyond the cap are dropped.
        assert_eq!(times, vec![9_000, 420, 360, 300, 240]);
    }

    #[tokio::test]
    async fn repeated_saves_keep_at_most_one_candle_per_time() {
        let cache = CandleCache::memory_only(100);
        for _ in 0..3 {
            cache
                .save("KRW-BTC", &[candle_at(100, "10"), candle_at(160, "11")])
                .await;
        }
        cache.save("KRW-BTC", &[candle_at(160, "42")]).await;

        let window = cache.get("KRW-BTC").await;
        assert_eq!(window.len(), 2);
        assert_eq!(window[0].candle_time, 160);
        assert_eq!(window[0].close, "42".parse().unwrap());
    }

    #[tokio::test]
    async fn window_is_sorted_descending_and_capped() {
        let cache = CandleCache::memory_only(100);
        let batch: Vec<Candle> = (0..150i64).map(|i| candle_at((i + 1) * 60, "10")).collect();
        cache.save("KRW-BTC", &batch).await;

        let window = cache.get("KRW-BTC").await;
        assert_eq!(window.len(), 100);
        assert!(window.windows(2).all(|w| w[0].candle_time > w[1].candle_time));
        assert_eq!(window[0].candle_time, 150 * 60);
    }

    #[tokio::test]
    async fn add_one_rejects_invalid_candle() {
        let cache = CandleCache::memory_only(100);
        let mut bad = candle_at(100, "10");
        bad.close = Decimal::ZERO;

        cache.add_one("KRW-BTC", &bad).await;
        assert!(cache.get("KRW-BTC").await.is_empty());
    }

    #[tokio::test]
    async fn unknown_market_reads_empty_not_error() {
        let cache = CandleCache::memory_only(100);
        assert!(cache.get("KRW-XRP").await.is_empty());
    }

    #[tokio::test]
    async fn unreachable_remote_degrades_to_memory_tier() {
        let remote = RemoteTier::new("redis://127.0.0.1:1/", 60).unwrap();
        let cache = CandleCache::new(Some(remote), 100);

        cache.save("KRW-BTC", &[candle_at(100, "10")]).await;
        let window = cache.get("KRW-BTC").await;

        assert_eq!(window.len(), 1);
        assert_eq!(window[0].candle_time, 100);
    }
}
