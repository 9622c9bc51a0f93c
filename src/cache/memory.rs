// =============================================================================
// In-process fallback tier
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::cache::merge_and_limit;
use crate::types::Candle;

/// Process-local candle store used when the remote tier is unreachable.
/// Contents are lost on restart, which is acceptable for a pure fallback.
/// Each per-market entry is replaced atomically under the write lock, so
/// concurrent readers never observe a partially merged window.
pub struct MemoryTier {
    entries: RwLock<HashMap<String, Vec<Candle>>>,
    max_candles: usize,
}

impl MemoryTier {
    pub fn new(max_candles: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_candles,
        }
    }

    /// Merge `new_candles` into the market's window, enforcing the
    /// dedup-by-time and cap invariants.
    pub fn merge(&self, market: &str, new_candles: &[Candle]) {
        let mut map = self.entries.write();
        let entry = map.entry(market.to_string()).or_default();
        *entry = merge_and_limit(entry, new_candles, self.max_candles);
    }

    /// Current window for `market`, newest first. Empty when unknown.
    pub fn get(&self, market: &str) -> Vec<Candle> {
        self.entries.read().get(market).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tests::candle_at;

    #[test]
    fn unknown_market_is_empty() {
        let tier = MemoryTier::new(10);
        assert!(tier.get("KRW-BTC").is_empty());
    }

    #[test]
    fn merge_is_visible_to_get() {
        let tier = MemoryTier::new(10);
        tier.merge("KRW-BTC", &[candle_at(100, "1"), candle_at(160, "2")]);
        let window = tier.get("KRW-BTC");
        assert_eq!(window.len(), 2);
        assert_eq!(window[0].candle_time, 160);
    }

    #[test]
    fn markets_are_independent() {
        let tier = MemoryTier::new(10);
        tier.merge("KRW-BTC", &[candle_at(100, "1")]);
        tier.merge("KRW-ETH", &[candle_at(200, "2")]);
        assert_eq!(tier.get("KRW-BTC").len(), 1);
        assert_eq!(tier.get("KRW-ETH").len(), 1);
    }
}
