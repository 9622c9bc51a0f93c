// =============================================================================
// Broadcaster — per-market fan-out of realtime candle updates
// =============================================================================
//
// One broadcast channel per market, created lazily on first publish or
// subscribe. Delivery is best-effort: a slow or disconnected subscriber lags
// or drops on its own receiver without affecting other subscribers or the
// refresh pipeline. Within a market, updates go out in publish order.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::debug;

use crate::types::{Candle, RealtimeUpdate};

/// Buffered updates per subscriber before it starts lagging.
const CHANNEL_CAPACITY: usize = 64;

pub struct Broadcaster {
    channels: RwLock<HashMap<String, broadcast::Sender<RealtimeUpdate>>>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
        }
    }

    fn sender(&self, market: &str) -> broadcast::Sender<RealtimeUpdate> {
        if let Some(tx) = self.channels.read().get(market) {
            return tx.clone();
        }
        self.channels
            .write()
            .entry(market.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Push the latest candle to every current subscriber of `market`.
    /// Returns the number of subscribers the update was handed to; zero when
    /// nobody is listening, which is not an error.
    pub fn publish(&self, market: &str, candle: &Candle) -> usize {
        let update = RealtimeUpdate::candle_update(market, candle);
        let delivered = self.sender(market).send(update).unwrap_or(0);
        debug!(market, delivered, candle_time = candle.candle_time, "candle update published");
        delivered
    }

    /// Open a subscription on `market`'s channel.
    pub fn subscribe(&self, market: &str) -> broadcast::Receiver<RealtimeUpdate> {
        self.sender(market).subscribe()
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tests::candle_at;

    #[tokio::test]
    async fn publish_without_subscribers_is_a_noop() {
        let broadcaster = Broadcaster::new();
        assert_eq!(broadcaster.publish("KRW-BTC", &candle_at(100, "10")), 0);
    }

    #[tokio::test]
    async fn subscriber_receives_published_update() {
        let broadcaster = Broadcaster::new();
        let mut rx = broadcaster.subscribe("KRW-BTC");

        assert_eq!(broadcaster.publish("KRW-BTC", &candle_at(100, "10")), 1);

        let update = rx.recv().await.unwrap();
        assert_eq!(update.market, "KRW-BTC");
        assert_eq!(update.time, 100);
        assert_eq!(update.kind, "candle");
        assert_eq!(update.candle_data.close, "10".parse().unwrap());
    }

    #[tokio::test]
    async fn markets_have_independent_channels() {
        let broadcaster = Broadcaster::new();
        let mut btc = broadcaster.subscribe("KRW-BTC");
        let mut eth = broadcaster.subscribe("KRW-ETH");

        broadcaster.publish("KRW-BTC", &candle_at(100, "10"));

        assert_eq!(btc.recv().await.unwrap().market, "KRW-BTC");
        assert!(matches!(
            eth.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn dropped_subscriber_does_not_affect_others() {
        let broadcaster = Broadcaster::new();
        let gone = broadcaster.subscribe("KRW-BTC");
        let mut alive = broadcaster.subscribe("KRW-BTC");
        drop(gone);

        broadcaster.publish("KRW-BTC", &candle_at(160, "11"));
        assert_eq!(alive.recv().await.unwrap().time, 160);
    }

    #[tokio::test]
    async fn updates_arrive_in_publish_order() {
        let broadcaster = Broadcaster::new();
        let mut rx = broadcaster.subscribe("KRW-BTC");

        broadcaster.publish("KRW-BTC", &candle_at(100, "10"));
        broadcaster.publish("KRW-BTC", &candle_at(160, "11"));

        assert_eq!(rx.recv().await.unwrap().time, 100);
        assert_eq!(rx.recv().await.unwrap().time, 160);
    }
}
