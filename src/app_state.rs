// =============================================================================
// Central application state
// =============================================================================
//
// Ties the cache, store and broadcaster together behind one Arc shared by the
// ingestion pipeline and the API layer. Counters are atomics so any task can
// report progress lock-free.
// =============================================================================

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::broadcast::Broadcaster;
use crate::cache::remote::RemoteTier;
use crate::cache::CandleCache;
use crate::config::AppConfig;
use crate::store::CandleStore;

pub struct AppState {
    pub config: AppConfig,

    pub cache: Arc<CandleCache>,
    pub store: Arc<CandleStore>,
    pub broadcaster: Arc<Broadcaster>,

    // ── Pipeline progress ───────────────────────────────────────────────
    pub bootstrap_done: AtomicBool,
    pub refresh_ok: AtomicU64,
    pub refresh_failed: AtomicU64,

    pub start_time: std::time::Instant,
}

impl AppState {
    /// Construct the shared state from configuration: opens the persistence
    /// store and wires the cache tiers. An empty `redis_url` runs the cache
    /// in-process only.
    pub fn new(config: AppConfig) -> Result<Self> {
        let remote = if config.redis_url.is_empty() {
            info!("remote cache tier disabled, in-process tier only");
            None
        } else {
            let tier = RemoteTier::new(&config.redis_url, config.cache_ttl_secs)
                .with_context(|| format!("invalid redis url {}", config.redis_url))?;
            Some(tier)
        };

        let store = CandleStore::open(&config.db_path)
            .with_context(|| format!("failed to open candle store at {}", config.db_path))?;

        Ok(Self {
            cache: Arc::new(CandleCache::new(remote, config.max_candles)),
            store: Arc::new(store),
            broadcaster: Arc::new(Broadcaster::new()),
            bootstrap_done: AtomicBool::new(false),
            refresh_ok: AtomicU64::new(0),
            refresh_failed: AtomicU64::new(0),
            start_time: std::time::Instant::now(),
            config,
        })
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn record_refresh(&self, ok: bool) {
        if ok {
            self.refresh_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.refresh_failed.fetch_add(1, Ordering::Relaxed);
        }
    }
}
