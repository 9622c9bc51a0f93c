// =============================================================================
// Application configuration
// =============================================================================
//
// All tunables live here. Every field carries `#[serde(default)]` so that a
// config file written by an older build still deserialises. Environment
// variables override the file in main.rs.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_market() -> String {
    "KRW-BTC".to_string()
}

fn default_upbit_api_url() -> String {
    "https://api.upbit.com".to_string()
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_db_path() -> String {
    "chartflow.db".to_string()
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_bootstrap_count() -> usize {
    1000
}

fn default_dummy_count() -> usize {
    500
}

fn default_max_candles() -> usize {
    100
}

fn default_cache_ttl_secs() -> u64 {
    30 * 60
}

// =============================================================================
// AppConfig
// =============================================================================

/// Top-level configuration for the Chartflow backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Master switch for the ingestion pipeline. When off, neither bootstrap
    /// nor the scheduled refresh runs and the service only serves whatever
    /// the stores already hold.
    #[serde(default = "default_true")]
    pub ingest_enabled: bool,

    /// Market refreshed by the scheduled task and used when callers supply
    /// none.
    #[serde(default = "default_market")]
    pub default_market: String,

    /// Base URL of the Upbit REST API.
    #[serde(default = "default_upbit_api_url")]
    pub upbit_api_url: String,

    /// Redis connection URL for the primary cache tier. An empty string
    /// disables the remote tier entirely; the in-process tier then serves
    /// every read and write.
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Path of the SQLite database file backing the persistence store.
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Address the HTTP/WebSocket server binds to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Number of historical candles requested at startup.
    #[serde(default = "default_bootstrap_count")]
    pub bootstrap_count: usize,

    /// Number of synthetic candles seeded when both upstream and cache are
    /// empty.
    #[serde(default = "default_dummy_count")]
    pub dummy_count: usize,

    /// Per-market cap on the cached candle window.
    #[serde(default = "default_max_candles")]
    pub max_candles: usize,

    /// TTL applied to every remote cache write, in seconds.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            ingest_enabled: true,
            default_market: default_market(),
            upbit_api_url: default_upbit_api_url(),
            redis_url: default_redis_url(),
            db_path: default_db_path(),
            bind_addr: default_bind_addr(),
            bootstrap_count: default_bootstrap_count(),
            dummy_count: default_dummy_count(),
            max_candles: default_max_candles(),
            cache_ttl_secs: default_cache_ttl_secs(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// Returns an error when the file is missing or malformed so the caller
    /// can fall back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        info!(
            path = %path.display(),
            market = %config.default_market,
            ingest_enabled = config.ingest_enabled,
            "config loaded"
        );

        Ok(config)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = AppConfig::default();
        assert!(cfg.ingest_enabled);
        assert_eq!(cfg.default_market, "KRW-BTC");
        assert_eq!(cfg.bootstrap_count, 1000);
        assert_eq!(cfg.dummy_count, 500);
        assert_eq!(cfg.max_candles, 100);
        assert_eq!(cfg.cache_ttl_secs, 1800);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: AppConfig = serde_json::from_str("{}").unwrap();
        assert!(cfg.ingest_enabled);
        assert_eq!(cfg.default_market, "KRW-BTC");
        assert_eq!(cfg.db_path, "chartflow.db");
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "default_market": "KRW-ETH", "ingest_enabled": false }"#;
        let cfg: AppConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.default_market, "KRW-ETH");
        assert!(!cfg.ingest_enabled);
        assert_eq!(cfg.max_candles, 100);
    }
}
