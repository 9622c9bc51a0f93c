// =============================================================================
// CandleStore — durable candle persistence (SQLite)
// =============================================================================
//
// Append-only store keyed by (market, candle_time). Rows are written once the
// first time a candle is seen and never updated; duplicate writes are skipped
// via existence checks, so batch and single-row paths may overlap freely.
// Prices are stored as text to keep decimal precision exact.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::path::Path;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::types::Candle;

/// Bounds applied to every `query_recent` limit regardless of caller input.
const MIN_QUERY_LIMIT: usize = 10;
const MAX_QUERY_LIMIT: usize = 1000;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS chart_candles (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    market            TEXT    NOT NULL,
    candle_time       INTEGER NOT NULL,
    open_price        TEXT    NOT NULL,
    high_price        TEXT    NOT NULL,
    low_price         TEXT    NOT NULL,
    close_price       TEXT    NOT NULL,
    volume            TEXT,
    raw_utc_date_time TEXT,
    timestamp         INTEGER NOT NULL,
    created_at        TEXT    NOT NULL,
    UNIQUE (market, candle_time)
);
CREATE INDEX IF NOT EXISTS idx_chart_candles_market ON chart_candles (market);
CREATE INDEX IF NOT EXISTS idx_chart_candles_time ON chart_candles (candle_time);
CREATE INDEX IF NOT EXISTS idx_chart_candles_market_time ON chart_candles (market, candle_time);
";

// =============================================================================
// Errors & row types
// =============================================================================

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
}

/// A durable candle row as read back from the store.
#[derive(Debug, Clone, Serialize)]
pub struct PersistedCandle {
    pub id: i64,
    pub market: String,
    pub candle_time: i64,
    pub open_price: Decimal,
    pub high_price: Decimal,
    pub low_price: Decimal,
    pub close_price: Decimal,
    pub volume: Option<Decimal>,
    pub raw_utc_date_time: Option<String>,
    pub timestamp: i64,
    pub created_at: String,
}

/// Cheap aggregate over a market's persisted history, for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct StoreSummary {
    pub market: String,
    pub total_candles: i64,
    pub latest_candle_time: Option<i64>,
    pub latest_price: Option<Decimal>,
    pub has_data: bool,
}

impl StoreSummary {
    pub fn empty(market: &str) -> Self {
        Self {
            market: market.to_string(),
            total_candles: 0,
            latest_candle_time: None,
            latest_price: None,
            has_data: false,
        }
    }
}

// =============================================================================
// CandleStore
// =============================================================================

pub struct CandleStore {
    pool: Pool<SqliteConnectionManager>,
}

impl CandleStore {
    /// Open (or create) the store at `path` and ensure the schema exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let manager = SqliteConnectionManager::file(path.as_ref()).with_init(|conn| {
            conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")
        });
        let pool = Pool::builder().max_size(8).build(manager)?;

        pool.get()?.execute_batch(SCHEMA)?;
        Ok(Self { pool })
    }

    /// Persist every genuinely new candle in `candles` and return the number
    /// of rows inserted. The batch may span markets and arrive unordered.
    ///
    /// Existence is checked with one query per distinct market (all of that
    /// market's candle times in a single `IN` list), so the query count is
    /// bounded by the number of markets, not the batch size. A batch that is
    /// entirely duplicates is a no-op.
    pub fn save_batch(&self, candles: &[Candle]) -> Result<usize, StoreError> {
        let valid: Vec<&Candle> = candles.iter().filter(|c| c.is_valid()).collect();
        let dropped = candles.len() - valid.len();
        if dropped > 0 {
            warn!(dropped, "invalid candles skipped before persistence");
        }
        if valid.is_empty() {
            return Ok(0);
        }

        let mut by_market: HashMap<&str, Vec<&Candle>> = HashMap::new();
        for &candle in &valid {
            by_market.entry(candle.market.as_str()).or_default().push(candle);
        }

        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let mut inserted = 0usize;

        for (market, group) in by_market {
            let times: Vec<i64> = group.iter().map(|c| c.candle_time).collect();
            let existing = existing_times(&tx, market, &times)?;

            let mut seen = HashSet::new();
            for candle in group {
                if existing.contains(&candle.candle_time) || !seen.insert(candle.candle_time) {
                    continue;
                }
                inserted += insert_candle(&tx, candle)?;
            }
        }

        tx.commit()?;
        debug!(inserted, total = valid.len(), "candle batch persisted");
        Ok(inserted)
    }

    /// Idempotent single-row insert; the scheduled-refresh hot path. Returns
    /// whether a row was written.
    pub fn save_one(&self, candle: &Candle) -> Result<bool, StoreError> {
        if !candle.is_valid() {
            warn!(market = %candle.market, "invalid candle rejected by store");
            return Ok(false);
        }

        let conn = self.pool.get()?;
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM chart_candles WHERE market = ?1 AND candle_time = ?2)",
            params![candle.market, candle.candle_time],
            |row| row.get(0),
        )?;

        if exists {
            debug!(market = %candle.market, candle_time = candle.candle_time, "candle already persisted");
            return Ok(false);
        }

        insert_candle(&conn, candle)?;
        debug!(market = %candle.market, candle_time = candle.candle_time, "candle persisted");
        Ok(true)
    }

    /// Up to `limit` rows for `market`, newest first. `limit` is clamped to
    /// a sane range so callers cannot request unbounded responses.
    pub fn query_recent(&self, market: &str, limit: usize) -> Result<Vec<PersistedCandle>, StoreError> {
        let limit = limit.clamp(MIN_QUERY_LIMIT, MAX_QUERY_LIMIT);
        let conn = self.pool.get()?;

        let mut stmt = conn.prepare(
            "SELECT id, market, candle_time, open_price, high_price, low_price, close_price,
                    volume, raw_utc_date_time, timestamp, created_at
             FROM chart_candles
             WHERE market = ?1
             ORDER BY candle_time DESC
             LIMIT ?2",
        )?;

        let rows = stmt
            .query_map(params![market, limit as i64], row_to_candle)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Aggregate view of a market's history. Never fails: any internal error
    /// is logged and reported as "no data".
    pub fn summarize(&self, market: &str) -> StoreSummary {
        match self.try_summarize(market) {
            Ok(summary) => summary,
            Err(e) => {
                warn!(market, error = %e, "store summary failed, reporting empty");
                StoreSummary::empty(market)
            }
        }
    }

    fn try_summarize(&self, market: &str) -> Result<StoreSummary, StoreError> {
        let conn = self.pool.get()?;

        let total_candles: i64 = conn.query_row(
            "SELECT COUNT(*) FROM chart_candles WHERE market = ?1",
            params![market],
            |row| row.get(0),
        )?;

        let latest: Option<(i64, String)> = conn
            .query_row(
                "SELECT candle_time, close_price FROM chart_candles
                 WHERE market = ?1 ORDER BY candle_time DESC LIMIT 1",
                params![market],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let (latest_candle_time, latest_price) = match latest {
            Some((time, price)) => (Some(time), price.parse::<Decimal>().ok()),
            None => (None, None),
        };

        Ok(StoreSummary {
            market: market.to_string(),
            total_candles,
            latest_candle_time,
            latest_price,
            has_data: total_candles > 0,
        })
    }
}

// =============================================================================
// Row helpers
// =============================================================================

/// One `IN`-list query for all of a market's candidate times.
fn existing_times(
    conn: &Connection,
    market: &str,
    times: &[i64],
) -> Result<HashSet<i64>, StoreError> {
    if times.is_empty() {
        return Ok(HashSet::new());
    }

    let placeholders = vec!["?"; times.len()].join(",");
    let sql = format!(
        "SELECT candle_time FROM chart_candles WHERE market = ? AND candle_time IN ({placeholders})"
    );

    let mut values: Vec<Value> = Vec::with_capacity(times.len() + 1);
    values.push(Value::Text(market.to_string()));
    values.extend(times.iter().map(|t| Value::Integer(*t)));

    let mut stmt = conn.prepare(&sql)?;
    let found = stmt
        .query_map(params_from_iter(values), |row| row.get::<_, i64>(0))?
        .collect::<Result<HashSet<_>, _>>()?;
    Ok(found)
}

fn insert_candle(conn: &Connection, candle: &Candle) -> Result<usize, StoreError> {
    // OR IGNORE lets an overlapping writer that won the race pass silently.
    let changed = conn.execute(
        "INSERT OR IGNORE INTO chart_candles
            (market, candle_time, open_price, high_price, low_price, close_price,
             volume, raw_utc_date_time, timestamp, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            candle.market,
            candle.candle_time,
            candle.open.to_string(),
            candle.high.to_string(),
            candle.low.to_string(),
            candle.close.to_string(),
            candle.volume.map(|v| v.to_string()),
            candle.utc_date_time(),
            candle.source_timestamp,
            chrono::Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(changed)
}

fn row_to_candle(row: &rusqlite::Row<'_>) -> rusqlite::Result<PersistedCandle> {
    Ok(PersistedCandle {
        id: row.get(0)?,
        market: row.get(1)?,
        candle_time: row.get(2)?,
        open_price: parse_decimal(row, 3)?,
        high_price: parse_decimal(row, 4)?,
        low_price: parse_decimal(row, 5)?,
        close_price: parse_decimal(row, 6)?,
        volume: row
            .get::<_, Option<String>>(7)?
            .map(|v| parse_decimal_str(&v, 7))
            .transpose()?,
        raw_utc_date_time: row.get(8)?,
        timestamp: row.get(9)?,
        created_at: row.get(10)?,
    })
}

fn parse_decimal(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let text: String = row.get(idx)?;
    parse_decimal_str(&text, idx)
}

fn parse_decimal_str(text: &str, idx: usize) -> rusqlite::Result<Decimal> {
    text.parse::<Decimal>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(market: &str, time: i64, close: &str) -> Candle {
        let close: Decimal = close.parse().unwrap();
        Candle {
            market: market.into(),
            candle_time: time,
            open: close - Decimal::ONE,
            high: close + Decimal::ONE,
            low: close - Decimal::TWO,
            close,
            volume: Some("3.5".parse().unwrap()),
            source_timestamp: time * 1000,
        }
    }

    fn open_store() -> (tempfile::TempDir, CandleStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = CandleStore::open(dir.path().join("candles.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn save_batch_is_idempotent() {
        let (_dir, store) = open_store();
        let batch = vec![
            candle("KRW-BTC", 100, "95000000"),
            candle("KRW-BTC", 160, "95100000"),
            candle("KRW-BTC", 220, "95200000"),
        ];

        assert_eq!(store.save_batch(&batch).unwrap(), 3);
        // Re-running the identical batch inserts nothing and is not an error.
        assert_eq!(store.save_batch(&batch).unwrap(), 0);
        assert_eq!(store.summarize("KRW-BTC").total_candles, 3);
    }

    #[test]
    fn save_batch_inserts_only_absent_rows_across_markets() {
        let (_dir, store) = open_store();
        store.save_one(&candle("KRW-BTC", 100, "95000000")).unwrap();
        store.save_one(&candle("KRW-ETH", 100, "3000000")).unwrap();

        let batch = vec![
            candle("KRW-BTC", 100, "95000000"), // duplicate
            candle("KRW-BTC", 160, "95100000"),
            candle("KRW-ETH", 100, "3000000"), // duplicate
            candle("KRW-ETH", 160, "3100000"),
            candle("KRW-XRP", 100, "800"),
        ];

        assert_eq!(store.save_batch(&batch).unwrap(), 3);
        assert_eq!(store.summarize("KRW-BTC").total_candles, 2);
        assert_eq!(store.summarize("KRW-ETH").total_candles, 2);
        assert_eq!(store.summarize("KRW-XRP").total_candles, 1);
    }

    #[test]
    fn save_batch_skips_invalid_and_batch_internal_duplicates() {
        let (_dir, store) = open_store();
        let mut bad = candle("KRW-BTC", 160, "95100000");
        bad.close = Decimal::ZERO;

        let batch = vec![
            candle("KRW-BTC", 100, "95000000"),
            candle("KRW-BTC", 100, "95000001"), // same key within the batch
            bad,
            candle("KRW-BTC", 220, "95200000"),
        ];

        assert_eq!(store.save_batch(&batch).unwrap(), 2);
    }

    #[test]
    fn save_one_skips_existing_row() {
        let (_dir, store) = open_store();
        let c = candle("KRW-BTC", 100, "95000000");

        assert!(store.save_one(&c).unwrap());
        assert!(!store.save_one(&c).unwrap());
        assert_eq!(store.summarize("KRW-BTC").total_candles, 1);
    }

    #[test]
    fn persisted_rows_are_never_revised() {
        let (_dir, store) = open_store();
        store.save_one(&candle("KRW-BTC", 100, "95000000")).unwrap();

        // A revised candle for the same bucket is skipped, not updated.
        store.save_one(&candle("KRW-BTC", 100, "99999999")).unwrap();
        let rows = store.query_recent("KRW-BTC", 10).unwrap();
        assert_eq!(rows[0].close_price, "95000000".parse().unwrap());
    }

    #[test]
    fn query_recent_orders_descending_and_clamps_limit() {
        let (_dir, store) = open_store();
        let batch: Vec<Candle> = (1..=15i64).map(|i| candle("KRW-BTC", i * 60, "95000000")).collect();
        store.save_batch(&batch).unwrap();

        // Limit below the floor is raised to it.
        let rows = store.query_recent("KRW-BTC", 1).unwrap();
        assert_eq!(rows.len(), 10);
        assert!(rows.windows(2).all(|w| w[0].candle_time > w[1].candle_time));
        assert_eq!(rows[0].candle_time, 15 * 60);

        // Limit above the ceiling is accepted but clamped.
        let rows = store.query_recent("KRW-BTC", 50_000).unwrap();
        assert_eq!(rows.len(), 15);
    }

    #[test]
    fn summarize_reports_latest_row() {
        let (_dir, store) = open_store();
        assert!(!store.summarize("KRW-BTC").has_data);

        store.save_one(&candle("KRW-BTC", 100, "95000000")).unwrap();
        store.save_one(&candle("KRW-BTC", 160, "95100000")).unwrap();

        let summary = store.summarize("KRW-BTC");
        assert!(summary.has_data);
        assert_eq!(summary.total_candles, 2);
        assert_eq!(summary.latest_candle_time, Some(160));
        assert_eq!(summary.latest_price, Some("95100000".parse().unwrap()));
    }

    #[test]
    fn decimal_precision_survives_roundtrip() {
        let (_dir, store) = open_store();
        let mut c = candle("KRW-BTC", 100, "0.00000001");
        c.open = "0.00000002".parse().unwrap();
        c.high = "0.00000003".parse().unwrap();
        c.low = "0.00000001".parse().unwrap();
        store.save_one(&c).unwrap();

        let rows = store.query_recent("KRW-BTC", 10).unwrap();
        assert_eq!(rows[0].close_price, "0.00000001".parse().unwrap());
        assert_eq!(rows[0].high_price, "0.00000003".parse().unwrap());
    }
}
