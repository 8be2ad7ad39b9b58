// =============================================================================
// Relational store — users, pairs, subscriptions, signal history, candles
// =============================================================================
//
// SQLite via sqlx. The schema mirrors the persisted-state layout the rest of
// the pipeline reads: the fan-out join over users/user_pairs/pairs, the
// append-only signal history with per-signal timing metrics, and the candle
// archive with its (pair_id, timeframe, open_time) index.
//
// `user_pairs.timeframes` holds a JSON array of timeframe strings; the
// fan-out query matches with a quoted LIKE pattern so lookups stay on a
// single round trip.
// =============================================================================

use std::str::FromStr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::TryStreamExt;
use rust_decimal::prelude::ToPrimitive;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::{info, warn};

use crate::market_data::candle::Candle;
use crate::notify::queue::DeliveryLog;
use crate::types::Signal;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id                      INTEGER PRIMARY KEY,
    username                TEXT,
    notifications_enabled   INTEGER NOT NULL DEFAULT 1,
    is_active               INTEGER NOT NULL DEFAULT 1,
    is_blocked              INTEGER NOT NULL DEFAULT 0,
    real_time_enabled       INTEGER NOT NULL DEFAULT 0,
    total_signals_received  INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS pairs (
    id                   INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol               TEXT NOT NULL UNIQUE,
    base_asset           TEXT NOT NULL,
    quote_asset          TEXT NOT NULL,
    is_active            INTEGER NOT NULL DEFAULT 1,
    real_time_monitoring INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS user_pairs (
    user_id          INTEGER NOT NULL REFERENCES users(id),
    pair_id          INTEGER NOT NULL REFERENCES pairs(id),
    timeframes       TEXT NOT NULL DEFAULT '[]',
    real_time_active INTEGER NOT NULL DEFAULT 0,
    last_signal_time TEXT,
    PRIMARY KEY (user_id, pair_id)
);

CREATE TABLE IF NOT EXISTS signal_history (
    id                 INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id            INTEGER NOT NULL REFERENCES users(id),
    pair_id            INTEGER NOT NULL REFERENCES pairs(id),
    timeframe          TEXT NOT NULL,
    signal_type        TEXT NOT NULL,
    signal_value       REAL,
    price              REAL,
    sent_at            TEXT NOT NULL,
    processing_time_ms INTEGER,
    delivery_time_ms   INTEGER
);

CREATE TABLE IF NOT EXISTS candles (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    pair_id    INTEGER NOT NULL REFERENCES pairs(id),
    timeframe  TEXT NOT NULL,
    open_time  INTEGER NOT NULL,
    close_time INTEGER NOT NULL,
    open       REAL NOT NULL,
    high       REAL NOT NULL,
    low        REAL NOT NULL,
    close      REAL NOT NULL,
    volume     REAL NOT NULL,
    is_closed  INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS ix_candles_pair_tf_open
    ON candles (pair_id, timeframe, open_time);
"#;

/// Split a symbol like `BTCUSDT` into (base, quote). Quote assets on the
/// supported exchange are four characters.
fn split_symbol(symbol: &str) -> (String, String) {
    if symbol.len() > 4 {
        let (base, quote) = symbol.split_at(symbol.len() - 4);
        (base.to_string(), quote.to_string())
    } else {
        (symbol.to_string(), String::new())
    }
}

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if missing) and migrate the database at `url`.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("invalid database url: {url}"))?
            .create_if_missing(true);

        // In-memory databases exist per connection; a single connection keeps
        // the schema visible everywhere.
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open database at {url}"))?;

        sqlx::raw_sql(SCHEMA)
            .execute(&pool)
            .await
            .context("failed to run schema migration")?;

        info!(url, "database ready");
        Ok(Self { pool })
    }

    // -------------------------------------------------------------------------
    // Users
    // -------------------------------------------------------------------------

    pub async fn upsert_user(&self, user_id: i64, username: Option<&str>) -> Result<()> {
        sqlx::query(
            "INSERT INTO users (id, username) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET username = excluded.username",
        )
        .bind(user_id)
        .bind(username)
        .execute(&self.pool)
        .await
        .context("failed to upsert user")?;
        Ok(())
    }

    pub async fn set_notifications_enabled(&self, user_id: i64, enabled: bool) -> Result<()> {
        sqlx::query("UPDATE users SET notifications_enabled = ?2 WHERE id = ?1")
            .bind(user_id)
            .bind(enabled)
            .execute(&self.pool)
            .await
            .context("failed to update notifications flag")?;
        Ok(())
    }

    /// Terminal delivery failure: the user never receives anything again.
    pub async fn mark_user_blocked(&self, user_id: i64) -> Result<()> {
        sqlx::query("UPDATE users SET is_blocked = 1, is_active = 0 WHERE id = ?1")
            .bind(user_id)
            .execute(&self.pool)
            .await
            .context("failed to mark user blocked")?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Pairs & subscriptions
    // -------------------------------------------------------------------------

    /// Insert the pair if unknown and return its id.
    pub async fn upsert_pair(&self, symbol: &str) -> Result<i64> {
        let (base, quote) = split_symbol(symbol);
        sqlx::query(
            "INSERT INTO pairs (symbol, base_asset, quote_asset) VALUES (?1, ?2, ?3)
             ON CONFLICT(symbol) DO NOTHING",
        )
        .bind(symbol)
        .bind(&base)
        .bind(&quote)
        .execute(&self.pool)
        .await
        .context("failed to upsert pair")?;

        let row = sqlx::query("SELECT id FROM pairs WHERE symbol = ?1")
            .bind(symbol)
            .fetch_one(&self.pool)
            .await
            .context("pair vanished after upsert")?;
        Ok(row.get::<i64, _>("id"))
    }

    /// Subscribe `user_id` to `symbol` for the given timeframes (stored as a
    /// JSON array). Replaces any previous timeframe set for the pair.
    pub async fn add_subscription(
        &self,
        user_id: i64,
        symbol: &str,
        timeframes: &[&str],
        real_time: bool,
    ) -> Result<()> {
        let pair_id = self.upsert_pair(symbol).await?;
        let timeframes_json =
            serde_json::to_string(timeframes).context("failed to encode timeframes")?;
        sqlx::query(
            "INSERT INTO user_pairs (user_id, pair_id, timeframes, real_time_active)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id, pair_id) DO UPDATE
             SET timeframes = excluded.timeframes,
                 real_time_active = excluded.real_time_active",
        )
        .bind(user_id)
        .bind(pair_id)
        .bind(&timeframes_json)
        .bind(real_time)
        .execute(&self.pool)
        .await
        .context("failed to add subscription")?;
        Ok(())
    }

    /// Symbols with at least one real-time-opted-in subscriber, for the
    /// stream refresh task. A pair whose subscriptions all have
    /// `real_time_active = 0` gets no WebSocket coverage.
    pub async fn active_symbols(&self) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT DISTINCT p.symbol FROM pairs p
             JOIN user_pairs up ON up.pair_id = p.id
             WHERE p.is_active = 1
               AND up.real_time_active = 1",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to list active symbols")?;
        Ok(rows.iter().map(|r| r.get::<String, _>("symbol")).collect())
    }

    /// Users to notify for a (symbol, timeframe): active subscription to the
    /// pair covering the timeframe, notifications on, account active and not
    /// blocked. The cursor streams rows so callers can overlap work with the
    /// fetch.
    pub async fn users_for(&self, symbol: &str, timeframe: &str) -> Result<Vec<i64>> {
        let pattern = format!("%\"{timeframe}\"%");
        let mut rows = sqlx::query_scalar::<_, i64>(
            "SELECT u.id FROM users u
             JOIN user_pairs up ON up.user_id = u.id
             JOIN pairs p ON p.id = up.pair_id
             WHERE p.symbol = ?1
               AND p.is_active = 1
               AND u.notifications_enabled = 1
               AND u.is_active = 1
               AND u.is_blocked = 0
               AND up.timeframes LIKE ?2
             ORDER BY u.id",
        )
        .bind(symbol)
        .bind(&pattern)
        .fetch(&self.pool);

        let mut users = Vec::new();
        while let Some(user_id) = rows.try_next().await.context("fan-out query failed")? {
            users.push(user_id);
        }
        Ok(users)
    }

    // -------------------------------------------------------------------------
    // Signal history
    // -------------------------------------------------------------------------

    /// Append a delivery record and return its row id for the later
    /// delivery-time update.
    pub async fn insert_signal(&self, user_id: i64, signal: &Signal) -> Result<i64> {
        let pair_id = self.upsert_pair(&signal.symbol).await?;
        let result = sqlx::query(
            "INSERT INTO signal_history
               (user_id, pair_id, timeframe, signal_type, signal_value, price,
                sent_at, processing_time_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(user_id)
        .bind(pair_id)
        .bind(&signal.timeframe)
        .bind(signal.kind.as_str())
        .bind(signal.trigger_value)
        .bind(signal.price)
        .bind(Utc::now())
        .bind(signal.processing_ms as i64)
        .execute(&self.pool)
        .await
        .context("failed to insert signal history")?;

        sqlx::query(
            "UPDATE users SET total_signals_received = total_signals_received + 1
             WHERE id = ?1",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await
        .context("failed to bump user signal count")?;

        Ok(result.last_insert_rowid())
    }

    pub async fn set_delivery_time(&self, history_id: i64, delivery_ms: u64) -> Result<()> {
        sqlx::query("UPDATE signal_history SET delivery_time_ms = ?2 WHERE id = ?1")
            .bind(history_id)
            .bind(delivery_ms as i64)
            .execute(&self.pool)
            .await
            .context("failed to record delivery time")?;
        Ok(())
    }

    pub async fn signal_count(&self, user_id: i64) -> Result<i64> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM signal_history WHERE user_id = ?1")
                .bind(user_id)
                .fetch_one(&self.pool)
                .await
                .context("failed to count signals")?;
        Ok(count)
    }

    // -------------------------------------------------------------------------
    // Candle archive
    // -------------------------------------------------------------------------

    /// Batch-insert closed candles inside one transaction.
    pub async fn insert_candles(&self, candles: &[Candle]) -> Result<usize> {
        if candles.is_empty() {
            return Ok(0);
        }
        let pair_id = self.upsert_pair(&candles[0].symbol).await?;

        let mut tx = self.pool.begin().await.context("failed to open transaction")?;
        for candle in candles {
            sqlx::query(
                "INSERT INTO candles
                   (pair_id, timeframe, open_time, close_time,
                    open, high, low, close, volume, is_closed)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )
            .bind(pair_id)
            .bind(&candle.timeframe)
            .bind(candle.open_time)
            .bind(candle.close_time)
            .bind(candle.open.to_f64().unwrap_or(0.0))
            .bind(candle.high.to_f64().unwrap_or(0.0))
            .bind(candle.low.to_f64().unwrap_or(0.0))
            .bind(candle.close.to_f64().unwrap_or(0.0))
            .bind(candle.volume.to_f64().unwrap_or(0.0))
            .bind(candle.is_closed)
            .execute(&mut *tx)
            .await
            .context("failed to insert candle")?;
        }
        tx.commit().await.context("failed to commit candle batch")?;
        Ok(candles.len())
    }
}

#[async_trait]
impl DeliveryLog for Database {
    async fn delivered(&self, history_id: Option<i64>, delivery_ms: u64) {
        if let Some(id) = history_id {
            if let Err(e) = self.set_delivery_time(id, delivery_ms).await {
                warn!(history_id = id, error = %e, "failed to persist delivery time");
            }
        }
    }

    async fn user_blocked(&self, user_id: i64) {
        if let Err(e) = self.mark_user_blocked(user_id).await {
            warn!(user_id, error = %e, "failed to mark user blocked");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SignalKind;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    async fn db() -> Database {
        Database::connect("sqlite::memory:").await.unwrap()
    }

    fn signal() -> Signal {
        Signal {
            id: Uuid::new_v4(),
            symbol: "BTCUSDT".into(),
            timeframe: "1m".into(),
            kind: SignalKind::RsiOversoldEntry,
            trigger_value: 28.5,
            price: 37000.0,
            produced_at: Utc::now(),
            processing_ms: 3,
            volume_change_pct: None,
        }
    }

    #[test]
    fn symbol_split() {
        assert_eq!(split_symbol("BTCUSDT"), ("BTC".into(), "USDT".into()));
        assert_eq!(split_symbol("ETHUSDT"), ("ETH".into(), "USDT".into()));
    }

    #[tokio::test]
    async fn fanout_join_filters_correctly() {
        let db = db().await;
        for user in [1, 2, 3, 4] {
            db.upsert_user(user, None).await.unwrap();
        }
        db.add_subscription(1, "BTCUSDT", &["1m", "5m"], true).await.unwrap();
        db.add_subscription(2, "BTCUSDT", &["5m"], false).await.unwrap();
        db.add_subscription(3, "BTCUSDT", &["1m"], true).await.unwrap();
        db.add_subscription(4, "ETHUSDT", &["1m"], true).await.unwrap();

        // User 3 turned notifications off.
        db.set_notifications_enabled(3, false).await.unwrap();

        let users = db.users_for("BTCUSDT", "1m").await.unwrap();
        assert_eq!(users, vec![1]);

        let users = db.users_for("BTCUSDT", "5m").await.unwrap();
        assert_eq!(users, vec![1, 2]);
    }

    #[tokio::test]
    async fn timeframe_match_is_exact() {
        // "1m" must not match a subscription that only has "15m".
        let db = db().await;
        db.upsert_user(1, None).await.unwrap();
        db.add_subscription(1, "BTCUSDT", &["15m"], false).await.unwrap();
        assert!(db.users_for("BTCUSDT", "1m").await.unwrap().is_empty());
        assert_eq!(db.users_for("BTCUSDT", "15m").await.unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn blocked_user_leaves_fanout() {
        let db = db().await;
        db.upsert_user(1, Some("alice")).await.unwrap();
        db.add_subscription(1, "BTCUSDT", &["1m"], false).await.unwrap();
        assert_eq!(db.users_for("BTCUSDT", "1m").await.unwrap(), vec![1]);

        db.mark_user_blocked(1).await.unwrap();
        assert!(db.users_for("BTCUSDT", "1m").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn signal_history_round_trip_with_delivery_time() {
        let db = db().await;
        db.upsert_user(1, None).await.unwrap();

        let id = db.insert_signal(1, &signal()).await.unwrap();
        db.set_delivery_time(id, 42).await.unwrap();

        assert_eq!(db.signal_count(1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn delivery_log_marks_blocked() {
        let db = db().await;
        db.upsert_user(5, None).await.unwrap();
        db.add_subscription(5, "BTCUSDT", &["1m"], false).await.unwrap();

        DeliveryLog::user_blocked(&db, 5).await;
        assert!(db.users_for("BTCUSDT", "1m").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn candle_batch_insert() {
        let db = db().await;
        let candles: Vec<Candle> = (0..5)
            .map(|i| Candle {
                symbol: "BTCUSDT".into(),
                timeframe: "1m".into(),
                open_time: i * 60_000,
                close_time: i * 60_000 + 59_999,
                open: dec!(100),
                high: dec!(101),
                low: dec!(99),
                close: dec!(100.5),
                volume: dec!(10),
                is_closed: true,
            })
            .collect();
        assert_eq!(db.insert_candles(&candles).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn active_symbols_requires_real_time_opt_in() {
        let db = db().await;
        db.upsert_user(1, None).await.unwrap();
        db.upsert_user(2, None).await.unwrap();
        db.add_subscription(1, "BTCUSDT", &["1m"], true).await.unwrap();
        // Subscribed, but never opted into real-time monitoring.
        db.add_subscription(2, "ETHUSDT", &["1h"], false).await.unwrap();
        // A pair with no subscribers at all stays invisible.
        db.upsert_pair("SOLUSDT").await.unwrap();

        assert_eq!(db.active_symbols().await.unwrap(), vec!["BTCUSDT"]);

        // One real-time subscription is enough to surface the pair.
        db.add_subscription(1, "ETHUSDT", &["1h"], true).await.unwrap();
        let mut symbols = db.active_symbols().await.unwrap();
        symbols.sort();
        assert_eq!(symbols, vec!["BTCUSDT", "ETHUSDT"]);
    }
}
