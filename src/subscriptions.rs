// =============================================================================
// Subscription Index — read-mostly fan-out lookups with in-process caching
// =============================================================================
//
// The fan-out stage asks "who gets notified for (symbol, timeframe)?" on
// every emitted signal. The answer is a relational join that changes rarely,
// so results are cached in-process and refreshed on a fixed interval; a cache
// entry always survives at least one tick.
//
// The index also derives the WebSocket stream set (ticker + kline streams per
// active pair) that the stream refresh task reconciles against.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use parking_lot::RwLock;
use tracing::debug;

use crate::db::Database;
use crate::market_data::candle::{kline_stream_name, ticker_stream_name};

struct CachedUsers {
    users: Vec<i64>,
    fetched_at: Instant,
}

pub struct SubscriptionIndex {
    db: Arc<Database>,
    cache: RwLock<HashMap<(String, String), CachedUsers>>,
    ttl: Duration,
}

impl SubscriptionIndex {
    pub fn new(db: Arc<Database>, ttl: Duration) -> Self {
        Self {
            db,
            cache: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Candidate users for a signal on (symbol, timeframe). Served from the
    /// in-process cache while fresh; otherwise one streamed DB query refills
    /// the entry.
    pub async fn users_for(&self, symbol: &str, timeframe: &str) -> Result<Vec<i64>> {
        let key = (symbol.to_string(), timeframe.to_string());
        {
            let cache = self.cache.read();
            if let Some(entry) = cache.get(&key) {
                if entry.fetched_at.elapsed() < self.ttl {
                    return Ok(entry.users.clone());
                }
            }
        }

        let users = self.db.users_for(symbol, timeframe).await?;
        debug!(symbol, timeframe, count = users.len(), "fan-out index refreshed");
        self.cache.write().insert(
            key,
            CachedUsers {
                users: users.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(users)
    }

    /// Drop every cached entry; the next lookup goes back to the database.
    /// The periodic refresh task calls this on its interval.
    pub fn invalidate(&self) {
        self.cache.write().clear();
    }

    /// The WebSocket stream set required to cover every active pair: one
    /// ticker stream per symbol plus a kline stream per (symbol, timeframe).
    pub async fn required_streams(&self, timeframes: &[String]) -> Result<HashSet<String>> {
        let symbols = self.db.active_symbols().await?;
        let mut streams = HashSet::new();
        for symbol in &symbols {
            streams.insert(ticker_stream_name(symbol));
            for timeframe in timeframes {
                streams.insert(kline_stream_name(symbol, timeframe));
            }
        }
        Ok(streams)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    async fn index_with_data(ttl: Duration) -> SubscriptionIndex {
        let db = Arc::new(Database::connect("sqlite::memory:").await.unwrap());
        db.upsert_user(1, None).await.unwrap();
        db.upsert_user(2, None).await.unwrap();
        db.add_subscription(1, "BTCUSDT", &["1m"], false).await.unwrap();
        // User 2 opted into real-time monitoring, which puts the pair on the
        // WebSocket stream set.
        db.add_subscription(2, "BTCUSDT", &["1m", "5m"], true).await.unwrap();
        SubscriptionIndex::new(db, ttl)
    }

    #[tokio::test]
    async fn lookup_hits_database_then_cache() {
        let index = index_with_data(Duration::from_secs(60)).await;
        assert_eq!(index.users_for("BTCUSDT", "1m").await.unwrap(), vec![1, 2]);

        // Change the underlying data; the cached answer keeps serving.
        index.db.mark_user_blocked(1).await.unwrap();
        assert_eq!(index.users_for("BTCUSDT", "1m").await.unwrap(), vec![1, 2]);

        // After invalidation the change becomes visible.
        index.invalidate();
        assert_eq!(index.users_for("BTCUSDT", "1m").await.unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn expired_entries_refresh_on_access() {
        let index = index_with_data(Duration::ZERO).await;
        assert_eq!(index.users_for("BTCUSDT", "1m").await.unwrap(), vec![1, 2]);
        index.db.mark_user_blocked(1).await.unwrap();
        // Zero TTL: next lookup re-queries immediately.
        assert_eq!(index.users_for("BTCUSDT", "1m").await.unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn unknown_pair_yields_no_users() {
        let index = index_with_data(Duration::from_secs(60)).await;
        assert!(index.users_for("DOGEUSDT", "1m").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stream_set_covers_active_pairs() {
        let index = index_with_data(Duration::from_secs(60)).await;
        let streams = index
            .required_streams(&["1m".to_string(), "5m".to_string()])
            .await
            .unwrap();
        assert!(streams.contains("btcusdt@ticker"));
        assert!(streams.contains("btcusdt@kline_1m"));
        assert!(streams.contains("btcusdt@kline_5m"));
        assert_eq!(streams.len(), 3);
    }
}
