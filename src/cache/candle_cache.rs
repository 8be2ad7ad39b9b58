// =============================================================================
// Candle Cache — recent price series per (symbol, timeframe)
// =============================================================================
//
// Series live under `candles:{symbol}:{timeframe}` as a JSON array sorted by
// open_time ascending; the last element may be the in-progress candle, which
// is replaced in place until it closes. The latest trade price is mirrored
// under `price:{symbol}` with a short TTL.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tracing::warn;

use crate::cache::store::Store;
use crate::market_data::candle::Candle;

/// Candle series TTL.
const SERIES_TTL: Duration = Duration::from_secs(600);
/// Current price TTL.
const PRICE_TTL: Duration = Duration::from_secs(10);
/// Closed candles retained per series.
const MAX_CANDLES: usize = 500;

pub struct CandleCache {
    store: Arc<Store>,
}

impl CandleCache {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    fn series_key(symbol: &str, timeframe: &str) -> String {
        format!("candles:{symbol}:{timeframe}")
    }

    fn price_key(symbol: &str) -> String {
        format!("price:{symbol}")
    }

    /// Insert or replace the latest candle for its series.
    ///
    /// * A closed candle replaces the in-progress version of itself (same
    ///   `open_time`), then the series is trimmed to [`MAX_CANDLES`].
    /// * An open candle replaces the previous open candle in place.
    ///
    /// Every update refreshes `price:{symbol}` with the candle close.
    pub fn upsert(&self, candle: &Candle) {
        let key = Self::series_key(&candle.symbol, &candle.timeframe);
        let mut series = self.load_series(&key);

        if let Some(last) = series.last() {
            if !last.is_closed && last.open_time == candle.open_time {
                series.pop();
            }
        }
        series.push(candle.clone());
        while series.len() > MAX_CANDLES {
            series.remove(0);
        }

        self.store_series(&key, &series);
        self.store.set_string(
            &Self::price_key(&candle.symbol),
            &candle.close.to_string(),
            PRICE_TTL,
        );
    }

    /// Bulk-load historical candles (oldest first), e.g. from a REST backfill.
    /// Replaces whatever the series currently holds.
    pub fn load_history(&self, symbol: &str, timeframe: &str, candles: &[Candle]) {
        let key = Self::series_key(symbol, timeframe);
        let start = candles.len().saturating_sub(MAX_CANDLES);
        self.store_series(&key, &candles[start..]);
    }

    /// The most recent `limit` candles (oldest first), open candle included.
    pub fn recent_candles(&self, symbol: &str, timeframe: &str, limit: usize) -> Vec<Candle> {
        let series = self.load_series(&Self::series_key(symbol, timeframe));
        let start = series.len().saturating_sub(limit);
        series[start..].to_vec()
    }

    /// The most recent `limit` close prices from **closed** candles only,
    /// oldest first.
    pub fn recent_closes(&self, symbol: &str, timeframe: &str, limit: usize) -> Vec<Decimal> {
        let series = self.load_series(&Self::series_key(symbol, timeframe));
        let closes: Vec<Decimal> = series
            .iter()
            .filter(|c| c.is_closed)
            .map(|c| c.close)
            .collect();
        let start = closes.len().saturating_sub(limit);
        closes[start..].to_vec()
    }

    /// Latest cached trade price for `symbol`, if still fresh.
    pub fn current_price(&self, symbol: &str) -> Option<Decimal> {
        self.store
            .get_string(&Self::price_key(symbol))
            .and_then(|s| s.parse().ok())
    }

    /// Number of candles currently cached for the series.
    pub fn series_len(&self, symbol: &str, timeframe: &str) -> usize {
        self.load_series(&Self::series_key(symbol, timeframe)).len()
    }

    fn load_series(&self, key: &str) -> Vec<Candle> {
        let Some(bytes) = self.store.get(key) else {
            return Vec::new();
        };
        match serde_json::from_slice(&bytes) {
            Ok(series) => series,
            Err(e) => {
                warn!(key, error = %e, "corrupt candle series dropped");
                self.store.delete(key);
                Vec::new()
            }
        }
    }

    fn store_series(&self, key: &str, series: &[Candle]) {
        match serde_json::to_vec(series) {
            Ok(bytes) => self.store.set(key, &bytes, SERIES_TTL),
            Err(e) => warn!(key, error = %e, "failed to serialise candle series"),
        }
    }
}
