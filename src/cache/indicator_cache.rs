// =============================================================================
// Indicator Cache — current values, real-time snapshots, calculation state
// =============================================================================
//
// Key grammar (colon-joined):
//   rsi:{symbol}:{timeframe}:{period}          current RSI value, 30 s
//   ema:{symbol}:{timeframe}:{period}          current EMA value, 30 s
//   state:{indicator}:{symbol}:{timeframe}:{period}   calc state, 300 s
//   volume_change:{symbol}:{timeframe}         cached volume delta, 30 s
//
// Real-time snapshot keys carry an `_rt` suffix plus a `:prev` shadow holding
// the previous value at twice the snapshot TTL. The snapshot TTL adapts to
// symbol volatility: halved above 5 %, doubled below 1 %.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::cache::store::Store;
use crate::indicators::{EMA_PERIODS, RSI_PERIODS};

/// Indicator current-value TTL.
const VALUE_TTL: Duration = Duration::from_secs(30);
/// Calculation-state TTL.
const STATE_TTL: Duration = Duration::from_secs(300);
/// Base TTL for real-time snapshots before the adaptive rule.
const RT_BASE_TTL: Duration = Duration::from_secs(30);

/// Volatility bounds for the adaptive TTL rule, in percent.
const VOLATILITY_HIGH_PCT: f64 = 5.0;
const VOLATILITY_LOW_PCT: f64 = 1.0;

/// Result of the batched indicator read: everything the signal evaluator
/// needs for one (symbol, timeframe) in a single store round trip.
#[derive(Debug, Clone, Default)]
pub struct IndicatorBatch {
    pub rsi_14: Option<f64>,
    pub rsi_21: Option<f64>,
    /// EMA values in [`EMA_PERIODS`] order.
    pub ema: [Option<f64>; EMA_PERIODS.len()],
    pub volume_change_pct: Option<f64>,
}

pub struct IndicatorCache {
    store: Arc<Store>,
}

impl IndicatorCache {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    fn rsi_key(symbol: &str, timeframe: &str, period: u32) -> String {
        format!("rsi:{symbol}:{timeframe}:{period}")
    }

    fn ema_key(symbol: &str, timeframe: &str, period: u32) -> String {
        format!("ema:{symbol}:{timeframe}:{period}")
    }

    fn state_key(indicator: &str, symbol: &str, timeframe: &str, period: u32) -> String {
        format!("state:{indicator}:{symbol}:{timeframe}:{period}")
    }

    fn volume_key(symbol: &str, timeframe: &str) -> String {
        format!("volume_change:{symbol}:{timeframe}")
    }

    /// Snapshot TTL after the adaptive volatility rule.
    fn adaptive_ttl(volatility_pct: f64) -> Duration {
        if volatility_pct > VOLATILITY_HIGH_PCT {
            RT_BASE_TTL / 2
        } else if volatility_pct < VOLATILITY_LOW_PCT {
            RT_BASE_TTL * 2
        } else {
            RT_BASE_TTL
        }
    }

    // -------------------------------------------------------------------------
    // Current values
    // -------------------------------------------------------------------------

    pub fn set_rsi(&self, symbol: &str, timeframe: &str, period: u32, value: f64) {
        self.store.set_string(
            &Self::rsi_key(symbol, timeframe, period),
            &value.to_string(),
            VALUE_TTL,
        );
    }

    pub fn get_rsi(&self, symbol: &str, timeframe: &str, period: u32) -> Option<f64> {
        self.store
            .get_string(&Self::rsi_key(symbol, timeframe, period))
            .and_then(|s| s.parse().ok())
    }

    pub fn get_ema(&self, symbol: &str, timeframe: &str, period: u32) -> Option<f64> {
        self.store
            .get_string(&Self::ema_key(symbol, timeframe, period))
            .and_then(|s| s.parse().ok())
    }

    /// Write EMA values for several periods as one pipelined batch with a
    /// per-key TTL refresh. The hot path always writes all periods together.
    pub fn set_ema_batch(&self, symbol: &str, timeframe: &str, values: &[(u32, f64)]) {
        let items: Vec<(String, Vec<u8>, Duration)> = values
            .iter()
            .map(|(period, value)| {
                (
                    Self::ema_key(symbol, timeframe, *period),
                    value.to_string().into_bytes(),
                    VALUE_TTL,
                )
            })
            .collect();
        self.store.set_many(&items);
        debug!(symbol, timeframe, count = values.len(), "ema batch written");
    }

    pub fn set_volume_change(&self, symbol: &str, timeframe: &str, pct: f64) {
        self.store
            .set_string(&Self::volume_key(symbol, timeframe), &pct.to_string(), VALUE_TTL);
    }

    // -------------------------------------------------------------------------
    // Real-time snapshots (`_rt` + `:prev` shadow)
    // -------------------------------------------------------------------------

    /// Store a real-time snapshot: the current value under `{key}_rt` and the
    /// supplied previous value under `{key}_rt:prev` at twice the TTL, both in
    /// one batch. The TTL adapts to `volatility_pct`.
    pub fn set_rt_snapshot(
        &self,
        indicator: &str,
        symbol: &str,
        timeframe: &str,
        period: u32,
        current: f64,
        previous: Option<f64>,
        volatility_pct: f64,
    ) {
        let base = format!("{indicator}:{symbol}:{timeframe}:{period}");
        let ttl = Self::adaptive_ttl(volatility_pct);

        let mut items = vec![(
            format!("{base}_rt"),
            current.to_string().into_bytes(),
            ttl,
        )];
        if let Some(prev) = previous {
            items.push((
                format!("{base}_rt:prev"),
                prev.to_string().into_bytes(),
                ttl * 2,
            ));
        }
        self.store.set_many(&items);
    }

    /// Read back a real-time snapshot as (current, previous).
    pub fn get_rt_snapshot(
        &self,
        indicator: &str,
        symbol: &str,
        timeframe: &str,
        period: u32,
    ) -> (Option<f64>, Option<f64>) {
        let base = format!("{indicator}:{symbol}:{timeframe}:{period}");
        let keys = vec![format!("{base}_rt"), format!("{base}_rt:prev")];
        let values = self.store.get_many(&keys);
        let parse = |v: &Option<Vec<u8>>| {
            v.as_ref()
                .and_then(|b| std::str::from_utf8(b).ok())
                .and_then(|s| s.parse().ok())
        };
        (parse(&values[0]), parse(&values[1]))
    }

    // -------------------------------------------------------------------------
    // Calculation state
    // -------------------------------------------------------------------------

    /// Persist a calculation state (e.g. `RsiState`) as JSON. States above the
    /// store's compression threshold are gzip-compressed transparently.
    pub fn save_state<T: Serialize>(
        &self,
        indicator: &str,
        symbol: &str,
        timeframe: &str,
        period: u32,
        state: &T,
    ) {
        let key = Self::state_key(indicator, symbol, timeframe, period);
        match serde_json::to_vec(state) {
            Ok(bytes) => self.store.set(&key, &bytes, STATE_TTL),
            Err(e) => warn!(key, error = %e, "failed to serialise calculation state"),
        }
    }

    /// Load a calculation state. A corrupt payload is dropped and reported as
    /// absent so the caller falls back to a full recomputation.
    pub fn load_state<T: DeserializeOwned>(
        &self,
        indicator: &str,
        symbol: &str,
        timeframe: &str,
        period: u32,
    ) -> Option<T> {
        let key = Self::state_key(indicator, symbol, timeframe, period);
        let bytes = self.store.get(&key)?;
        match serde_json::from_slice(&bytes) {
            Ok(state) => Some(state),
            Err(e) => {
                warn!(key, error = %e, "corrupt calculation state dropped");
                self.store.delete(&key);
                None
            }
        }
    }

    /// Drop a calculation state, e.g. after an invariant violation.
    pub fn drop_state(&self, indicator: &str, symbol: &str, timeframe: &str, period: u32) {
        self.store
            .delete(&Self::state_key(indicator, symbol, timeframe, period));
    }

    // -------------------------------------------------------------------------
    // Batched read
    // -------------------------------------------------------------------------

    /// Fetch RSI {14, 21}, every EMA period and the volume change for a
    /// (symbol, timeframe) in one store round trip.
    pub fn get_indicators(&self, symbol: &str, timeframe: &str) -> IndicatorBatch {
        let mut keys: Vec<String> = RSI_PERIODS
            .iter()
            .map(|p| Self::rsi_key(symbol, timeframe, *p))
            .collect();
        keys.extend(EMA_PERIODS.iter().map(|p| Self::ema_key(symbol, timeframe, *p)));
        keys.push(Self::volume_key(symbol, timeframe));

        let values = self.store.get_many(&keys);
        let parse = |v: &Option<Vec<u8>>| -> Option<f64> {
            v.as_ref()
                .and_then(|b| std::str::from_utf8(b).ok())
                .and_then(|s| s.parse().ok())
        };

        let mut batch = IndicatorBatch {
            rsi_14: parse(&values[0]),
            rsi_21: parse(&values[1]),
            ..Default::default()
        };
        for (i, slot) in batch.ema.iter_mut().enumerate() {
            *slot = parse(&values[RSI_PERIODS.len() + i]);
        }
        batch.volume_change_pct = parse(&values[RSI_PERIODS.len() + EMA_PERIODS.len()]);
        batch
    }

    // -------------------------------------------------------------------------
    // Invalidation
    // -------------------------------------------------------------------------

    /// Delete every key belonging to the (symbol, timeframe) series. Used
    /// when historical data is reloaded.
    pub fn invalidate(&self, symbol: &str, timeframe: &str) -> usize {
        let removed = self.store.delete_pattern(&format!("*:{symbol}:{timeframe}*"));
        debug!(symbol, timeframe, removed, "indicator keys invalidated");
        removed
    }
}
