// =============================================================================
// Signal Evaluator — RSI zone crossings and EMA crossovers
// =============================================================================
//
// All rules are edge-triggered on (previous, current) pairs, so repeated
// ticks strictly inside a zone never re-emit entry signals. The evaluator
// owns the per-(symbol, timeframe) memory of previous indicator values; the
// first tick for a series establishes the baseline and emits nothing.
//
// At most one RSI kind fires per tick; when a strong threshold and a normal
// threshold are crossed together, the strong variant wins.
// =============================================================================

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::config::RsiZones;
use crate::indicators::EMA_PERIODS;
use crate::types::{Signal, SignalKind};

/// EMA crossover pairs as (short, long) indices into [`EMA_PERIODS`].
const CROSSOVER_PAIRS: [(usize, usize); 2] = [(0, 1), (1, 3)]; // (20,50), (50,200)

/// Everything the evaluator needs for one tick of one (symbol, timeframe).
#[derive(Debug, Clone)]
pub struct TickSnapshot {
    pub rsi: Option<f64>,
    /// EMA values in [`EMA_PERIODS`] order; `None` when the period is not
    /// ready yet.
    pub ema: [Option<f64>; EMA_PERIODS.len()],
    pub price: f64,
    pub processing_ms: u64,
    pub volume_change_pct: Option<f64>,
}

#[derive(Default)]
struct SeriesMemory {
    rsi: Option<f64>,
    ema: [Option<f64>; EMA_PERIODS.len()],
}

pub struct SignalEvaluator {
    zones: RsiZones,
    memory: Mutex<HashMap<(String, String), SeriesMemory>>,
}

impl SignalEvaluator {
    pub fn new(zones: RsiZones) -> Self {
        Self {
            zones,
            memory: Mutex::new(HashMap::new()),
        }
    }

    /// Evaluate one tick and advance the previous-value memory.
    ///
    /// Returns every signal that fired (at most one RSI kind plus at most one
    /// crossover per EMA pair).
    pub fn evaluate(&self, symbol: &str, timeframe: &str, snapshot: &TickSnapshot) -> Vec<Signal> {
        let key = (symbol.to_string(), timeframe.to_string());
        let mut memory = self.memory.lock();
        let series = memory.entry(key).or_default();

        let mut signals = Vec::new();

        if let Some(current) = snapshot.rsi {
            if let Some(previous) = series.rsi {
                if let Some(kind) = self.rsi_crossing(previous, current) {
                    signals.push(make_signal(symbol, timeframe, kind, current, snapshot));
                }
            }
            series.rsi = Some(current);
        }

        for (short_idx, long_idx) in CROSSOVER_PAIRS {
            let (Some(short), Some(long)) = (snapshot.ema[short_idx], snapshot.ema[long_idx])
            else {
                continue;
            };
            let (Some(prev_short), Some(prev_long)) =
                (series.ema[short_idx], series.ema[long_idx])
            else {
                continue;
            };

            if prev_short < prev_long && short > long {
                signals.push(make_signal(
                    symbol,
                    timeframe,
                    SignalKind::EmaGoldenCross,
                    short,
                    snapshot,
                ));
            } else if prev_short > prev_long && short < long {
                signals.push(make_signal(
                    symbol,
                    timeframe,
                    SignalKind::EmaDeathCross,
                    short,
                    snapshot,
                ));
            }
        }

        for (i, value) in snapshot.ema.iter().enumerate() {
            if value.is_some() {
                series.ema[i] = *value;
            }
        }

        signals
    }

    /// Classify the (previous, current) RSI transition. Strong thresholds are
    /// checked first so they take precedence over the normal zones.
    fn rsi_crossing(&self, prev: f64, curr: f64) -> Option<SignalKind> {
        let z = &self.zones;
        if prev >= z.oversold_strong && curr < z.oversold_strong {
            return Some(SignalKind::RsiStrongOversold);
        }
        if prev <= z.overbought_strong && curr > z.overbought_strong {
            return Some(SignalKind::RsiStrongOverbought);
        }
        if prev >= z.oversold && curr < z.oversold {
            return Some(SignalKind::RsiOversoldEntry);
        }
        if prev < z.oversold && curr >= z.oversold {
            return Some(SignalKind::RsiOversoldExit);
        }
        if prev <= z.overbought && curr > z.overbought {
            return Some(SignalKind::RsiOverboughtEntry);
        }
        if prev > z.overbought && curr <= z.overbought {
            return Some(SignalKind::RsiOverboughtExit);
        }
        None
    }
}

fn make_signal(
    symbol: &str,
    timeframe: &str,
    kind: SignalKind,
    trigger_value: f64,
    snapshot: &TickSnapshot,
) -> Signal {
    Signal {
        id: Uuid::new_v4(),
        symbol: symbol.to_string(),
        timeframe: timeframe.to_string(),
        kind,
        trigger_value,
        price: snapshot.price,
        produced_at: Utc::now(),
        processing_ms: snapshot.processing_ms,
        volume_change_pct: snapshot.volume_change_pct,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn evaluator() -> SignalEvaluator {
        SignalEvaluator::new(RsiZones::default())
    }

    fn rsi_snapshot(rsi: f64) -> TickSnapshot {
        TickSnapshot {
            rsi: Some(rsi),
            ema: [None; 4],
            price: 37000.0,
            processing_ms: 2,
            volume_change_pct: None,
        }
    }

    fn ema_snapshot(e20: f64, e50: f64) -> TickSnapshot {
        TickSnapshot {
            rsi: None,
            ema: [Some(e20), Some(e50), None, None],
            price: 100.0,
            processing_ms: 2,
            volume_change_pct: None,
        }
    }

    fn feed_rsi(ev: &SignalEvaluator, values: &[f64]) -> Vec<Signal> {
        let mut out = Vec::new();
        for v in values {
            out.extend(ev.evaluate("BTCUSDT", "1m", &rsi_snapshot(*v)));
        }
        out
    }

    #[test]
    fn first_tick_establishes_baseline_silently() {
        let ev = evaluator();
        assert!(feed_rsi(&ev, &[25.0]).is_empty());
    }

    #[test]
    fn oversold_entry_fires_once() {
        let ev = evaluator();
        let signals = feed_rsi(&ev, &[32.0, 28.5]);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].kind, SignalKind::RsiOversoldEntry);
        assert!((signals[0].trigger_value - 28.5).abs() < f64::EPSILON);
    }

    #[test]
    fn zone_emission_is_edge_triggered() {
        // Trajectory 29, 28, 27, 26 after entry stays inside the zone.
        let ev = evaluator();
        let signals = feed_rsi(&ev, &[32.0, 29.0, 28.0, 27.0, 26.0]);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].kind, SignalKind::RsiOversoldEntry);
    }

    #[test]
    fn exit_fires_on_the_way_back() {
        let ev = evaluator();
        let signals = feed_rsi(&ev, &[32.0, 28.0, 31.0]);
        assert_eq!(signals.len(), 2);
        assert_eq!(signals[1].kind, SignalKind::RsiOversoldExit);
    }

    #[test]
    fn overbought_entry_and_exit() {
        let ev = evaluator();
        let signals = feed_rsi(&ev, &[68.0, 72.0, 69.0]);
        assert_eq!(signals.len(), 2);
        assert_eq!(signals[0].kind, SignalKind::RsiOverboughtEntry);
        assert_eq!(signals[1].kind, SignalKind::RsiOverboughtExit);
    }

    #[test]
    fn strong_variant_wins_on_a_deep_plunge() {
        // 31 → 19 crosses both the 30 and the 20 thresholds in one tick.
        let ev = evaluator();
        let signals = feed_rsi(&ev, &[31.0, 19.0]);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].kind, SignalKind::RsiStrongOversold);
    }

    #[test]
    fn strong_overbought_wins_on_a_spike() {
        let ev = evaluator();
        let signals = feed_rsi(&ev, &[69.0, 83.0]);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].kind, SignalKind::RsiStrongOverbought);
    }

    #[test]
    fn exact_boundary_does_not_enter() {
        // curr == 30 is not "< 30"; curr == 70 is not "> 70".
        let ev = evaluator();
        assert!(feed_rsi(&ev, &[32.0, 30.0]).is_empty());
        let ev = evaluator();
        assert!(feed_rsi(&ev, &[68.0, 70.0]).is_empty());
    }

    #[test]
    fn golden_cross_fires_once() {
        // EMA20: 99, 100, 101 — EMA50: 100, 100, 100.
        let ev = evaluator();
        let mut signals = Vec::new();
        signals.extend(ev.evaluate("BTCUSDT", "1m", &ema_snapshot(99.0, 100.0)));
        signals.extend(ev.evaluate("BTCUSDT", "1m", &ema_snapshot(100.0, 100.0)));
        signals.extend(ev.evaluate("BTCUSDT", "1m", &ema_snapshot(101.0, 100.0)));
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].kind, SignalKind::EmaGoldenCross);

        // Re-tick with identical values must not re-emit.
        let again = ev.evaluate("BTCUSDT", "1m", &ema_snapshot(101.0, 100.0));
        assert!(again.is_empty());
    }

    #[test]
    fn death_cross_fires_on_the_way_down() {
        let ev = evaluator();
        ev.evaluate("BTCUSDT", "1m", &ema_snapshot(101.0, 100.0));
        let signals = ev.evaluate("BTCUSDT", "1m", &ema_snapshot(99.0, 100.0));
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].kind, SignalKind::EmaDeathCross);
    }

    #[test]
    fn touching_without_crossing_is_silent() {
        let ev = evaluator();
        ev.evaluate("BTCUSDT", "1m", &ema_snapshot(99.0, 100.0));
        // Short EMA rises to exactly the long value, no cross.
        let signals = ev.evaluate("BTCUSDT", "1m", &ema_snapshot(100.0, 100.0));
        assert!(signals.is_empty());
    }

    #[test]
    fn series_memories_are_independent() {
        let ev = evaluator();
        ev.evaluate("BTCUSDT", "1m", &rsi_snapshot(32.0));
        ev.evaluate("BTCUSDT", "5m", &rsi_snapshot(50.0));

        // The 1m drop fires; the 5m series is unaffected.
        let signals = ev.evaluate("BTCUSDT", "1m", &rsi_snapshot(28.0));
        assert_eq!(signals.len(), 1);
        let signals = ev.evaluate("BTCUSDT", "5m", &rsi_snapshot(49.0));
        assert!(signals.is_empty());
    }

    #[test]
    fn rsi_and_ema_can_fire_in_the_same_tick() {
        let ev = evaluator();
        let warm = TickSnapshot {
            rsi: Some(32.0),
            ema: [Some(99.0), Some(100.0), None, None],
            price: 100.0,
            processing_ms: 1,
            volume_change_pct: None,
        };
        ev.evaluate("BTCUSDT", "1m", &warm);

        let hot = TickSnapshot {
            rsi: Some(28.0),
            ema: [Some(101.0), Some(100.0), None, None],
            price: 100.0,
            processing_ms: 1,
            volume_change_pct: None,
        };
        let signals = ev.evaluate("BTCUSDT", "1m", &hot);
        assert_eq!(signals.len(), 2);
        assert!(signals.iter().any(|s| s.kind == SignalKind::RsiOversoldEntry));
        assert!(signals.iter().any(|s| s.kind == SignalKind::EmaGoldenCross));
    }
}
