// =============================================================================
// Exponential Moving Average (EMA)
// =============================================================================
//
// Formula:
//   k     = 2 / (period + 1)
//   EMA_t = close_t * k + EMA_{t-1} * (1 - k)
//
// The very first EMA value is seeded with the SMA of the first `period`
// closes. The incremental update is one multiply-add from the cached previous
// value, so the hot path never re-reads history.
// =============================================================================

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Calculation state for one (symbol, timeframe, period).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmaState {
    pub last_value: Decimal,
    pub timestamp: DateTime<Utc>,
    /// Change from the previous EMA value, in price units.
    pub slope: Decimal,
    pub period: u32,
}

/// Smoothing multiplier `2 / (period + 1)` as an exact decimal ratio.
fn multiplier(period: u32) -> Decimal {
    Decimal::from(2) / Decimal::from(period + 1)
}

/// Full EMA over `closes` (oldest first): SMA seed, then the recurrence.
///
/// Fewer than `period` closes means the indicator is not ready yet, which is
/// reported as `None`, never as an error.
pub fn full_ema(closes: &[Decimal], period: u32, now: DateTime<Utc>) -> Option<EmaState> {
    if period == 0 || closes.len() < period as usize {
        return None;
    }

    let sum: Decimal = closes[..period as usize].iter().copied().sum();
    let mut ema = sum / Decimal::from(period);

    let k = multiplier(period);
    let mut slope = Decimal::ZERO;
    for close in &closes[period as usize..] {
        let next = *close * k + ema * (Decimal::ONE - k);
        slope = next - ema;
        ema = next;
    }

    Some(EmaState {
        last_value: ema,
        timestamp: now,
        slope,
        period,
    })
}

/// One incremental step from the cached previous value.
pub fn incremental_ema(state: &EmaState, price: Decimal, now: DateTime<Utc>) -> EmaState {
    let k = multiplier(state.period);
    let next = price * k + state.last_value * (Decimal::ONE - k);
    EmaState {
        last_value: next,
        timestamp: now,
        slope: next - state.last_value,
        period: state.period,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::prelude::ToPrimitive;
    use rust_decimal_macros::dec;

    fn series(n: u32) -> Vec<Decimal> {
        (1..=n).map(Decimal::from).collect()
    }

    #[test]
    fn not_ready_with_too_little_data() {
        let now = Utc::now();
        assert!(full_ema(&series(4), 5, now).is_none());
        assert!(full_ema(&[], 5, now).is_none());
        assert!(full_ema(&series(10), 0, now).is_none());
    }

    #[test]
    fn seed_is_the_sma() {
        let now = Utc::now();
        let closes = vec![dec!(2), dec!(4), dec!(6)];
        let state = full_ema(&closes, 3, now).unwrap();
        assert_eq!(state.last_value, dec!(4));
        assert_eq!(state.slope, Decimal::ZERO);
    }

    #[test]
    fn known_values_with_period_5() {
        // 5-period EMA of [1..10]: SMA seed 3.0, k = 1/3.
        let now = Utc::now();
        let state = full_ema(&series(10), 5, now).unwrap();

        let k = dec!(2) / dec!(6);
        let mut expected = dec!(3);
        for close in (6..=10).map(Decimal::from) {
            expected = close * k + expected * (Decimal::ONE - k);
        }
        assert!((state.last_value - expected).abs() < dec!(0.0000001));
    }

    #[test]
    fn incremental_matches_full_recomputation() {
        let now = Utc::now();
        let mut closes = Vec::with_capacity(80);
        let mut price = dec!(100);
        for i in 0..80u32 {
            let step = Decimal::from((i * 29 + 7) % 13) - dec!(6);
            price += step * dec!(0.25);
            closes.push(price);
        }

        let period = 20u32;
        let mut state = full_ema(&closes[..period as usize], period, now).unwrap();
        for close in &closes[period as usize..] {
            state = incremental_ema(&state, *close, now);
        }

        let full = full_ema(&closes, period, now).unwrap();
        assert!(
            (state.last_value - full.last_value).abs() < dec!(0.00000001),
            "incremental {} vs full {}",
            state.last_value,
            full.last_value
        );
    }

    #[test]
    fn decimal_agreement_to_eight_significant_digits() {
        // Two runs over identical input must agree exactly in decimal space,
        // which comfortably covers the 8-significant-digit requirement once
        // exposed as f64.
        let now = Utc::now();
        let closes = series(60);
        let a = full_ema(&closes, 20, now).unwrap();
        let b = full_ema(&closes, 20, now).unwrap();
        assert_eq!(a.last_value, b.last_value);

        let fa = a.last_value.to_f64().unwrap();
        let fb = b.last_value.to_f64().unwrap();
        assert!((fa - fb).abs() < 1e-9);
    }

    #[test]
    fn slope_tracks_direction() {
        let now = Utc::now();
        let rising = full_ema(&series(30), 10, now).unwrap();
        assert!(rising.slope > Decimal::ZERO);

        let falling_closes: Vec<Decimal> = (1..=30).rev().map(Decimal::from).collect();
        let falling = full_ema(&falling_closes, 10, now).unwrap();
        assert!(falling.slope < Decimal::ZERO);
    }

    #[test]
    fn state_serde_round_trip() {
        let now = Utc::now();
        let state = full_ema(&series(30), 20, now).unwrap();
        let json = serde_json::to_string(&state).unwrap();
        let loaded: EmaState = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded, state);
        assert_eq!(serde_json::to_string(&loaded).unwrap(), json);
    }
}
