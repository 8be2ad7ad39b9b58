// =============================================================================
// Relative Strength Index (RSI) — Wilder's Smoothing
// =============================================================================
//
// Step 1 — Seed average gain / average loss with the SMA of the first
//          `period` per-bar changes.
// Step 2 — Apply Wilder's exponential smoothing for every further close:
//            avg_gain' = (avg_gain * (period - 1) + gain) / period
//            avg_loss' = (avg_loss * (period - 1) + loss) / period
// Step 3 — RS  = avg_gain / avg_loss
//          RSI = 100 - 100 / (1 + RS)       (avg_loss == 0 => RSI = 100)
//
// The incremental update is the same recurrence applied once, so a state
// carried forward from a full computation reproduces the full sweep exactly.
// State is replaced wholesale on every update, never merged.
// =============================================================================

use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Age beyond which cached state is distrusted and a full recomputation is
/// forced.
const STATE_MAX_AGE_SECS: i64 = 3600;

/// Calculation state carried between ticks for one (symbol, timeframe, period).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RsiState {
    pub previous_price: Decimal,
    pub avg_gain: Decimal,
    pub avg_loss: Decimal,
    pub period: u32,
    pub last_update: DateTime<Utc>,
}

impl RsiState {
    /// The incremental path is valid only while the state is fresh and was
    /// built for the same period.
    pub fn is_fresh(&self, period: u32, now: DateTime<Utc>) -> bool {
        self.period == period && now - self.last_update < Duration::seconds(STATE_MAX_AGE_SECS)
    }

    /// Domain invariants: averages non-negative, derived RSI in [0, 100].
    pub fn is_valid(&self) -> bool {
        if self.avg_gain < Decimal::ZERO || self.avg_loss < Decimal::ZERO {
            return false;
        }
        let rsi = rsi_from_averages(self.avg_gain, self.avg_loss);
        (0.0..=100.0).contains(&rsi)
    }
}

/// Convert average gain / average loss into an RSI value in [0, 100].
///
/// No down moves at all means RSI is pinned to exactly 100.
fn rsi_from_averages(avg_gain: Decimal, avg_loss: Decimal) -> f64 {
    if avg_loss.is_zero() {
        return 100.0;
    }
    let rs = avg_gain / avg_loss;
    let rsi = dec!(100) - dec!(100) / (Decimal::ONE + rs);
    rsi.to_f64().unwrap_or(0.0)
}

/// Full RSI computation over `closes` (oldest first).
///
/// Requires at least `period + 1` closes. Seeds the averages with the SMA of
/// the first `period` changes and Wilder-smooths through any remaining
/// closes, so feeding the entire history gives the canonical series value.
///
/// Returns the RSI of the final close together with the state to carry
/// forward, or `None` when there is not enough data.
pub fn full_rsi(closes: &[Decimal], period: u32, now: DateTime<Utc>) -> Option<(f64, RsiState)> {
    if period == 0 || closes.len() < period as usize + 1 {
        return None;
    }

    let period_dec = Decimal::from(period);
    let mut sum_gain = Decimal::ZERO;
    let mut sum_loss = Decimal::ZERO;
    for w in closes[..period as usize + 1].windows(2) {
        let change = w[1] - w[0];
        if change > Decimal::ZERO {
            sum_gain += change;
        } else {
            sum_loss += -change;
        }
    }

    let mut avg_gain = sum_gain / period_dec;
    let mut avg_loss = sum_loss / period_dec;

    // Wilder smoothing over everything past the seed window.
    for w in closes[period as usize..].windows(2) {
        let change = w[1] - w[0];
        let gain = change.max(Decimal::ZERO);
        let loss = (-change).max(Decimal::ZERO);
        avg_gain = (avg_gain * (period_dec - Decimal::ONE) + gain) / period_dec;
        avg_loss = (avg_loss * (period_dec - Decimal::ONE) + loss) / period_dec;
    }

    let state = RsiState {
        previous_price: *closes.last().expect("length checked above"),
        avg_gain,
        avg_loss,
        period,
        last_update: now,
    };
    Some((rsi_from_averages(avg_gain, avg_loss), state))
}

/// One Wilder step from cached state. Returns the new RSI and the replacement
/// state.
pub fn incremental_rsi(
    state: &RsiState,
    current_price: Decimal,
    now: DateTime<Utc>,
) -> (f64, RsiState) {
    let period_dec = Decimal::from(state.period);
    let change = current_price - state.previous_price;
    let gain = change.max(Decimal::ZERO);
    let loss = (-change).max(Decimal::ZERO);

    let avg_gain = (state.avg_gain * (period_dec - Decimal::ONE) + gain) / period_dec;
    let avg_loss = (state.avg_loss * (period_dec - Decimal::ONE) + loss) / period_dec;

    let next = RsiState {
        previous_price: current_price,
        avg_gain,
        avg_loss,
        period: state.period,
        last_update: now,
    };
    (rsi_from_averages(avg_gain, avg_loss), next)
}
