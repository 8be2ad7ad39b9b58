// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Incremental implementations of the two indicator families the alerting core
// evaluates. Arithmetic runs on `rust_decimal::Decimal` so that two systems
// fed identical input agree; values cross to f64 only at the API boundary.

pub mod ema;
pub mod rsi;

/// EMA periods maintained per (symbol, timeframe).
pub const EMA_PERIODS: [u32; 4] = [20, 50, 100, 200];

/// RSI periods carried in the batched indicator read. Only the first is
/// computed per tick; the second rides along as an optional cached value.
pub const RSI_PERIODS: [u32; 2] = [14, 21];
