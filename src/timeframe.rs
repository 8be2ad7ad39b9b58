// =============================================================================
// Timeframe helpers — parsing, alignment, validation
// =============================================================================
//
// Binance timeframe strings are `<value><unit>` where unit is m / h / d
// (e.g. "1m", "15m", "4h", "1d"). Candle open times are always aligned to a
// whole multiple of the timeframe length.
// =============================================================================

use anyhow::{bail, Result};

/// Convert a timeframe string (e.g. "1m", "4h", "1d") to milliseconds.
pub fn timeframe_to_ms(timeframe: &str) -> Result<i64> {
    if timeframe.len() < 2 {
        bail!("timeframe too short: {timeframe:?}");
    }
    let (value, unit) = timeframe.split_at(timeframe.len() - 1);
    let value: i64 = value
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid timeframe value: {timeframe:?}"))?;
    if value <= 0 {
        bail!("timeframe value must be positive: {timeframe:?}");
    }
    let unit_ms = match unit {
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        _ => bail!("unsupported timeframe unit: {timeframe:?}"),
    };
    Ok(value * unit_ms)
}

/// Validate a timeframe string without converting it.
pub fn is_valid_timeframe(timeframe: &str) -> bool {
    timeframe_to_ms(timeframe).is_ok()
}

/// Align `timestamp_ms` down to the start of its timeframe window.
pub fn align_to_timeframe(timestamp_ms: i64, timeframe: &str) -> Result<i64> {
    let tf_ms = timeframe_to_ms(timeframe)?;
    Ok(timestamp_ms - timestamp_ms.rem_euclid(tf_ms))
}
