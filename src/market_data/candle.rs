// =============================================================================
// Candle types and kline frame parsing
// =============================================================================
//
// The exchange sends OHLCV values as decimal strings inside the kline object:
//
// ```json
// { "e": "kline", "s": "BTCUSDT",
//   "k": { "t": 1700000000000, "T": 1700000059999, "s": "BTCUSDT", "i": "1m",
//          "o": "37000.00", "h": "37050.00", "l": "36990.00", "c": "37020.00",
//          "v": "123.456", "x": false } }
// ```
//
// Combined-stream frames wrap the same payload in `{ "stream": …, "data": … }`.
// Prices parse into `Decimal` so no precision is lost before indicator math.
// =============================================================================

use anyhow::{Context, Result};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A single OHLCV candle for one (symbol, timeframe) window.
///
/// Immutable once `is_closed` is true; an open candle is replaced in the
/// cache by later updates with the same `open_time`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub timeframe: String,
    pub open_time: i64,
    pub close_time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub is_closed: bool,
}

impl Candle {
    /// Close price at the f64 API boundary.
    pub fn close_f64(&self) -> f64 {
        self.close.to_f64().unwrap_or(0.0)
    }
}

// ---------------------------------------------------------------------------
// Stream name grammar
// ---------------------------------------------------------------------------

/// Kline stream name: `<symbol-lowercase>@kline_<timeframe>`.
pub fn kline_stream_name(symbol: &str, timeframe: &str) -> String {
    format!("{}@kline_{timeframe}", symbol.to_lowercase())
}

/// Ticker stream name: `<symbol-lowercase>@ticker`.
pub fn ticker_stream_name(symbol: &str) -> String {
    format!("{}@ticker", symbol.to_lowercase())
}

// ---------------------------------------------------------------------------
// Kline frame parsing
// ---------------------------------------------------------------------------

/// Parse a kline WebSocket frame into a [`Candle`].
///
/// Accepts both the combined-stream envelope (`{"stream": …, "data": …}`) and
/// the direct single-stream payload.
pub fn parse_kline_frame(text: &str) -> Result<Candle> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse kline JSON")?;
    candle_from_frame_value(&root)
}

/// Whether an already-parsed frame is a kline event (as opposed to a ticker
/// update or a subscription acknowledgement).
pub fn is_kline_event(root: &serde_json::Value) -> bool {
    let data = if root.get("data").is_some() {
        &root["data"]
    } else {
        root
    };
    data.get("e").and_then(|e| e.as_str()) == Some("kline")
}

/// Extract a [`Candle`] from an already-parsed frame.
pub fn candle_from_frame_value(root: &serde_json::Value) -> Result<Candle> {
    let data = if root.get("data").is_some() {
        &root["data"]
    } else {
        root
    };

    let symbol = data["s"]
        .as_str()
        .context("missing field s")?
        .to_uppercase();

    let k = &data["k"];

    let timeframe = k["i"].as_str().context("missing field k.i")?.to_string();
    let open_time = k["t"].as_i64().context("missing field k.t")?;
    let close_time = k["T"].as_i64().context("missing field k.T")?;
    let is_closed = k["x"].as_bool().context("missing field k.x")?;

    Ok(Candle {
        symbol,
        timeframe,
        open_time,
        close_time,
        open: parse_decimal(&k["o"], "k.o")?,
        high: parse_decimal(&k["h"], "k.h")?,
        low: parse_decimal(&k["l"], "k.l")?,
        close: parse_decimal(&k["c"], "k.c")?,
        volume: parse_decimal(&k["v"], "k.v")?,
        is_closed,
    })
}

/// The exchange sends numeric values as JSON strings inside kline objects.
fn parse_decimal(val: &serde_json::Value, name: &str) -> Result<Decimal> {
    match val {
        serde_json::Value::String(s) => s
            .parse::<Decimal>()
            .with_context(|| format!("failed to parse {name} as decimal: {s}")),
        serde_json::Value::Number(n) => n
            .to_string()
            .parse::<Decimal>()
            .with_context(|| format!("field {name} is not a valid decimal")),
        _ => anyhow::bail!("field {name} has unexpected JSON type"),
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const SAMPLE_FRAME: &str = r#"{
        "e": "kline",
        "s": "BTCUSDT",
        "k": {
            "t": 1700000000000,
            "T": 1700000059999,
            "s": "BTCUSDT",
            "i": "1m",
            "o": "37000.00",
            "h": "37050.00",
            "l": "36990.00",
            "c": "37020.00",
            "v": "123.456",
            "x": true
        }
    }"#;

    #[test]
    fn parses_single_stream_frame() {
        let candle = parse_kline_frame(SAMPLE_FRAME).unwrap();
        assert_eq!(candle.symbol, "BTCUSDT");
        assert_eq!(candle.timeframe, "1m");
        assert_eq!(candle.open_time, 1_700_000_000_000);
        assert_eq!(candle.close, dec!(37020.00));
        assert_eq!(candle.volume, dec!(123.456));
        assert!(candle.is_closed);
    }

    #[test]
    fn parses_combined_stream_envelope() {
        let framed = format!(
            r#"{{ "stream": "btcusdt@kline_1m", "data": {} }}"#,
            SAMPLE_FRAME
        );
        let candle = parse_kline_frame(&framed).unwrap();
        assert_eq!(candle.symbol, "BTCUSDT");
        assert_eq!(candle.close, dec!(37020.00));
    }

    #[test]
    fn missing_fields_are_errors() {
        assert!(parse_kline_frame(r#"{"s": "BTCUSDT", "k": {}}"#).is_err());
        assert!(parse_kline_frame("not json").is_err());
        assert!(parse_kline_frame(r#"{"k": {"t": 1}}"#).is_err());
    }

    #[test]
    fn parse_serialize_parse_round_trips() {
        let candle = parse_kline_frame(SAMPLE_FRAME).unwrap();
        let json = serde_json::to_string(&candle).unwrap();
        let back: Candle = serde_json::from_str(&json).unwrap();
        assert_eq!(back, candle);
    }

    #[test]
    fn stream_names() {
        assert_eq!(kline_stream_name("BTCUSDT", "1m"), "btcusdt@kline_1m");
        assert_eq!(ticker_stream_name("ETHUSDT"), "ethusdt@ticker");
    }

    #[test]
    fn close_at_the_f64_boundary() {
        let candle = parse_kline_frame(SAMPLE_FRAME).unwrap();
        assert!((candle.close_f64() - 37020.0).abs() < 1e-9);
    }
}
