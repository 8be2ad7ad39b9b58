// =============================================================================
// Exchange REST client — historical kline backfill
// =============================================================================
//
// Only the public market-data endpoint is used; nothing here needs signing.
// Klines arrive as an array of arrays:
//   [0] openTime, [1] open, [2] high, [3] low, [4] close, [5] volume,
//   [6] closeTime, ... (remaining fields unused)
// =============================================================================

use anyhow::{Context, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::market_data::candle::Candle;

#[derive(Clone)]
pub struct RestClient {
    base_url: String,
    client: reqwest::Client,
}

impl RestClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");
        Self {
            base_url: base_url.into(),
            client,
        }
    }

    /// GET /api/v3/klines — recent candles for (symbol, interval), oldest
    /// first. The final entry may still be open; its `is_closed` flag is
    /// derived from the close time.
    pub async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
    ) -> Result<Vec<Candle>> {
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&limit={}",
            self.base_url, symbol, interval, limit
        );

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /api/v3/klines request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse klines response")?;

        if !status.is_success() {
            anyhow::bail!("GET /api/v3/klines returned {status}: {body}");
        }

        let raw = body.as_array().context("klines response is not an array")?;
        let now_ms = Utc::now().timestamp_millis();

        let mut candles = Vec::with_capacity(raw.len());
        for entry in raw {
            match parse_kline_row(entry, symbol, interval, now_ms) {
                Ok(candle) => candles.push(candle),
                Err(e) => warn!(error = %e, "skipping malformed kline row"),
            }
        }

        debug!(symbol, interval, count = candles.len(), "klines fetched");
        Ok(candles)
    }
}

fn parse_kline_row(
    entry: &serde_json::Value,
    symbol: &str,
    interval: &str,
    now_ms: i64,
) -> Result<Candle> {
    let arr = entry.as_array().context("kline row is not an array")?;
    if arr.len() < 7 {
        anyhow::bail!("kline row has {} elements", arr.len());
    }

    let open_time = arr[0].as_i64().context("missing openTime")?;
    let close_time = arr[6].as_i64().context("missing closeTime")?;

    let number = |idx: usize, name: &str| -> Result<Decimal> {
        let value = &arr[idx];
        if let Some(s) = value.as_str() {
            return s
                .parse()
                .with_context(|| format!("failed to parse {name}: {s}"));
        }
        value
            .to_string()
            .parse()
            .with_context(|| format!("{name} is not a decimal"))
    };

    Ok(Candle {
        symbol: symbol.to_string(),
        timeframe: interval.to_string(),
        open_time,
        close_time,
        open: number(1, "open")?,
        high: number(2, "high")?,
        low: number(3, "low")?,
        close: number(4, "close")?,
        volume: number(5, "volume")?,
        is_closed: close_time < now_ms,
    })
}
