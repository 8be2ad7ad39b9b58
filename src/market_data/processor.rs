// =============================================================================
// Data Processor — frame validation, cache update, tick emission
// =============================================================================
//
// Sits between the WebSocket client and the indicator engine. Every kline
// frame is validated, converted and written to the candle cache; only closed
// candles become ticks for the engine, so zone entries stay edge-triggered
// instead of re-firing inside one candle.
//
// Malformed frames are dropped with a counter increment and a warn — never
// retried. Non-kline frames (ticker updates, subscribe acknowledgements) are
// ignored silently.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::cache::CandleCache;
use crate::error::PipelineError;
use crate::market_data::candle::{candle_from_frame_value, is_kline_event, Candle};
use crate::perf::{PerfMonitor, StageTimer};
use crate::timeframe::align_to_timeframe;
use crate::types::Tick;

pub struct DataProcessor {
    candle_cache: Arc<CandleCache>,
    tick_tx: mpsc::Sender<Tick>,
    monitor: Arc<PerfMonitor>,
    malformed_frames: AtomicU64,
}

impl DataProcessor {
    pub fn new(
        candle_cache: Arc<CandleCache>,
        tick_tx: mpsc::Sender<Tick>,
        monitor: Arc<PerfMonitor>,
    ) -> Self {
        Self {
            candle_cache,
            tick_tx,
            monitor,
            malformed_frames: AtomicU64::new(0),
        }
    }

    /// Handle one raw WebSocket frame. Called once per frame, in arrival
    /// order.
    pub async fn process_frame(&self, text: &str) {
        let _timer = StageTimer::start(&self.monitor, "websocket_processing");

        let root: serde_json::Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                self.drop_malformed(&format!("invalid JSON: {e}"));
                return;
            }
        };
        if !is_kline_event(&root) {
            return;
        }

        let candle = match candle_from_frame_value(&root) {
            Ok(candle) => candle,
            Err(e) => {
                self.drop_malformed(&format!("kline schema mismatch: {e}"));
                return;
            }
        };
        if let Err(reason) = validate_candle(&candle) {
            self.drop_malformed(&reason);
            return;
        }

        self.candle_cache.upsert(&candle);
        debug!(
            symbol = %candle.symbol,
            timeframe = %candle.timeframe,
            close = %candle.close,
            closed = candle.is_closed,
            "candle update"
        );

        // Open candles refresh the cache only; the engine runs on close.
        if candle.is_closed {
            let tick = Tick {
                symbol: candle.symbol,
                timeframe: candle.timeframe,
                close: candle.close,
                volume: candle.volume,
                close_time_ms: candle.close_time,
            };
            if self.tick_tx.send(tick).await.is_err() {
                warn!("tick channel closed, dropping tick");
            }
        }
    }

    fn drop_malformed(&self, reason: &str) {
        self.malformed_frames.fetch_add(1, Ordering::Relaxed);
        let error = PipelineError::malformed(reason);
        warn!(error = %error, "frame dropped");
    }

    /// Frames dropped by validation so far.
    pub fn malformed_count(&self) -> u64 {
        self.malformed_frames.load(Ordering::Relaxed)
    }
}

/// Domain validation beyond schema shape: positive prices, sane extremes, a
/// known timeframe and a window-aligned open time.
pub fn validate_candle(candle: &Candle) -> Result<(), String> {
    if candle.open <= Decimal::ZERO
        || candle.high <= Decimal::ZERO
        || candle.low <= Decimal::ZERO
        || candle.close <= Decimal::ZERO
    {
        return Err(format!(
            "non-positive price in candle for {}",
            candle.symbol
        ));
    }
    if candle.volume < Decimal::ZERO {
        return Err(format!("negative volume for {}", candle.symbol));
    }
    if candle.high < candle.low {
        return Err(format!("high below low for {}", candle.symbol));
    }
    if candle.close_time <= candle.open_time {
        return Err(format!("close_time before open_time for {}", candle.symbol));
    }
    let aligned = align_to_timeframe(candle.open_time, &candle.timeframe)
        .map_err(|e| format!("bad timeframe: {e}"))?;
    if aligned != candle.open_time {
        return Err(format!(
            "open_time {} not aligned to {}",
            candle.open_time, candle.timeframe
        ));
    }
    Ok(())
}
