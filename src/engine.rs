// =============================================================================
// Real-Time Processor — per-tick indicator updates, signals, fan-out
// =============================================================================
//
// Single consumer of the tick channel, so candle arrival order is preserved
// end-to-end for every (symbol, timeframe). Per tick:
//
//   1. RSI: incremental Wilder update from cached state when fresh, full
//      recomputation from the candle series otherwise. State is replaced
//      wholesale; an invariant violation invalidates it and skips the tick.
//   2. EMA family: one multiply-add per period from cached state, SMA
//      bootstrap when cold; all period values land in the cache as a single
//      batched write.
//   3. Signal evaluation over the fresh snapshot, then fan-out: subscription
//      lookup, anti-spam gate, notification enqueue, history record.
//
// Under queue saturation non-critical signals are shed before fan-out so the
// pipeline never blocks on a slow consumer.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::cache::{CandleCache, IndicatorCache};
use crate::db::Database;
use crate::error::PipelineError;
use crate::indicators::ema::{full_ema, incremental_ema, EmaState};
use crate::indicators::rsi::{full_rsi, incremental_rsi, RsiState};
use crate::indicators::EMA_PERIODS;
use crate::market_data::candle::Candle;
use crate::market_data::rest::RestClient;
use crate::notify::queue::{NotificationQueue, QueuedNotification, PRIORITY_CRITICAL, PRIORITY_NORMAL};
use crate::notify::sender::format_signal_message;
use crate::perf::{PerfMonitor, StageTimer};
use crate::signals::anti_spam::AntiSpamManager;
use crate::signals::evaluator::{SignalEvaluator, TickSnapshot};
use crate::subscriptions::SubscriptionIndex;
use crate::types::{Signal, Tick};

/// Closes fetched per tick; covers the longest EMA bootstrap plus a
/// smoothing tail.
const HISTORY_LIMIT: usize = 450;
/// Closes used for the volatility estimate behind the adaptive cache TTL.
const VOLATILITY_WINDOW: usize = 20;
/// Closed candles buffered before one batched archive insert.
const CANDLE_BATCH: usize = 100;
/// Candles requested per (symbol, timeframe) during warm-up.
const WARMUP_KLINES: u32 = 250;

/// What one tick produced, for observability and tests.
#[derive(Debug)]
pub struct TickOutcome {
    pub rsi: Option<f64>,
    pub ema: [Option<f64>; EMA_PERIODS.len()],
    pub signals: Vec<Signal>,
    pub enqueued: usize,
}

pub struct RealTimeProcessor {
    rsi_period: u32,
    evaluator: SignalEvaluator,
    candle_cache: Arc<CandleCache>,
    indicator_cache: Arc<IndicatorCache>,
    anti_spam: Arc<AntiSpamManager>,
    subscriptions: Arc<SubscriptionIndex>,
    queue: Arc<NotificationQueue>,
    monitor: Arc<PerfMonitor>,
    db: Arc<Database>,
    pending_candles: Mutex<Vec<Candle>>,
    skipped_ticks: AtomicU64,
    shed_signals: AtomicU64,
}

impl RealTimeProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rsi_period: u32,
        evaluator: SignalEvaluator,
        candle_cache: Arc<CandleCache>,
        indicator_cache: Arc<IndicatorCache>,
        anti_spam: Arc<AntiSpamManager>,
        subscriptions: Arc<SubscriptionIndex>,
        queue: Arc<NotificationQueue>,
        monitor: Arc<PerfMonitor>,
        db: Arc<Database>,
    ) -> Self {
        Self {
            rsi_period,
            evaluator,
            candle_cache,
            indicator_cache,
            anti_spam,
            subscriptions,
            queue,
            monitor,
            db,
            pending_candles: Mutex::new(Vec::new()),
            skipped_ticks: AtomicU64::new(0),
            shed_signals: AtomicU64::new(0),
        }
    }

    /// Consume ticks until the channel closes. Fatal errors propagate to the
    /// supervisor; anything else counts as a skipped tick.
    pub async fn run(self: Arc<Self>, mut ticks: mpsc::Receiver<Tick>) -> Result<()> {
        info!("real-time processor started");
        while let Some(tick) = ticks.recv().await {
            match self.process_tick(&tick).await {
                Ok(outcome) => {
                    debug!(
                        symbol = %tick.symbol,
                        timeframe = %tick.timeframe,
                        rsi = ?outcome.rsi,
                        signals = outcome.signals.len(),
                        enqueued = outcome.enqueued,
                        "tick processed"
                    );
                }
                Err(e) => {
                    if e.downcast_ref::<PipelineError>().is_some_and(PipelineError::is_fatal) {
                        error!(error = %e, "fatal pipeline error, stopping");
                        return Err(e);
                    }
                    self.skipped_ticks.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "tick skipped");
                }
            }
        }
        info!("tick channel closed, real-time processor stopping");
        Ok(())
    }

    /// Process one closed-candle tick through indicators, evaluation and
    /// fan-out.
    pub async fn process_tick(&self, tick: &Tick) -> Result<TickOutcome> {
        let total = StageTimer::start(&self.monitor, "total_processing");
        let now = Utc::now();
        let symbol = &tick.symbol;
        let timeframe = &tick.timeframe;

        let closes = self
            .candle_cache
            .recent_closes(symbol, timeframe, HISTORY_LIMIT);
        let volatility = {
            let start = closes.len().saturating_sub(VOLATILITY_WINDOW);
            volatility_pct(&closes[start..])
        };

        self.update_volume_change(symbol, timeframe);
        self.archive_candle(symbol, timeframe).await;

        let rsi = {
            let _timer = StageTimer::start(&self.monitor, "rsi_calculation");
            self.update_rsi(symbol, timeframe, tick.close, &closes, volatility, now)
        };

        let ema = {
            let _timer = StageTimer::start(&self.monitor, "ema_calculation");
            self.update_emas(symbol, timeframe, tick.close, &closes, volatility, now)
        };

        let _timer = StageTimer::start(&self.monitor, "signal_generation");
        let batch = self.indicator_cache.get_indicators(symbol, timeframe);
        debug!(
            symbol,
            timeframe,
            rsi_14 = ?batch.rsi_14,
            rsi_21 = ?batch.rsi_21,
            volume_change = ?batch.volume_change_pct,
            "indicator batch read"
        );
        let snapshot = TickSnapshot {
            rsi,
            ema,
            price: tick.close.to_f64().unwrap_or(0.0),
            processing_ms: total.elapsed_ms(),
            volume_change_pct: batch.volume_change_pct,
        };
        let signals = self.evaluator.evaluate(symbol, timeframe, &snapshot);

        let mut enqueued = 0;
        for signal in &signals {
            enqueued += self.fan_out(signal).await?;
        }

        Ok(TickOutcome {
            rsi,
            ema,
            signals,
            enqueued,
        })
    }

    // -------------------------------------------------------------------------
    // Indicator updates
    // -------------------------------------------------------------------------

    fn update_rsi(
        &self,
        symbol: &str,
        timeframe: &str,
        price: Decimal,
        closes: &[Decimal],
        volatility: f64,
        now: DateTime<Utc>,
    ) -> Option<f64> {
        let period = self.rsi_period;
        let cached: Option<RsiState> = self
            .indicator_cache
            .load_state("rsi", symbol, timeframe, period)
            .filter(|state: &RsiState| state.is_fresh(period, now));

        let (value, state) = match cached {
            Some(state) => incremental_rsi(&state, price, now),
            // Cold or stale: full recomputation over the cached series (which
            // already includes this tick's close).
            None => full_rsi(closes, period, now)?,
        };

        if !(0.0..=100.0).contains(&value) || !state.is_valid() {
            let violation = PipelineError::invariant(format!(
                "RSI {value} out of range for {symbol}:{timeframe}"
            ));
            error!(error = %violation, "invalidating cached state");
            self.indicator_cache.drop_state("rsi", symbol, timeframe, period);
            self.skipped_ticks.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let previous = self.indicator_cache.get_rsi(symbol, timeframe, period);
        self.indicator_cache.save_state("rsi", symbol, timeframe, period, &state);
        self.indicator_cache.set_rsi(symbol, timeframe, period, value);
        self.indicator_cache
            .set_rt_snapshot("rsi", symbol, timeframe, period, value, previous, volatility);
        Some(value)
    }

    fn update_emas(
        &self,
        symbol: &str,
        timeframe: &str,
        price: Decimal,
        closes: &[Decimal],
        volatility: f64,
        now: DateTime<Utc>,
    ) -> [Option<f64>; EMA_PERIODS.len()] {
        let mut values = [None; EMA_PERIODS.len()];
        let mut batch: Vec<(u32, f64)> = Vec::with_capacity(EMA_PERIODS.len());

        for (i, &period) in EMA_PERIODS.iter().enumerate() {
            let cached: Option<EmaState> = self
                .indicator_cache
                .load_state("ema", symbol, timeframe, period)
                .filter(|state: &EmaState| state.period == period);

            let state = match cached {
                Some(state) => incremental_ema(&state, price, now),
                None => match full_ema(closes, period, now) {
                    Some(state) => state,
                    // Not ready: fewer closes than the period needs.
                    None => continue,
                },
            };

            let Some(value) = state.last_value.to_f64() else {
                continue;
            };
            let previous = self.indicator_cache.get_ema(symbol, timeframe, period);
            self.indicator_cache.save_state("ema", symbol, timeframe, period, &state);
            self.indicator_cache
                .set_rt_snapshot("ema", symbol, timeframe, period, value, previous, volatility);
            values[i] = Some(value);
            batch.push((period, value));
        }

        // All EMA value keys refresh together in one pipelined write.
        if !batch.is_empty() {
            self.indicator_cache.set_ema_batch(symbol, timeframe, &batch);
        }
        values
    }

    fn update_volume_change(&self, symbol: &str, timeframe: &str) {
        let recent = self.candle_cache.recent_candles(symbol, timeframe, 2);
        if recent.len() == 2 && recent[0].volume > Decimal::ZERO {
            let change = (recent[1].volume - recent[0].volume) / recent[0].volume
                * Decimal::from(100);
            if let Some(pct) = change.to_f64() {
                self.indicator_cache.set_volume_change(symbol, timeframe, pct);
            }
        }
    }

    /// Buffer the tick's candle for the archive; flush in batches so the DB
    /// sees one insert per [`CANDLE_BATCH`] candles.
    async fn archive_candle(&self, symbol: &str, timeframe: &str) {
        let Some(candle) = self
            .candle_cache
            .recent_candles(symbol, timeframe, 1)
            .pop()
            .filter(|c| c.is_closed)
        else {
            return;
        };

        let flush = {
            let mut pending = self.pending_candles.lock();
            pending.push(candle);
            if pending.len() >= CANDLE_BATCH {
                Some(std::mem::take(&mut *pending))
            } else {
                None
            }
        };
        if let Some(batch) = flush {
            if let Err(e) = self.db.insert_candles(&batch).await {
                warn!(error = %e, "candle archive batch failed");
            }
        }
    }

    // -------------------------------------------------------------------------
    // Fan-out
    // -------------------------------------------------------------------------

    async fn fan_out(&self, signal: &Signal) -> Result<usize> {
        let critical = signal.is_critical();

        // Backpressure: shed non-critical signals instead of blocking.
        if !critical && self.queue.is_saturated() {
            self.shed_signals.fetch_add(1, Ordering::Relaxed);
            warn!(kind = %signal.kind, "queue saturated, non-critical signal shed");
            return Ok(0);
        }

        let users = self
            .subscriptions
            .users_for(&signal.symbol, &signal.timeframe)
            .await
            .map_err(|e| PipelineError::fatal(format!("fan-out lookup failed: {e}")))?;

        let priority = if critical { PRIORITY_CRITICAL } else { PRIORITY_NORMAL };
        let mut enqueued = 0;
        for user_id in users {
            if !self.anti_spam.permits(user_id, signal) {
                continue;
            }
            let history_id = match self.db.insert_signal(user_id, signal).await {
                Ok(id) => Some(id),
                Err(e) => {
                    warn!(user_id, error = %e, "signal history insert failed");
                    None
                }
            };
            let accepted = self.queue.try_enqueue(QueuedNotification {
                user_id,
                history_id,
                signal: signal.clone(),
                message: format_signal_message(signal),
                priority,
            });
            if accepted {
                self.anti_spam.record_sent(user_id, signal);
                enqueued += 1;
            }
        }
        Ok(enqueued)
    }

    // -------------------------------------------------------------------------
    // Warm-up
    // -------------------------------------------------------------------------

    /// Backfill candle series over REST and pre-compute indicator state so the
    /// first live tick takes the incremental path.
    pub async fn warm_up(
        &self,
        rest: &RestClient,
        symbols: &[String],
        timeframes: &[String],
    ) -> usize {
        let mut warmed = 0;
        for symbol in symbols {
            for timeframe in timeframes {
                let candles = match rest.get_klines(symbol, timeframe, WARMUP_KLINES).await {
                    Ok(candles) if !candles.is_empty() => candles,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!(symbol, timeframe, error = %e, "warm-up backfill failed");
                        continue;
                    }
                };
                // A historical reload starts from a clean slate for the series.
                self.indicator_cache.invalidate(symbol, timeframe);
                self.candle_cache.load_history(symbol, timeframe, &candles);
                self.precompute_indicators(symbol, timeframe);
                warmed += 1;
            }
        }
        info!(series = warmed, "cache warm-up complete");
        warmed
    }

    /// Cold-compute RSI and every EMA for a freshly loaded series.
    pub fn precompute_indicators(&self, symbol: &str, timeframe: &str) {
        let closes = self
            .candle_cache
            .recent_closes(symbol, timeframe, HISTORY_LIMIT);
        let now = Utc::now();

        if let Some((value, state)) = full_rsi(&closes, self.rsi_period, now) {
            self.indicator_cache
                .save_state("rsi", symbol, timeframe, self.rsi_period, &state);
            self.indicator_cache
                .set_rsi(symbol, timeframe, self.rsi_period, value);
        }

        let mut batch = Vec::new();
        for &period in &EMA_PERIODS {
            if let Some(state) = full_ema(&closes, period, now) {
                if let Some(value) = state.last_value.to_f64() {
                    self.indicator_cache
                        .save_state("ema", symbol, timeframe, period, &state);
                    batch.push((period, value));
                }
            }
        }
        if !batch.is_empty() {
            self.indicator_cache.set_ema_batch(symbol, timeframe, &batch);
        }
    }

    // -------------------------------------------------------------------------
    // Counters
    // -------------------------------------------------------------------------

    pub fn skipped_ticks(&self) -> u64 {
        self.skipped_ticks.load(Ordering::Relaxed)
    }

    pub fn shed_signals(&self) -> u64 {
        self.shed_signals.load(Ordering::Relaxed)
    }
}

/// Spread of the recent closes relative to their mean, in percent. Feeds the
/// adaptive snapshot TTL.
fn volatility_pct(closes: &[Decimal]) -> f64 {
    if closes.len() < 2 {
        return 0.0;
    }
    let mut min = closes[0];
    let mut max = closes[0];
    let mut sum = Decimal::ZERO;
    for &close in closes {
        min = min.min(close);
        max = max.max(close);
        sum += close;
    }
    let mean = sum / Decimal::from(closes.len() as u32);
    if mean.is_zero() {
        return 0.0;
    }
    ((max - min) / mean * Decimal::from(100))
        .to_f64()
        .unwrap_or(0.0)
}
