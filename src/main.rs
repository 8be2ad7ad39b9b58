// =============================================================================
// PulseWatch — Real-Time Market-Data Alerting Core — Main Entry Point
// =============================================================================
//
// Wiring order: config → database → caches → pipeline stages → streams.
// Every collaborator is constructed here and threaded explicitly; lifecycle
// is init → run → drain → shutdown.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod cache;
mod config;
mod db;
mod engine;
mod error;
mod indicators;
mod market_data;
mod notify;
mod perf;
mod signals;
mod subscriptions;
mod timeframe;
mod types;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::cache::{CandleCache, IndicatorCache, Store};
use crate::config::AppConfig;
use crate::db::Database;
use crate::engine::RealTimeProcessor;
use crate::market_data::ws_client::ConnectionState;
use crate::market_data::{DataProcessor, RestClient, WsClient};
use crate::notify::queue::{run_consumer, NotificationQueue};
use crate::notify::sender::{SendError, SignalSender};
use crate::perf::PerfMonitor;
use crate::signals::{AntiSpamManager, SignalEvaluator};
use crate::subscriptions::SubscriptionIndex;

/// Stand-in delivery transport: logs the outbound message. The production
/// chat transport implements [`SignalSender`] outside this crate and is
/// swapped in here.
struct LogSender;

#[async_trait]
impl SignalSender for LogSender {
    async fn send(&self, user_id: i64, message: &str) -> Result<u64, SendError> {
        info!(user_id, message, "signal delivered");
        Ok(0)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║            PulseWatch Alert Engine — Starting            ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = AppConfig::load("pulsewatch.json").unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        AppConfig::default()
    });
    config.apply_env_overrides();

    if !config.real_time_enabled {
        warn!("real_time_enabled is off — nothing to do");
        return Ok(());
    }

    // ── 2. Persistent and ephemeral stores ───────────────────────────────
    let database = Arc::new(Database::connect(&config.database_url).await?);
    let store = Arc::new(Store::new());
    let candle_cache = Arc::new(CandleCache::new(store.clone()));
    let indicator_cache = Arc::new(IndicatorCache::new(store.clone()));

    // ── 3. Pipeline collaborators ────────────────────────────────────────
    let monitor = Arc::new(PerfMonitor::new(config.stage_budgets_ms.clone()));
    let anti_spam = Arc::new(AntiSpamManager::new(
        store.clone(),
        config.notification_rate_limit,
    ));
    let subscriptions = Arc::new(SubscriptionIndex::new(
        database.clone(),
        Duration::from_secs(config.subscription_update_interval_secs),
    ));
    let queue = Arc::new(NotificationQueue::new(config.queue_high_water_mark));

    let processor = Arc::new(RealTimeProcessor::new(
        config.rsi_period,
        SignalEvaluator::new(config.rsi_zones),
        candle_cache.clone(),
        indicator_cache.clone(),
        anti_spam,
        subscriptions.clone(),
        queue.clone(),
        monitor.clone(),
        database.clone(),
    ));

    // ── 4. Cache warm-up ─────────────────────────────────────────────────
    let rest = RestClient::new(config.api_url.clone());
    let symbols = database.active_symbols().await.unwrap_or_default();
    if symbols.is_empty() {
        warn!("no active pairs yet — streams will attach as pairs appear");
    } else {
        processor
            .warm_up(&rest, &symbols, &config.default_timeframes)
            .await;
    }

    // ── 5. Channels & ingest stages ──────────────────────────────────────
    let (frame_tx, mut frame_rx) = mpsc::channel::<String>(1024);
    let (tick_tx, tick_rx) = mpsc::channel(256);

    let data_processor = Arc::new(DataProcessor::new(
        candle_cache.clone(),
        tick_tx,
        monitor.clone(),
    ));

    let frame_task = {
        let data_processor = data_processor.clone();
        tokio::spawn(async move {
            while let Some(frame) = frame_rx.recv().await {
                data_processor.process_frame(&frame).await;
            }
        })
    };

    // ── 6. WebSocket client & subscription refresh ───────────────────────
    let ws_client = Arc::new(WsClient::new(
        config.websocket_url.clone(),
        Duration::from_secs(config.ping_interval_secs),
        config.reconnect_max_attempts,
        Duration::from_secs(config.reconnect_max_delay_secs),
    ));

    let ws_task = tokio::spawn(ws_client.clone().run(frame_tx));

    // Periodically reconcile the active stream set against the subscription
    // graph and subscribe to whatever is missing.
    let refresh_task = {
        let ws_client = ws_client.clone();
        let subscriptions = subscriptions.clone();
        let timeframes = config.default_timeframes.clone();
        let interval = Duration::from_secs(config.subscription_update_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                subscriptions.invalidate();
                if ws_client.state() != ConnectionState::Connected {
                    continue;
                }
                let required = match subscriptions.required_streams(&timeframes).await {
                    Ok(required) => required,
                    Err(e) => {
                        warn!(error = %e, "stream refresh query failed");
                        continue;
                    }
                };
                let active = ws_client.active_subscriptions();
                let missing: Vec<String> = required.difference(&active).cloned().collect();
                if missing.is_empty() {
                    continue;
                }
                info!(count = missing.len(), "subscribing to new streams");
                if let Err(e) = ws_client.subscribe(&missing) {
                    warn!(error = %e, "stream subscribe failed");
                }
            }
        })
    };

    // ── 7. Metrics & store housekeeping ──────────────────────────────────
    let metrics_task = {
        let monitor = monitor.clone();
        let queue = queue.clone();
        let store = store.clone();
        let processor = processor.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            ticker.tick().await; // skip the immediate first tick
            loop {
                ticker.tick().await;
                for operation in [
                    "websocket_processing",
                    "rsi_calculation",
                    "ema_calculation",
                    "signal_generation",
                    "notification_delivery",
                    "total_processing",
                ] {
                    if let Some(stats) = monitor.stats(operation) {
                        info!(
                            operation,
                            count = stats.count,
                            p50_ms = stats.p50_ms,
                            p95_ms = stats.p95_ms,
                            max_ms = stats.max_ms,
                            "stage latency"
                        );
                    }
                }
                let purged = store.purge_expired();
                info!(
                    queue_depth = queue.len(),
                    dropped = queue.dropped_non_critical(),
                    shed = processor.shed_signals(),
                    skipped_ticks = processor.skipped_ticks(),
                    alerts = monitor.alerts().len(),
                    purged_keys = purged,
                    "pipeline health"
                );
            }
        })
    };

    // ── 8. Engine & delivery consumer ────────────────────────────────────
    let engine_task = tokio::spawn(processor.clone().run(tick_rx));

    let consumer_task = tokio::spawn(run_consumer(
        queue.clone(),
        Arc::new(LogSender),
        database.clone(),
        monitor.clone(),
    ));

    info!("all subsystems running — press Ctrl+C to stop");

    // ── 9. Supervision & graceful shutdown ───────────────────────────────
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            warn!("shutdown signal received — draining");
        }
        result = ws_task => {
            match result {
                Ok(Err(e)) => error!(error = %e, "WebSocket client stopped fatally"),
                Ok(Ok(())) => info!("WebSocket client closed"),
                Err(e) => error!(error = %e, "WebSocket task panicked"),
            }
        }
        result = engine_task => {
            match result {
                Ok(Err(e)) => error!(error = %e, "real-time processor stopped fatally"),
                Ok(Ok(())) => info!("real-time processor finished"),
                Err(e) => error!(error = %e, "engine task panicked"),
            }
        }
    }

    // Stop accepting new work, then let the consumer drain the queue.
    refresh_task.abort();
    metrics_task.abort();
    frame_task.abort();
    queue.close();
    if let Err(e) = consumer_task.await {
        warn!(error = %e, "notification consumer ended abnormally");
    }

    info!(
        skipped_ticks = processor.skipped_ticks(),
        shed_signals = processor.shed_signals(),
        malformed_frames = data_processor.malformed_count(),
        "PulseWatch shut down complete"
    );
    Ok(())
}
