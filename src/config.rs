// =============================================================================
// Runtime Configuration — hot-reloadable engine settings with atomic save
// =============================================================================
//
// Every tunable parameter of the alerting core lives here. Persistence uses
// an atomic tmp + rename pattern to prevent corruption on crash. All fields
// carry `#[serde(default)]` so that adding new fields never breaks loading an
// older config file.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_ws_url() -> String {
    "wss://stream.binance.com:9443/ws".to_string()
}

fn default_api_url() -> String {
    "https://api.binance.com".to_string()
}

fn default_timeframes() -> Vec<String> {
    vec!["1m".into(), "5m".into(), "15m".into(), "1h".into(), "4h".into(), "1d".into()]
}

fn default_rsi_period() -> u32 {
    14
}

fn default_rsi_oversold_strong() -> f64 {
    20.0
}

fn default_rsi_oversold() -> f64 {
    30.0
}

fn default_rsi_overbought() -> f64 {
    70.0
}

fn default_rsi_overbought_strong() -> f64 {
    80.0
}

fn default_ping_interval_secs() -> u64 {
    20
}

fn default_reconnect_max_attempts() -> u32 {
    5
}

fn default_reconnect_max_delay_secs() -> u64 {
    60
}

fn default_subscription_update_interval_secs() -> u64 {
    60
}

fn default_notification_rate_limit() -> u32 {
    10
}

fn default_max_pairs_per_user() -> u32 {
    50
}

fn default_max_real_time_pairs() -> u32 {
    20
}

fn default_queue_high_water_mark() -> usize {
    1000
}

fn default_database_url() -> String {
    "sqlite://pulsewatch.db".to_string()
}

fn default_stage_budgets_ms() -> HashMap<String, u64> {
    let mut budgets = HashMap::new();
    budgets.insert("websocket_processing".into(), 10);
    budgets.insert("rsi_calculation".into(), 100);
    budgets.insert("ema_calculation".into(), 50);
    budgets.insert("signal_generation".into(), 200);
    budgets.insert("notification_delivery".into(), 500);
    budgets.insert("total_processing".into(), 1000);
    budgets
}

// =============================================================================
// RSI zone thresholds
// =============================================================================

/// Zone thresholds for the RSI signal evaluator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RsiZones {
    #[serde(default = "default_rsi_oversold_strong")]
    pub oversold_strong: f64,
    #[serde(default = "default_rsi_oversold")]
    pub oversold: f64,
    #[serde(default = "default_rsi_overbought")]
    pub overbought: f64,
    #[serde(default = "default_rsi_overbought_strong")]
    pub overbought_strong: f64,
}

impl Default for RsiZones {
    fn default() -> Self {
        Self {
            oversold_strong: default_rsi_oversold_strong(),
            oversold: default_rsi_oversold(),
            overbought: default_rsi_overbought(),
            overbought_strong: default_rsi_overbought_strong(),
        }
    }
}

// =============================================================================
// AppConfig
// =============================================================================

/// Top-level runtime configuration for the PulseWatch core.
///
/// Every field has a serde default so that older JSON files missing new
/// fields still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    // --- Master switches -----------------------------------------------------

    /// Master switch for the whole real-time pipeline.
    #[serde(default = "default_true")]
    pub real_time_enabled: bool,

    // --- Exchange endpoints --------------------------------------------------

    #[serde(default = "default_ws_url")]
    pub websocket_url: String,

    #[serde(default = "default_api_url")]
    pub api_url: String,

    // --- Streams -------------------------------------------------------------

    /// Timeframes auto-subscribed for new users.
    #[serde(default = "default_timeframes")]
    pub default_timeframes: Vec<String>,

    // --- Indicators ----------------------------------------------------------

    #[serde(default = "default_rsi_period")]
    pub rsi_period: u32,

    #[serde(default)]
    pub rsi_zones: RsiZones,

    // --- WebSocket health ----------------------------------------------------

    /// Liveness probe interval in seconds.
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,

    #[serde(default = "default_reconnect_max_attempts")]
    pub reconnect_max_attempts: u32,

    /// Backoff delay ceiling in seconds.
    #[serde(default = "default_reconnect_max_delay_secs")]
    pub reconnect_max_delay_secs: u64,

    // --- Fan-out -------------------------------------------------------------

    /// How often the fan-out subscription index is refreshed, in seconds.
    #[serde(default = "default_subscription_update_interval_secs")]
    pub subscription_update_interval_secs: u64,

    /// Per-user per-hour send cap enforced by anti-spam.
    #[serde(default = "default_notification_rate_limit")]
    pub notification_rate_limit: u32,

    // --- Admission limits ----------------------------------------------------

    #[serde(default = "default_max_pairs_per_user")]
    pub max_pairs_per_user: u32,

    #[serde(default = "default_max_real_time_pairs")]
    pub max_real_time_pairs: u32,

    // --- Backpressure --------------------------------------------------------

    /// Above this queue depth the evaluator drops non-critical signals.
    #[serde(default = "default_queue_high_water_mark")]
    pub queue_high_water_mark: usize,

    // --- Persistence ---------------------------------------------------------

    #[serde(default = "default_database_url")]
    pub database_url: String,

    // --- Per-stage latency budgets (alert thresholds derive from these) ------

    #[serde(default = "default_stage_budgets_ms")]
    pub stage_budgets_ms: HashMap<String, u64>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            real_time_enabled: true,
            websocket_url: default_ws_url(),
            api_url: default_api_url(),
            default_timeframes: default_timeframes(),
            rsi_period: default_rsi_period(),
            rsi_zones: RsiZones::default(),
            ping_interval_secs: default_ping_interval_secs(),
            reconnect_max_attempts: default_reconnect_max_attempts(),
            reconnect_max_delay_secs: default_reconnect_max_delay_secs(),
            subscription_update_interval_secs: default_subscription_update_interval_secs(),
            notification_rate_limit: default_notification_rate_limit(),
            max_pairs_per_user: default_max_pairs_per_user(),
            max_real_time_pairs: default_max_real_time_pairs(),
            queue_high_water_mark: default_queue_high_water_mark(),
            database_url: default_database_url(),
            stage_budgets_ms: default_stage_budgets_ms(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let mut config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        config.default_timeframes.retain(|tf| {
            let ok = crate::timeframe::is_valid_timeframe(tf);
            if !ok {
                warn!(timeframe = %tf, "dropping invalid timeframe from config");
            }
            ok
        });

        info!(
            path = %path.display(),
            timeframes = ?config.default_timeframes,
            rsi_period = config.rsi_period,
            "config loaded"
        );

        Ok(config)
    }

    /// Apply environment overrides on top of the loaded values.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("PULSEWATCH_DATABASE_URL") {
            self.database_url = url;
        }
        if let Ok(url) = std::env::var("PULSEWATCH_WS_URL") {
            self.websocket_url = url;
        }
        if let Ok(v) = std::env::var("PULSEWATCH_REAL_TIME_ENABLED") {
            self.real_time_enabled = v == "1" || v.eq_ignore_ascii_case("true");
        }
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename). Prevents corruption if the process
    /// crashes mid-write.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "config saved (atomic)");
        Ok(())
    }

    /// Latency budget for a pipeline stage, if configured.
    pub fn stage_budget_ms(&self, operation: &str) -> Option<u64> {
        self.stage_budgets_ms.get(operation).copied()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = AppConfig::default();
        assert!(cfg.real_time_enabled);
        assert_eq!(cfg.rsi_period, 14);
        assert_eq!(cfg.ping_interval_secs, 20);
        assert_eq!(cfg.reconnect_max_attempts, 5);
        assert_eq!(cfg.reconnect_max_delay_secs, 60);
        assert_eq!(cfg.notification_rate_limit, 10);
        assert_eq!(cfg.default_timeframes.len(), 6);
        assert!((cfg.rsi_zones.oversold - 30.0).abs() < f64::EPSILON);
        assert!((cfg.rsi_zones.overbought_strong - 80.0).abs() < f64::EPSILON);
        assert_eq!(cfg.stage_budget_ms("rsi_calculation"), Some(100));
        assert_eq!(cfg.stage_budget_ms("total_processing"), Some(1000));
        assert_eq!(cfg.stage_budget_ms("unknown_op"), None);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: AppConfig = serde_json::from_str("{}").unwrap();
        assert!(cfg.real_time_enabled);
        assert_eq!(cfg.rsi_period, 14);
        assert_eq!(cfg.queue_high_water_mark, 1000);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "rsi_period": 21, "default_timeframes": ["1m"] }"#;
        let cfg: AppConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.rsi_period, 21);
        assert_eq!(cfg.default_timeframes, vec!["1m"]);
        assert_eq!(cfg.ping_interval_secs, 20);
    }

    #[test]
    fn save_then_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut cfg = AppConfig::default();
        cfg.rsi_period = 21;
        cfg.rsi_zones.oversold = 25.0;
        cfg.save(&path).unwrap();

        let loaded = AppConfig::load(&path).unwrap();
        assert_eq!(loaded.rsi_period, 21);
        assert!((loaded.rsi_zones.oversold - 25.0).abs() < f64::EPSILON);
        assert_eq!(loaded.default_timeframes, cfg.default_timeframes);
    }

    #[test]
    fn load_missing_file_is_an_error() {
        assert!(AppConfig::load("/nonexistent/pulsewatch.json").is_err());
    }

    #[test]
    fn invalid_timeframes_are_dropped_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "default_timeframes": ["1m", "7x", "1h"] }"#).unwrap();

        let cfg = AppConfig::load(&path).unwrap();
        assert_eq!(cfg.default_timeframes, vec!["1m", "1h"]);
    }
}
