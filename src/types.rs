// =============================================================================
// Shared types used across the PulseWatch alerting core
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// RSI extremes below/above which any RSI signal is treated as critical.
pub const RSI_CRITICAL_LOW: f64 = 15.0;
pub const RSI_CRITICAL_HIGH: f64 = 85.0;

/// The signal kinds the evaluator can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    RsiOversoldEntry,
    RsiOversoldExit,
    RsiOverboughtEntry,
    RsiOverboughtExit,
    RsiStrongOversold,
    RsiStrongOverbought,
    EmaGoldenCross,
    EmaDeathCross,
}

impl SignalKind {
    /// Wire / storage name (matches the serde representation).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RsiOversoldEntry => "rsi_oversold_entry",
            Self::RsiOversoldExit => "rsi_oversold_exit",
            Self::RsiOverboughtEntry => "rsi_overbought_entry",
            Self::RsiOverboughtExit => "rsi_overbought_exit",
            Self::RsiStrongOversold => "rsi_strong_oversold",
            Self::RsiStrongOverbought => "rsi_strong_overbought",
            Self::EmaGoldenCross => "ema_golden_cross",
            Self::EmaDeathCross => "ema_death_cross",
        }
    }

    pub fn is_rsi(&self) -> bool {
        matches!(
            self,
            Self::RsiOversoldEntry
                | Self::RsiOversoldExit
                | Self::RsiOverboughtEntry
                | Self::RsiOverboughtExit
                | Self::RsiStrongOversold
                | Self::RsiStrongOverbought
        )
    }

    pub fn is_ema(&self) -> bool {
        matches!(self, Self::EmaGoldenCross | Self::EmaDeathCross)
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A vetted alert emitted by the signal evaluator, consumed once by fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub id: Uuid,
    pub symbol: String,
    pub timeframe: String,
    pub kind: SignalKind,
    /// The indicator value that triggered the signal (RSI value, or the short
    /// EMA at the cross).
    pub trigger_value: f64,
    pub price: f64,
    pub produced_at: DateTime<Utc>,
    /// Time spent in the pipeline up to emission.
    pub processing_ms: u64,
    /// Cached volume-change percentage, when available. Informational only.
    pub volume_change_pct: Option<f64>,
}

impl Signal {
    /// Critical signals bypass anti-spam: a golden cross, or any RSI kind at
    /// an extreme reading.
    pub fn is_critical(&self) -> bool {
        match self.kind {
            SignalKind::EmaGoldenCross => true,
            k if k.is_rsi() => {
                self.trigger_value < RSI_CRITICAL_LOW || self.trigger_value > RSI_CRITICAL_HIGH
            }
            _ => false,
        }
    }
}

/// One processed closed-candle event for a (symbol, timeframe).
#[derive(Debug, Clone)]
pub struct Tick {
    pub symbol: String,
    pub timeframe: String,
    pub close: rust_decimal::Decimal,
    pub volume: rust_decimal::Decimal,
    pub close_time_ms: i64,
}
