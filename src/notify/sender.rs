// =============================================================================
// Delivery seam — abstract sender and message formatting
// =============================================================================
//
// The core never talks to a chat transport directly: it publishes
// (user, formatted message, priority) through [`SignalSender`]. The production
// transport lives outside this crate; tests plug in recording fakes.
// =============================================================================

use async_trait::async_trait;
use thiserror::Error;

use crate::types::Signal;

/// Budget the processing footer grades against (the signal-generation
/// target).
const PROCESSING_TARGET_MS: u64 = 200;

#[derive(Debug, Error)]
pub enum SendError {
    /// Terminal: the user blocked the bot. No retry; the user is removed from
    /// future fan-out.
    #[error("user blocked the bot")]
    UserBlocked,

    /// Anything that may succeed on retry.
    #[error("delivery failed: {0}")]
    Transient(String),
}

/// Outbound delivery interface. Returns the delivery latency in milliseconds
/// on success.
#[async_trait]
pub trait SignalSender: Send + Sync {
    async fn send(&self, user_id: i64, message: &str) -> Result<u64, SendError>;
}

/// Marker reflecting how the pipeline performed against its budget.
fn performance_marker(elapsed_ms: u64, target_ms: u64) -> &'static str {
    if target_ms == 0 {
        return "⏱";
    }
    let ratio = elapsed_ms as f64 / target_ms as f64;
    if ratio <= 1.0 {
        "✅"
    } else if ratio <= 1.5 {
        "⚠️"
    } else {
        "🚨"
    }
}

/// Human-readable alert message: header, price section, processing footer.
pub fn format_signal_message(signal: &Signal) -> String {
    let mut message = format!(
        "🚨 {} — {} ({})",
        signal.kind, signal.symbol, signal.timeframe
    );

    if signal.kind.is_rsi() {
        message.push_str(&format!("\n📈 RSI: {:.1}", signal.trigger_value));
    }
    message.push_str(&format!("\n💰 Price: {}", signal.price));
    if let Some(volume) = signal.volume_change_pct {
        message.push_str(&format!("\n📊 Volume: {volume:+.1}%"));
    }
    message.push_str(&format!(
        "\n⚡ Processing: {}ms {}",
        signal.processing_ms,
        performance_marker(signal.processing_ms, PROCESSING_TARGET_MS)
    ));
    message
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SignalKind;
    use chrono::Utc;
    use uuid::Uuid;

    fn signal(kind: SignalKind) -> Signal {
        Signal {
            id: Uuid::new_v4(),
            symbol: "BTCUSDT".into(),
            timeframe: "1m".into(),
            kind,
            trigger_value: 28.5,
            price: 37000.0,
            produced_at: Utc::now(),
            processing_ms: 12,
            volume_change_pct: None,
        }
    }

    #[test]
    fn rsi_message_has_all_sections() {
        let msg = format_signal_message(&signal(SignalKind::RsiOversoldEntry));
        assert!(msg.contains("rsi_oversold_entry"));
        assert!(msg.contains("BTCUSDT (1m)"));
        assert!(msg.contains("RSI: 28.5"));
        assert!(msg.contains("Price: 37000"));
        assert!(msg.contains("Processing: 12ms ✅"));
    }

    #[test]
    fn ema_message_skips_the_rsi_section() {
        let msg = format_signal_message(&signal(SignalKind::EmaGoldenCross));
        assert!(msg.contains("ema_golden_cross"));
        assert!(!msg.contains("RSI:"));
    }

    #[test]
    fn volume_section_appears_when_cached() {
        let mut s = signal(SignalKind::RsiOversoldEntry);
        s.volume_change_pct = Some(12.34);
        let msg = format_signal_message(&s);
        assert!(msg.contains("Volume: +12.3%"));
    }

    #[test]
    fn slow_pipelines_get_flagged() {
        assert_eq!(performance_marker(100, 200), "✅");
        assert_eq!(performance_marker(250, 200), "⚠️");
        assert_eq!(performance_marker(450, 200), "🚨");
    }
}
