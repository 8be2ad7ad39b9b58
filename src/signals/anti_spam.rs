// =============================================================================
// Anti-Spam Manager — per-user signal rate limits
// =============================================================================
//
// One sorted set of send timestamps per (user, symbol, timeframe, kind) under
// `signal_history:{user}:{symbol}:{timeframe}:{kind}`, TTL 24 h, score =
// epoch seconds. Appends are atomic sorted-set operations; there are no
// application-level locks around the permit check.
//
// Permit rule: critical signals always pass; otherwise the previous send for
// the key must be at least `repeat_interval(kind)` old AND the key must have
// fewer than the hourly cap of sends in the last hour.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::debug;

use crate::cache::store::Store;
use crate::types::{Signal, SignalKind};

/// Delivery-record retention.
const HISTORY_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const HISTORY_TTL_SECS: i64 = 24 * 60 * 60;

/// Minimum seconds between repeats of the same kind for one user/pair/tf.
const RSI_REPEAT_INTERVAL_SECS: i64 = 300;
const EMA_REPEAT_INTERVAL_SECS: i64 = 600;

/// Housekeeping runs every this many permits.
const CLEANUP_EVERY: u64 = 100;

/// Seconds between repeated sends of `kind` to one user.
pub fn repeat_interval_secs(kind: SignalKind) -> i64 {
    if kind.is_ema() {
        EMA_REPEAT_INTERVAL_SECS
    } else {
        RSI_REPEAT_INTERVAL_SECS
    }
}

pub struct AntiSpamManager {
    store: Arc<Store>,
    /// Per-user hourly send cap for one key.
    hourly_limit: u32,
    permit_count: AtomicU64,
}

impl AntiSpamManager {
    pub fn new(store: Arc<Store>, hourly_limit: u32) -> Self {
        Self {
            store,
            hourly_limit,
            permit_count: AtomicU64::new(0),
        }
    }

    fn key(user_id: i64, signal: &Signal) -> String {
        format!(
            "signal_history:{user_id}:{}:{}:{}",
            signal.symbol, signal.timeframe, signal.kind
        )
    }

    /// Whether `signal` may be sent to `user_id` right now.
    pub fn permits(&self, user_id: i64, signal: &Signal) -> bool {
        self.permits_at(user_id, signal, Utc::now().timestamp())
    }

    /// Clock-injected variant of [`AntiSpamManager::permits`].
    pub fn permits_at(&self, user_id: i64, signal: &Signal, now_secs: i64) -> bool {
        if signal.is_critical() {
            return true;
        }

        let key = Self::key(user_id, signal);
        if let Some((last_sent, _)) = self.store.zlast(&key) {
            if now_secs - last_sent < repeat_interval_secs(signal.kind) {
                return false;
            }
        }

        let hour_ago = now_secs - 3600;
        if self.store.zcount(&key, hour_ago, now_secs) >= self.hourly_limit as usize {
            debug!(user_id, kind = %signal.kind, "hourly send cap reached");
            return false;
        }
        true
    }

    /// Record a permitted send. Every [`CLEANUP_EVERY`] permits, entries older
    /// than 24 h are pruned for the key being written.
    pub fn record_sent(&self, user_id: i64, signal: &Signal) {
        self.record_sent_at(user_id, signal, Utc::now().timestamp());
    }

    pub fn record_sent_at(&self, user_id: i64, signal: &Signal, now_secs: i64) {
        let key = Self::key(user_id, signal);
        // The signal id keeps members unique even at equal timestamps.
        let member = format!("{}:{}:{}", signal.id, signal.kind, signal.price);
        self.store.zadd(&key, now_secs, &member, HISTORY_TTL);

        let permits = self.permit_count.fetch_add(1, Ordering::Relaxed) + 1;
        if permits % CLEANUP_EVERY == 0 {
            let removed = self
                .store
                .zremrangebyscore(&key, 0, now_secs - HISTORY_TTL_SECS);
            debug!(key, removed, "anti-spam housekeeping pass");
        }
    }

}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn manager() -> AntiSpamManager {
        AntiSpamManager::new(Arc::new(Store::new()), 10)
    }

    fn signal(kind: SignalKind, trigger: f64) -> Signal {
        Signal {
            id: Uuid::new_v4(),
            symbol: "BTCUSDT".into(),
            timeframe: "1m".into(),
            kind,
            trigger_value: trigger,
            price: 37000.0,
            produced_at: Utc::now(),
            processing_ms: 3,
            volume_change_pct: None,
        }
    }

    #[test]
    fn first_send_is_permitted_and_recorded() {
        let m = manager();
        let s = signal(SignalKind::RsiOversoldEntry, 28.5);
        let now = 1_000_000;

        assert!(m.permits_at(7, &s, now));
        m.record_sent_at(7, &s, now);
        assert_eq!(m.store.zcount(&AntiSpamManager::key(7, &s), now - 3600, now), 1);
    }

    #[test]
    fn repeat_inside_interval_is_blocked() {
        let m = manager();
        let s = signal(SignalKind::RsiOversoldEntry, 28.5);
        let now = 1_000_000;

        m.record_sent_at(7, &s, now);
        // 299 s later: still inside the 300 s RSI interval.
        assert!(!m.permits_at(7, &signal(SignalKind::RsiOversoldEntry, 27.0), now + 299));
        // 300 s later: permitted again.
        assert!(m.permits_at(7, &signal(SignalKind::RsiOversoldEntry, 27.0), now + 300));
    }

    #[test]
    fn ema_interval_is_ten_minutes() {
        let m = manager();
        let s = signal(SignalKind::EmaDeathCross, 99.0);
        let now = 1_000_000;

        m.record_sent_at(7, &s, now);
        assert!(!m.permits_at(7, &signal(SignalKind::EmaDeathCross, 99.0), now + 599));
        assert!(m.permits_at(7, &signal(SignalKind::EmaDeathCross, 99.0), now + 600));
    }

    #[test]
    fn critical_bypasses_the_interval() {
        let m = manager();
        let now = 1_000_000;
        m.record_sent_at(7, &signal(SignalKind::RsiOversoldEntry, 28.0), now);

        // RSI dropped to 12 sixty seconds after the last send: critical path.
        let extreme = signal(SignalKind::RsiStrongOversold, 12.0);
        assert!(extreme.is_critical());
        assert!(m.permits_at(7, &extreme, now + 60));

        // Golden cross is critical by kind.
        assert!(m.permits_at(7, &signal(SignalKind::EmaGoldenCross, 101.0), now + 1));
    }

    #[test]
    fn hourly_cap_blocks_even_spaced_sends() {
        let m = manager();
        let now = 1_000_000;

        // Ten sends spaced past the repeat interval fill the hourly cap.
        for i in 0..10 {
            let s = signal(SignalKind::RsiOversoldEntry, 28.0);
            let t = now + i * 301;
            assert!(m.permits_at(7, &s, t), "send {i} should pass");
            m.record_sent_at(7, &s, t);
        }

        let t = now + 10 * 301;
        assert!(!m.permits_at(7, &signal(SignalKind::RsiOversoldEntry, 28.0), t));

        // An hour after the first send the window slides open again.
        let much_later = now + 3601 + 9 * 301;
        assert!(m.permits_at(7, &signal(SignalKind::RsiOversoldEntry, 28.0), much_later));
    }

    #[test]
    fn keys_are_scoped_per_user_and_kind() {
        let m = manager();
        let now = 1_000_000;
        m.record_sent_at(7, &signal(SignalKind::RsiOversoldEntry, 28.0), now);

        // Another user is unaffected.
        assert!(m.permits_at(8, &signal(SignalKind::RsiOversoldEntry, 28.0), now + 1));
        // Another kind for the same user is unaffected.
        assert!(m.permits_at(7, &signal(SignalKind::RsiOverboughtEntry, 72.0), now + 1));
    }

    #[test]
    fn housekeeping_prunes_entries_older_than_a_day() {
        let m = manager();
        let s = signal(SignalKind::RsiOversoldEntry, 28.0);
        let old = 1_000_000;
        m.record_sent_at(7, &s, old);

        // Drive the permit counter to the housekeeping boundary with sends on
        // the same key, two days later.
        let now = old + 2 * HISTORY_TTL_SECS;
        for i in 0..(CLEANUP_EVERY - 1) {
            m.record_sent_at(7, &s, now + i as i64);
        }

        // The original entry predates the retention window and is gone.
        assert_eq!(
            m.store.zcount(&AntiSpamManager::key(7, &s), old, old),
            0,
            "stale entry should have been pruned"
        );
    }
}
