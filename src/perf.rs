// =============================================================================
// Performance Monitor — per-stage latency histograms and threshold alerts
// =============================================================================
//
// Every pipeline stage has a latency budget. Recorded durations feed a
// per-operation histogram (p50 / p95 / max); breaching 1.5x the budget emits
// a warning alert, 2.0x a critical one. Alerts are observational, never flow
// control, and are rate-limited to one per operation per minute.
//
// Measurement is an explicit scoped guard ([`StageTimer`]) that publishes on
// drop, so a stage cannot forget to report its exit path.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, warn};

/// Alert thresholds as multiples of the stage budget.
const WARNING_FACTOR: f64 = 1.5;
const CRITICAL_FACTOR: f64 = 2.0;

/// Minimum spacing between alerts for one operation.
const ALERT_COOLDOWN: Duration = Duration::from_secs(60);

/// Samples retained per operation.
const MAX_SAMPLES: usize = 1024;
/// Alerts retained for inspection.
const MAX_ALERTS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AlertLevel {
    Warning,
    Critical,
}

/// A budget-breach alert.
#[derive(Debug, Clone, Serialize)]
pub struct PerfAlert {
    pub operation: String,
    pub level: AlertLevel,
    pub elapsed_ms: u64,
    pub budget_ms: u64,
}

/// Histogram summary for one operation.
#[derive(Debug, Clone, Serialize)]
pub struct OpStats {
    pub count: usize,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub max_ms: u64,
}

struct OpRecord {
    samples: Vec<u64>,
    last_alert: Option<Instant>,
}

pub struct PerfMonitor {
    budgets_ms: HashMap<String, u64>,
    ops: Mutex<HashMap<String, OpRecord>>,
    alerts: Mutex<Vec<PerfAlert>>,
}

impl PerfMonitor {
    pub fn new(budgets_ms: HashMap<String, u64>) -> Self {
        Self {
            budgets_ms,
            ops: Mutex::new(HashMap::new()),
            alerts: Mutex::new(Vec::new()),
        }
    }

    /// Record one measurement and evaluate the alert thresholds.
    pub fn record(&self, operation: &str, elapsed_ms: u64) {
        let mut ops = self.ops.lock();
        let record = ops.entry(operation.to_string()).or_insert_with(|| OpRecord {
            samples: Vec::new(),
            last_alert: None,
        });
        record.samples.push(elapsed_ms);
        if record.samples.len() > MAX_SAMPLES {
            let excess = record.samples.len() - MAX_SAMPLES;
            record.samples.drain(..excess);
        }

        let Some(&budget) = self.budgets_ms.get(operation) else {
            return;
        };

        let level = if elapsed_ms as f64 > budget as f64 * CRITICAL_FACTOR {
            Some(AlertLevel::Critical)
        } else if elapsed_ms as f64 > budget as f64 * WARNING_FACTOR {
            Some(AlertLevel::Warning)
        } else {
            None
        };
        let Some(level) = level else { return };

        // One alert per operation per minute.
        let now = Instant::now();
        if record
            .last_alert
            .is_some_and(|last| now.duration_since(last) < ALERT_COOLDOWN)
        {
            return;
        }
        record.last_alert = Some(now);
        drop(ops);

        let alert = PerfAlert {
            operation: operation.to_string(),
            level,
            elapsed_ms,
            budget_ms: budget,
        };
        match level {
            AlertLevel::Critical => error!(
                operation,
                elapsed_ms, budget_ms = budget, "stage exceeded 2x latency budget"
            ),
            AlertLevel::Warning => warn!(
                operation,
                elapsed_ms, budget_ms = budget, "stage exceeded 1.5x latency budget"
            ),
        }

        let mut alerts = self.alerts.lock();
        alerts.push(alert);
        if alerts.len() > MAX_ALERTS {
            let excess = alerts.len() - MAX_ALERTS;
            alerts.drain(..excess);
        }
    }

    /// Histogram summary for one operation.
    pub fn stats(&self, operation: &str) -> Option<OpStats> {
        let ops = self.ops.lock();
        let record = ops.get(operation)?;
        if record.samples.is_empty() {
            return None;
        }
        let mut sorted = record.samples.clone();
        sorted.sort_unstable();
        let pct = |p: f64| -> u64 {
            let idx = ((sorted.len() as f64 * p).ceil() as usize).saturating_sub(1);
            sorted[idx.min(sorted.len() - 1)]
        };
        Some(OpStats {
            count: sorted.len(),
            p50_ms: pct(0.50),
            p95_ms: pct(0.95),
            max_ms: *sorted.last().expect("non-empty"),
        })
    }

    /// Alerts emitted so far (oldest first).
    pub fn alerts(&self) -> Vec<PerfAlert> {
        self.alerts.lock().clone()
    }

    pub fn alert_count(&self, operation: &str) -> usize {
        self.alerts
            .lock()
            .iter()
            .filter(|a| a.operation == operation)
            .count()
    }
}

// =============================================================================
// StageTimer — scoped measurement guard
// =============================================================================

/// Measures the enclosing scope and publishes to the monitor on drop.
///
/// ```ignore
/// {
///     let _timer = StageTimer::start(&monitor, "rsi_calculation");
///     // ... stage work ...
/// } // records here
/// ```
pub struct StageTimer {
    monitor: Arc<PerfMonitor>,
    operation: &'static str,
    start: Instant,
}

impl StageTimer {
    pub fn start(monitor: &Arc<PerfMonitor>, operation: &'static str) -> Self {
        Self {
            monitor: monitor.clone(),
            operation,
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

impl Drop for StageTimer {
    fn drop(&mut self) {
        self.monitor.record(self.operation, self.elapsed_ms());
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> Arc<PerfMonitor> {
        let mut budgets = HashMap::new();
        budgets.insert("rsi_calculation".to_string(), 100u64);
        budgets.insert("ema_calculation".to_string(), 50u64);
        Arc::new(PerfMonitor::new(budgets))
    }

    #[test]
    fn stats_percentiles() {
        let m = monitor();
        for ms in 1..=100u64 {
            m.record("rsi_calculation", ms);
        }
        let stats = m.stats("rsi_calculation").unwrap();
        assert_eq!(stats.count, 100);
        assert_eq!(stats.p50_ms, 50);
        assert_eq!(stats.p95_ms, 95);
        assert_eq!(stats.max_ms, 100);
    }

    #[test]
    fn no_alert_within_budget() {
        let m = monitor();
        m.record("rsi_calculation", 100);
        m.record("rsi_calculation", 149); // below 1.5x
        assert_eq!(m.alert_count("rsi_calculation"), 0);
    }

    #[test]
    fn warning_and_critical_levels() {
        let m = monitor();
        m.record("rsi_calculation", 151); // 1.5x < x <= 2x
        let alerts = m.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].level, AlertLevel::Warning);

        m.record("ema_calculation", 250); // > 2x of 50
        let alerts = m.alerts();
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[1].level, AlertLevel::Critical);
    }

    #[test]
    fn alerts_rate_limited_per_operation() {
        let m = monitor();
        // A 250 ms RSI run breaches the 100 ms budget.
        m.record("rsi_calculation", 250);
        // Repeated breaches inside the cooldown stay silent.
        m.record("rsi_calculation", 250);
        m.record("rsi_calculation", 300);
        assert_eq!(m.alert_count("rsi_calculation"), 1);

        // A different operation alerts independently.
        m.record("ema_calculation", 200);
        assert_eq!(m.alert_count("ema_calculation"), 1);
    }

    #[test]
    fn unknown_operation_records_without_alerting() {
        let m = monitor();
        m.record("exotic_op", 10_000);
        assert_eq!(m.alert_count("exotic_op"), 0);
        assert_eq!(m.stats("exotic_op").unwrap().count, 1);
    }

    #[test]
    fn stage_timer_records_on_drop() {
        let m = monitor();
        {
            let _timer = StageTimer::start(&m, "rsi_calculation");
        }
        assert_eq!(m.stats("rsi_calculation").unwrap().count, 1);
    }

    #[test]
    fn sample_window_is_bounded() {
        let m = monitor();
        for _ in 0..(MAX_SAMPLES + 100) {
            m.record("rsi_calculation", 1);
        }
        assert_eq!(m.stats("rsi_calculation").unwrap().count, MAX_SAMPLES);
    }
}
