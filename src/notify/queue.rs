// =============================================================================
// Notification Queue — priority ordering, retry, backpressure
// =============================================================================
//
// Entries are ordered by (priority, enqueue sequence): critical signals
// (priority 0) always jump ahead of normal ones (priority 1), equal
// priorities drain FIFO. A single consumer pops entries and drives the
// delivery seam; failures retry with exponential backoff up to three
// attempts, and a terminal `UserBlocked` marks the user and never retries.
//
// Above the high-water mark the queue refuses non-critical entries so the
// evaluator sheds load instead of blocking the pipeline.
// =============================================================================

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::notify::sender::{SendError, SignalSender};
use crate::perf::{PerfMonitor, StageTimer};
use crate::types::Signal;

/// Delivery attempts per notification (first try included).
const MAX_DELIVERY_ATTEMPTS: u32 = 3;
/// First retry delay; doubles per attempt.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// Priority for critical signals.
pub const PRIORITY_CRITICAL: u8 = 0;
/// Priority for everything else.
pub const PRIORITY_NORMAL: u8 = 1;

/// One delivery waiting in the queue.
#[derive(Debug, Clone)]
pub struct QueuedNotification {
    pub user_id: i64,
    /// Row id in the signal history store, for the delivery-time update.
    pub history_id: Option<i64>,
    pub signal: Signal,
    pub message: String,
    pub priority: u8,
}

#[derive(Debug)]
struct QueueEntry {
    priority: u8,
    seq: u64,
    item: QueuedNotification,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for QueueEntry {}
impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.priority, self.seq).cmp(&(other.priority, other.seq))
    }
}

/// Sink for delivery outcomes the queue consumer reports back into.
#[async_trait]
pub trait DeliveryLog: Send + Sync {
    /// A notification reached the user after `delivery_ms`.
    async fn delivered(&self, history_id: Option<i64>, delivery_ms: u64);
    /// Terminal failure: the user blocked the bot and leaves future fan-out.
    async fn user_blocked(&self, user_id: i64);
}

pub struct NotificationQueue {
    heap: Mutex<BinaryHeap<Reverse<QueueEntry>>>,
    notify: Notify,
    seq: AtomicU64,
    high_water_mark: usize,
    dropped_non_critical: AtomicU64,
    closed: AtomicBool,
}

impl NotificationQueue {
    pub fn new(high_water_mark: usize) -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            seq: AtomicU64::new(0),
            high_water_mark,
            dropped_non_critical: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueue a notification. Non-critical entries are refused once the
    /// queue sits at the high-water mark; returns whether the entry was
    /// accepted.
    pub fn try_enqueue(&self, item: QueuedNotification) -> bool {
        let mut heap = self.heap.lock();
        if item.priority != PRIORITY_CRITICAL && heap.len() >= self.high_water_mark {
            drop(heap);
            self.dropped_non_critical.fetch_add(1, Ordering::Relaxed);
            warn!(
                user_id = item.user_id,
                kind = %item.signal.kind,
                "queue at high-water mark, non-critical signal dropped"
            );
            return false;
        }
        let entry = QueueEntry {
            priority: item.priority,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            item,
        };
        heap.push(Reverse(entry));
        drop(heap);
        self.notify.notify_one();
        true
    }

    /// Wait for the next entry. Returns `None` once the queue is closed and
    /// fully drained.
    pub async fn pop(&self) -> Option<QueuedNotification> {
        loop {
            let notified = self.notify.notified();
            if let Some(Reverse(entry)) = self.heap.lock().pop() {
                return Some(entry.item);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    /// Stop accepting the consumer loop after the queue drains.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    /// Whether the queue sits at or above its high-water mark. The evaluator
    /// consults this to shed non-critical signals under load.
    pub fn is_saturated(&self) -> bool {
        self.heap.lock().len() >= self.high_water_mark
    }

    pub fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }

    pub fn dropped_non_critical(&self) -> u64 {
        self.dropped_non_critical.load(Ordering::Relaxed)
    }
}

/// Drive one delivery with exponential-backoff retries.
///
/// `UserBlocked` is terminal and returned immediately; transient errors retry
/// up to [`MAX_DELIVERY_ATTEMPTS`] with delays of `base_delay * 2^n`.
pub async fn deliver_with_retry(
    sender: &dyn SignalSender,
    user_id: i64,
    message: &str,
    base_delay: Duration,
) -> Result<u64, SendError> {
    let mut delay = base_delay;
    let mut last_error = None;
    for attempt in 1..=MAX_DELIVERY_ATTEMPTS {
        match sender.send(user_id, message).await {
            Ok(latency_ms) => return Ok(latency_ms),
            Err(SendError::UserBlocked) => return Err(SendError::UserBlocked),
            Err(e) => {
                warn!(user_id, attempt, error = %e, "delivery attempt failed");
                last_error = Some(e);
                if attempt < MAX_DELIVERY_ATTEMPTS {
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }
    Err(last_error.unwrap_or_else(|| SendError::Transient("no attempts made".into())))
}

/// Single consumer loop: drains the queue into the delivery seam and reports
/// outcomes. Returns once the queue is closed and empty.
pub async fn run_consumer(
    queue: Arc<NotificationQueue>,
    sender: Arc<dyn SignalSender>,
    log: Arc<dyn DeliveryLog>,
    monitor: Arc<PerfMonitor>,
) {
    info!("notification consumer started");
    while let Some(item) = queue.pop().await {
        let timer = StageTimer::start(&monitor, "notification_delivery");
        match deliver_with_retry(sender.as_ref(), item.user_id, &item.message, RETRY_BASE_DELAY)
            .await
        {
            Ok(latency_ms) => {
                log.delivered(item.history_id, latency_ms).await;
            }
            Err(SendError::UserBlocked) => {
                warn!(user_id = item.user_id, "user blocked the bot, removing from fan-out");
                log.user_blocked(item.user_id).await;
            }
            Err(e) => {
                warn!(
                    user_id = item.user_id,
                    kind = %item.signal.kind,
                    error = %e,
                    "delivery abandoned after retries"
                );
            }
        }
        drop(timer);
    }
    info!("notification consumer drained");
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SignalKind;
    use chrono::Utc;
    use parking_lot::Mutex as PlMutex;
    use uuid::Uuid;

    fn notification(user_id: i64, priority: u8) -> QueuedNotification {
        QueuedNotification {
            user_id,
            history_id: None,
            signal: Signal {
                id: Uuid::new_v4(),
                symbol: "BTCUSDT".into(),
                timeframe: "1m".into(),
                kind: SignalKind::RsiOversoldEntry,
                trigger_value: 28.0,
                price: 37000.0,
                produced_at: Utc::now(),
                processing_ms: 2,
                volume_change_pct: None,
            },
            message: "msg".into(),
            priority,
        }
    }

    #[tokio::test]
    async fn critical_jumps_the_queue() {
        let q = NotificationQueue::new(100);
        q.try_enqueue(notification(1, PRIORITY_NORMAL));
        q.try_enqueue(notification(2, PRIORITY_NORMAL));
        q.try_enqueue(notification(3, PRIORITY_CRITICAL));

        assert_eq!(q.pop().await.unwrap().user_id, 3);
        assert_eq!(q.pop().await.unwrap().user_id, 1);
        assert_eq!(q.pop().await.unwrap().user_id, 2);
    }

    #[tokio::test]
    async fn equal_priority_drains_fifo() {
        let q = NotificationQueue::new(100);
        for user in 1..=5 {
            q.try_enqueue(notification(user, PRIORITY_NORMAL));
        }
        for user in 1..=5 {
            assert_eq!(q.pop().await.unwrap().user_id, user);
        }
    }

    #[tokio::test]
    async fn high_water_mark_sheds_non_critical_only() {
        let q = NotificationQueue::new(2);
        assert!(q.try_enqueue(notification(1, PRIORITY_NORMAL)));
        assert!(q.try_enqueue(notification(2, PRIORITY_NORMAL)));
        // Full: non-critical refused, critical still accepted.
        assert!(!q.try_enqueue(notification(3, PRIORITY_NORMAL)));
        assert!(q.try_enqueue(notification(4, PRIORITY_CRITICAL)));
        assert_eq!(q.dropped_non_critical(), 1);
        assert_eq!(q.len(), 3);
    }

    #[tokio::test]
    async fn close_drains_then_ends() {
        let q = Arc::new(NotificationQueue::new(10));
        q.try_enqueue(notification(1, PRIORITY_NORMAL));
        q.close();
        assert!(q.pop().await.is_some());
        assert!(q.pop().await.is_none());
    }

    // ---- delivery retries --------------------------------------------------

    struct FlakySender {
        failures_before_success: PlMutex<u32>,
        calls: PlMutex<u32>,
    }

    #[async_trait]
    impl SignalSender for FlakySender {
        async fn send(&self, _user_id: i64, _message: &str) -> Result<u64, SendError> {
            *self.calls.lock() += 1;
            let mut remaining = self.failures_before_success.lock();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(SendError::Transient("socket reset".into()));
            }
            Ok(7)
        }
    }

    struct BlockedSender;

    #[async_trait]
    impl SignalSender for BlockedSender {
        async fn send(&self, _user_id: i64, _message: &str) -> Result<u64, SendError> {
            Err(SendError::UserBlocked)
        }
    }

    #[tokio::test]
    async fn transient_failures_retry_then_succeed() {
        let sender = FlakySender {
            failures_before_success: PlMutex::new(2),
            calls: PlMutex::new(0),
        };
        let result =
            deliver_with_retry(&sender, 7, "msg", Duration::from_millis(1)).await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(*sender.calls.lock(), 3);
    }

    #[tokio::test]
    async fn retries_give_up_after_three_attempts() {
        let sender = FlakySender {
            failures_before_success: PlMutex::new(10),
            calls: PlMutex::new(0),
        };
        let result =
            deliver_with_retry(&sender, 7, "msg", Duration::from_millis(1)).await;
        assert!(matches!(result, Err(SendError::Transient(_))));
        assert_eq!(*sender.calls.lock(), 3);
    }

    #[tokio::test]
    async fn blocked_user_is_terminal_without_retry() {
        let sender = BlockedSender;
        let result =
            deliver_with_retry(&sender, 7, "msg", Duration::from_millis(1)).await;
        assert!(matches!(result, Err(SendError::UserBlocked)));
    }

    // ---- consumer loop -----------------------------------------------------

    #[derive(Default)]
    struct RecordingLog {
        delivered: PlMutex<Vec<(Option<i64>, u64)>>,
        blocked: PlMutex<Vec<i64>>,
    }

    #[async_trait]
    impl DeliveryLog for RecordingLog {
        async fn delivered(&self, history_id: Option<i64>, delivery_ms: u64) {
            self.delivered.lock().push((history_id, delivery_ms));
        }
        async fn user_blocked(&self, user_id: i64) {
            self.blocked.lock().push(user_id);
        }
    }

    #[tokio::test]
    async fn consumer_reports_outcomes() {
        let queue = Arc::new(NotificationQueue::new(10));
        let sender = Arc::new(FlakySender {
            failures_before_success: PlMutex::new(0),
            calls: PlMutex::new(0),
        });
        let log = Arc::new(RecordingLog::default());
        let monitor = Arc::new(PerfMonitor::new(std::collections::HashMap::new()));

        let mut item = notification(7, PRIORITY_NORMAL);
        item.history_id = Some(42);
        queue.try_enqueue(item);
        queue.close();

        run_consumer(queue, sender, log.clone(), monitor).await;
        assert_eq!(log.delivered.lock().as_slice(), &[(Some(42), 7)]);
        assert!(log.blocked.lock().is_empty());
    }

    #[tokio::test]
    async fn consumer_marks_blocked_users() {
        let queue = Arc::new(NotificationQueue::new(10));
        let log = Arc::new(RecordingLog::default());
        let monitor = Arc::new(PerfMonitor::new(std::collections::HashMap::new()));

        queue.try_enqueue(notification(9, PRIORITY_NORMAL));
        queue.close();

        run_consumer(queue, Arc::new(BlockedSender), log.clone(), monitor).await;
        assert_eq!(log.blocked.lock().as_slice(), &[9]);
        assert!(log.delivered.lock().is_empty());
    }
}
