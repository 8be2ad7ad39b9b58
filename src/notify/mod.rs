// =============================================================================
// Notification Module
// =============================================================================
//
// Outbound side of the pipeline: the priority queue the fan-out stage feeds
// and the abstract delivery seam the consumer drains into.

pub mod queue;
pub mod sender;

pub use queue::{NotificationQueue, QueuedNotification};
pub use sender::{format_signal_message, SendError, SignalSender};
