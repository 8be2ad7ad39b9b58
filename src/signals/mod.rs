// =============================================================================
// Signals Module
// =============================================================================
//
// Zone-crossing / crossover detection and the per-user anti-spam gate that
// sits between the evaluator and the notification queue.

pub mod anti_spam;
pub mod evaluator;

pub use anti_spam::AntiSpamManager;
pub use evaluator::SignalEvaluator;
