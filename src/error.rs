// =============================================================================
// Error taxonomy for the alerting pipeline
// =============================================================================
//
// Classes map to distinct handling policies:
//   Transient  — retried within the stage budget, then counted as a skipped
//                tick; never fatal.
//   Malformed  — dropped + counted, logged at warn; never retried.
//   Invariant  — logged at error; the offending cached state is invalidated
//                and recomputed from history on the next tick.
//   Fatal      — surfaced to the supervisor; the core stops accepting ticks.
// =============================================================================

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Network / cache / DB hiccup. Retry within the stage budget, then skip.
    #[error("transient: {0}")]
    Transient(String),

    /// Input that failed validation (schema mismatch, NaN or non-positive
    /// prices). Dropped, never retried.
    #[error("malformed input: {0}")]
    Malformed(String),

    /// A computed value violated a domain invariant (RSI outside [0,100],
    /// negative average gain/loss).
    #[error("invariant violation: {0}")]
    Invariant(String),

    /// Unrecoverable condition: reconnect attempts exhausted, store gone,
    /// DB unreachable during fan-out.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl PipelineError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::Invariant(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    /// Whether the supervisor must stop the pipeline on this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_detection() {
        assert!(PipelineError::fatal("reconnect exhausted").is_fatal());
        assert!(!PipelineError::transient("cache miss").is_fatal());
        assert!(!PipelineError::malformed("bad kline").is_fatal());
        assert!(!PipelineError::invariant("rsi 104.2").is_fatal());
    }

    #[test]
    fn display_includes_class() {
        let e = PipelineError::malformed("price is zero");
        assert_eq!(e.to_string(), "malformed input: price is zero");
    }
}
