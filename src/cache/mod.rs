// =============================================================================
// Cache Layer
// =============================================================================
//
// Two caches share one TTL key-value store. Keys are colon-joined and follow
// a fixed grammar so that `invalidate(symbol, timeframe)` can sweep every key
// belonging to a series with a single pattern delete.

pub mod candle_cache;
pub mod indicator_cache;
pub mod store;

pub use candle_cache::CandleCache;
pub use indicator_cache::{IndicatorBatch, IndicatorCache};
pub use store::Store;
