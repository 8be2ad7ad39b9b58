// =============================================================================
// Market Data Module
// =============================================================================
//
// Ingest side of the pipeline: kline frame parsing, the exchange WebSocket
// client, and the data processor that turns validated frames into ticks.

pub mod candle;
pub mod processor;
pub mod rest;
pub mod ws_client;

pub use candle::Candle;
pub use processor::DataProcessor;
pub use rest::RestClient;
pub use ws_client::{ConnectionState, WsClient};
