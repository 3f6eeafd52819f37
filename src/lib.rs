//! SpreadBot backend library.
//!
//! Cross-venue spot/perp delta-neutral arbitrage: feed ingestion and
//! per-venue order books, opportunity detection, the two-leg position
//! lifecycle, venue adapters and trade-event publishing. Exposed as a
//! library so binaries and integration tests compose the same pieces.

pub mod arbitrage;
pub mod config;
pub mod exchanges;
pub mod notify;
pub mod orderbook;
pub mod util;
