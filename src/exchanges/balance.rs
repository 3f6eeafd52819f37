//! Process-wide balance snapshots used for profit accounting.
//!
//! Adapters record the available USDT balance of the relevant sub-account
//! before opening a leg; closing the leg reads the live balance again and
//! reports the delta as that leg's realised profit. The store is partitioned
//! by `(venue, market)` with one lock per partition so concurrent legs on
//! different venues never contend.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

/// Market segment a balance belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Market {
    Spot,
    Futures,
}

impl Market {
    pub fn as_str(&self) -> &'static str {
        match self {
            Market::Spot => "spot",
            Market::Futures => "futures",
        }
    }
}

type AssetBalances = HashMap<String, f64>;

/// Snapshot store keyed by `(venue, market)`, then asset.
#[derive(Default)]
pub struct BalanceBook {
    partitions: Mutex<HashMap<(String, Market), Arc<RwLock<AssetBalances>>>>,
}

impl BalanceBook {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn partition(&self, venue: &str, market: Market) -> Arc<RwLock<AssetBalances>> {
        let mut partitions = self.partitions.lock();
        partitions
            .entry((venue.to_string(), market))
            .or_insert_with(|| Arc::new(RwLock::new(HashMap::new())))
            .clone()
    }

    /// Record the observed available balance for an asset.
    pub fn set(&self, venue: &str, market: Market, asset: &str, value: f64) {
        let partition = self.partition(venue, market);
        let mut assets = partition.write();
        assets.insert(asset.to_string(), value);
    }

    /// Last recorded balance; 0.0 when nothing was ever snapshotted.
    pub fn get(&self, venue: &str, market: Market, asset: &str) -> f64 {
        let partition = self.partition(venue, market);
        let assets = partition.read();
        assets.get(asset).copied().unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_key_reads_zero() {
        let book = BalanceBook::new();
        assert_eq!(book.get("binance", Market::Spot, "USDT"), 0.0);
    }

    #[test]
    fn set_then_get_round_trips() {
        let book = BalanceBook::new();
        book.set("binance", Market::Spot, "USDT", 123.45);
        assert_eq!(book.get("binance", Market::Spot, "USDT"), 123.45);
    }

    #[test]
    fn markets_are_independent() {
        let book = BalanceBook::new();
        book.set("okx", Market::Spot, "USDT", 10.0);
        book.set("okx", Market::Futures, "USDT", 20.0);
        assert_eq!(book.get("okx", Market::Spot, "USDT"), 10.0);
        assert_eq!(book.get("okx", Market::Futures, "USDT"), 20.0);
    }

    #[test]
    fn profit_identity_by_diff() {
        let book = BalanceBook::new();
        book.set("bitget", Market::Futures, "USDT", 100.0);
        let before = book.get("bitget", Market::Futures, "USDT");
        book.set("bitget", Market::Futures, "USDT", 100.37);
        let after = book.get("bitget", Market::Futures, "USDT");
        assert!((after - before - 0.37).abs() < 1e-9);
    }
}
