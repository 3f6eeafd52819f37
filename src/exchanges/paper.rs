//! Simulated venue for dry-run mode.
//!
//! Fills market orders at the live top-of-book read from the shared book
//! registry, charges a taker fee, adds a little latency jitter, and keeps
//! simulated per-market balances so the balance-diff profit accounting works
//! exactly like the live adapters. The published event stream is therefore
//! identical to live trading without a single venue call.

use async_trait::async_trait;
use parking_lot::RwLock;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::balance::{BalanceBook, Market};
use super::precision;
use super::{base_asset, ExchangeClient, ExchangeError, OpenPosition, TradeResult};
use crate::util::fp;

/// Narrow price oracle so the simulator is testable without a live feed.
pub trait PriceSource: Send + Sync {
    /// `(best_bid, best_ask)` for a symbol on one venue's spot or perp book,
    /// each side `(price, usdt_notional)`.
    #[allow(clippy::type_complexity)]
    fn top_of_book(
        &self,
        symbol: &str,
        venue: &str,
        perp: bool,
    ) -> Option<(Option<(f64, f64)>, Option<(f64, f64)>)>;
}

impl PriceSource for crate::orderbook::manager::BookManager {
    fn top_of_book(
        &self,
        symbol: &str,
        venue: &str,
        perp: bool,
    ) -> Option<(Option<(f64, f64)>, Option<(f64, f64)>)> {
        crate::orderbook::manager::BookManager::top_of_book(self, symbol, venue, perp)
    }
}

#[derive(Debug, Clone)]
pub struct PaperConfig {
    /// Taker fee per fill.
    pub fee_rate: f64,
    /// Simulated request latency window in milliseconds.
    pub latency_ms: (u64, u64),
    /// Starting USDT on each of spot and futures.
    pub starting_usdt: f64,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            fee_rate: 0.001,
            latency_ms: (5, 40),
            starting_usdt: 1_000.0,
        }
    }
}

/// One simulated venue.
pub struct PaperExchange {
    name: String,
    prices: Arc<dyn PriceSource>,
    snapshots: Arc<BalanceBook>,
    config: PaperConfig,
    /// Simulated venue-side balances, `(market, asset) -> amount`.
    funds: RwLock<HashMap<(Market, String), f64>>,
    positions: RwLock<HashMap<String, OpenPosition>>,
}

impl PaperExchange {
    pub fn new(
        name: &str,
        prices: Arc<dyn PriceSource>,
        snapshots: Arc<BalanceBook>,
        config: PaperConfig,
    ) -> Arc<Self> {
        let mut funds = HashMap::new();
        funds.insert((Market::Spot, "USDT".to_string()), config.starting_usdt);
        funds.insert((Market::Futures, "USDT".to_string()), config.starting_usdt);
        Arc::new(Self {
            name: name.to_string(),
            prices,
            snapshots,
            config,
            funds: RwLock::new(funds),
            positions: RwLock::new(HashMap::new()),
        })
    }

    fn fund(&self, market: Market, asset: &str) -> f64 {
        self.funds
            .read()
            .get(&(market, asset.to_string()))
            .copied()
            .unwrap_or(0.0)
    }

    fn adjust_fund(&self, market: Market, asset: &str, delta: f64) {
        let mut funds = self.funds.write();
        let entry = funds.entry((market, asset.to_string())).or_insert(0.0);
        *entry += delta;
    }

    fn set_fund(&self, market: Market, asset: &str, value: f64) {
        self.funds.write().insert((market, asset.to_string()), value);
    }

    async fn simulate_latency(&self) {
        let (lo, hi) = self.config.latency_ms;
        if hi == 0 {
            return;
        }
        let ms = rand::thread_rng().gen_range(lo..=hi.max(lo));
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    fn best(&self, pair: &str, perp: bool, want_bid: bool) -> Result<f64, ExchangeError> {
        let (bid, ask) = self
            .prices
            .top_of_book(pair, &self.name, perp)
            .ok_or_else(|| ExchangeError::ConnectionFailed(format!("no book for {pair}")))?;
        let side = if want_bid { bid } else { ask };
        side.map(|(price, _)| price)
            .ok_or_else(|| ExchangeError::ConnectionFailed(format!("empty book side for {pair}")))
    }

    fn order_id(&self) -> String {
        format!("paper-{}", rand::thread_rng().gen::<u32>())
    }
}

#[async_trait]
impl ExchangeClient for PaperExchange {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put_spot_long(
        &self,
        pair: &str,
        amount_usdt: f64,
    ) -> Result<TradeResult, ExchangeError> {
        self.simulate_latency().await;
        let price = self.best(pair, false, false)?;
        let qty = precision::floor_quantity(amount_usdt / price, pair);
        if fp::is_negative_or_zero(qty) {
            return Err(ExchangeError::InvalidQuantity(qty));
        }

        let usdt = self.fund(Market::Spot, "USDT");
        let cost = qty * price;
        let fee = cost * self.config.fee_rate;
        if fp::lt(usdt, cost + fee) {
            warn!(venue = %self.name, pair, usdt, needed = cost + fee, "paper spot buy refused");
            return Err(ExchangeError::InsufficientBalance);
        }

        // Pre-trade snapshot, same protocol as the live adapters.
        self.snapshots.set(&self.name, Market::Spot, "USDT", usdt);

        let base = base_asset(pair);
        self.adjust_fund(Market::Spot, "USDT", -(cost + fee));
        self.adjust_fund(Market::Spot, &base, qty);

        let order_id = self.order_id();
        self.positions.write().insert(
            format!("{pair}_spot"),
            OpenPosition {
                pair: pair.to_string(),
                side: "long".into(),
                market: Market::Spot,
                entry_price: price,
                quantity: qty,
                amount_usdt: cost + fee,
                order_id: order_id.clone(),
            },
        );

        info!(venue = %self.name, pair, price, qty, fee, "paper spot long filled");
        Ok(TradeResult {
            order_id,
            executed_price: price,
            executed_qty: qty,
            fee,
            success: true,
            message: "paper fill".into(),
        })
    }

    async fn put_futures_short(
        &self,
        pair: &str,
        amount_usdt: f64,
    ) -> Result<TradeResult, ExchangeError> {
        self.simulate_latency().await;
        let price = self.best(pair, true, true)?;
        let qty = precision::floor_quantity(amount_usdt / price, pair);
        if fp::is_negative_or_zero(qty) {
            return Err(ExchangeError::InvalidQuantity(qty));
        }

        let usdt = self.fund(Market::Futures, "USDT");
        if fp::lt(usdt, amount_usdt) {
            return Err(ExchangeError::InsufficientBalance);
        }
        self.snapshots.set(&self.name, Market::Futures, "USDT", usdt);

        let fee = qty * price * self.config.fee_rate;
        self.adjust_fund(Market::Futures, "USDT", -fee);

        let order_id = self.order_id();
        self.positions.write().insert(
            format!("{pair}_futures"),
            OpenPosition {
                pair: pair.to_string(),
                side: "short".into(),
                market: Market::Futures,
                entry_price: price,
                quantity: qty,
                amount_usdt,
                order_id: order_id.clone(),
            },
        );

        info!(venue = %self.name, pair, price, qty, fee, "paper futures short filled");
        Ok(TradeResult {
            order_id,
            executed_price: price,
            executed_qty: qty,
            fee,
            success: true,
            message: "paper fill".into(),
        })
    }

    async fn close_spot_long(
        &self,
        pair: &str,
        _amount_usdt: f64,
    ) -> Result<(TradeResult, f64), ExchangeError> {
        self.simulate_latency().await;
        let base = base_asset(pair);
        let balance = self.fund(Market::Spot, &base);
        if fp::is_zero(balance) {
            self.positions.write().remove(&format!("{pair}_spot"));
            return Err(ExchangeError::PositionNotFound);
        }

        let qty = precision::floor_quantity(balance, pair);
        if fp::is_negative_or_zero(qty) {
            return Err(ExchangeError::InvalidQuantity(qty));
        }

        let price = self.best(pair, false, true)?;
        let proceeds = qty * price;
        let fee = proceeds * self.config.fee_rate;

        self.adjust_fund(Market::Spot, &base, -qty);
        self.adjust_fund(Market::Spot, "USDT", proceeds - fee);
        self.positions.write().remove(&format!("{pair}_spot"));

        let new_usdt = self.fund(Market::Spot, "USDT");
        let prev = self.snapshots.get(&self.name, Market::Spot, "USDT");
        self.snapshots.set(&self.name, Market::Spot, "USDT", new_usdt);
        let profit = new_usdt - prev;

        info!(venue = %self.name, pair, price, qty, profit, "paper spot long closed");
        Ok((
            TradeResult {
                order_id: self.order_id(),
                executed_price: price,
                executed_qty: qty,
                fee,
                success: true,
                message: "paper fill".into(),
            },
            profit,
        ))
    }

    async fn close_futures_short(
        &self,
        pair: &str,
    ) -> Result<(TradeResult, f64), ExchangeError> {
        self.simulate_latency().await;
        let position = self.positions.read().get(&format!("{pair}_futures")).cloned();
        let Some(position) = position else {
            return Err(ExchangeError::PositionNotFound);
        };

        let price = self.best(pair, true, false)?;
        let pnl = position.quantity * (position.entry_price - price);
        let fee = position.quantity * price * self.config.fee_rate;

        self.adjust_fund(Market::Futures, "USDT", pnl - fee);
        self.positions.write().remove(&format!("{pair}_futures"));

        let new_usdt = self.fund(Market::Futures, "USDT");
        let prev = self.snapshots.get(&self.name, Market::Futures, "USDT");
        self.snapshots.set(&self.name, Market::Futures, "USDT", new_usdt);
        let profit = new_usdt - prev;

        info!(venue = %self.name, pair, price, pnl, profit, "paper futures short closed");
        Ok((
            TradeResult {
                order_id: self.order_id(),
                executed_price: price,
                executed_qty: position.quantity,
                fee,
                success: true,
                message: "paper fill".into(),
            },
            profit,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Static two-sided book for one venue.
    struct FixedPrices {
        spot_bid: f64,
        spot_ask: f64,
        perp_bid: f64,
        perp_ask: f64,
    }

    impl PriceSource for FixedPrices {
        fn top_of_book(
            &self,
            _symbol: &str,
            _venue: &str,
            perp: bool,
        ) -> Option<(Option<(f64, f64)>, Option<(f64, f64)>)> {
            if perp {
                Some((Some((self.perp_bid, 100.0)), Some((self.perp_ask, 100.0))))
            } else {
                Some((Some((self.spot_bid, 100.0)), Some((self.spot_ask, 100.0))))
            }
        }
    }

    fn venue(prices: FixedPrices) -> Arc<PaperExchange> {
        PaperExchange::new(
            "okx",
            Arc::new(prices),
            BalanceBook::new(),
            PaperConfig {
                fee_rate: 0.0,
                latency_ms: (0, 0),
                starting_usdt: 100.0,
            },
        )
    }

    #[tokio::test]
    async fn spot_round_trip_profit_matches_balance_diff() {
        let paper = venue(FixedPrices {
            spot_bid: 0.50,
            spot_ask: 0.50,
            perp_bid: 0.52,
            perp_ask: 0.52,
        });

        let open = paper.put_spot_long("xrp-usdt", 20.0).await.unwrap();
        assert!(open.success);
        assert!((open.executed_qty - 40.0).abs() < 1e-9);

        let (close, profit) = paper.close_spot_long("xrp-usdt", 20.0).await.unwrap();
        assert!(close.success);
        // Flat price, zero fees: flat P&L.
        assert!(profit.abs() < 1e-9);
    }

    #[tokio::test]
    async fn futures_short_profits_when_price_falls() {
        let paper = venue(FixedPrices {
            spot_bid: 0.50,
            spot_ask: 0.50,
            perp_bid: 0.52,
            perp_ask: 0.50,
        });

        let open = paper.put_futures_short("xrp-usdt", 20.0).await.unwrap();
        // Sized at the perp bid 0.52 -> 38.4 floored to 38.4 (1 decimal).
        assert!((open.executed_price - 0.52).abs() < 1e-9);

        // Buy-back at ask 0.50: profit = qty * (0.52 - 0.50).
        let (_, profit) = paper.close_futures_short("xrp-usdt").await.unwrap();
        let expected = open.executed_qty * 0.02;
        assert!((profit - expected).abs() < 1e-9);
    }

    #[tokio::test]
    async fn quantity_that_floors_to_zero_is_rejected() {
        let paper = venue(FixedPrices {
            spot_bid: 2.5,
            spot_ask: 2.5,
            perp_bid: 2.6,
            perp_ask: 2.6,
        });
        // doge-usdt has whole-unit precision; 0.8 USDT buys 0.32 units -> 0.
        let err = paper.put_spot_long("doge-usdt", 0.8).await.unwrap_err();
        assert!(matches!(err, ExchangeError::InvalidQuantity(_)));
    }

    #[tokio::test]
    async fn close_without_position_clears_cache_and_errors() {
        let paper = venue(FixedPrices {
            spot_bid: 0.5,
            spot_ask: 0.5,
            perp_bid: 0.5,
            perp_ask: 0.5,
        });
        let err = paper.close_spot_long("xrp-usdt", 20.0).await.unwrap_err();
        assert!(matches!(err, ExchangeError::PositionNotFound));
        let err = paper.close_futures_short("xrp-usdt").await.unwrap_err();
        assert!(matches!(err, ExchangeError::PositionNotFound));
    }

    #[tokio::test]
    async fn overspending_is_refused() {
        let paper = venue(FixedPrices {
            spot_bid: 0.5,
            spot_ask: 0.5,
            perp_bid: 0.5,
            perp_ask: 0.5,
        });
        let err = paper.put_spot_long("xrp-usdt", 500.0).await.unwrap_err();
        assert!(matches!(err, ExchangeError::InsufficientBalance));
    }
}
