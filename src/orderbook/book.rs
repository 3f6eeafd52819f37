//! Per-venue incremental order book.
//!
//! Levels map a price to the quote-asset (USDT) notional resting at that
//! price. Updates are replace-semantics: zero notional deletes the level,
//! any positive notional overwrites it. Sides are kept sorted (bids
//! descending, asks ascending) so best-of-book is the first element.

use tracing::warn;

use crate::util::fp;

/// One price level: price and the USDT notional available at it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceLevel {
    pub price: f64,
    pub notional: f64,
}

/// Outcome of a merge attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Applied,
    /// The deltas would have crossed the book (best bid >= best ask); the
    /// book is left untouched apart from freshness metadata.
    RejectedCrossed,
}

#[derive(Debug, Default)]
pub struct OrderBook {
    /// Sorted descending by price: `bids[0]` is the best bid.
    bids: Vec<PriceLevel>,
    /// Sorted ascending by price: `asks[0]` is the best ask.
    asks: Vec<PriceLevel>,
    pub latency_ms: f64,
    pub last_update_ts_ms: i64,
}

impl OrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge level deltas into the book, taking latency/timestamp verbatim
    /// from the feed. A delta set that would cross the book is rejected.
    pub fn merge(
        &mut self,
        bid_deltas: &[(f64, f64)],
        ask_deltas: &[(f64, f64)],
        latency_ms: f64,
        last_update_ts_ms: i64,
    ) -> MergeOutcome {
        let mut bids = self.bids.clone();
        let mut asks = self.asks.clone();

        for &(price, notional) in bid_deltas {
            apply_level(&mut bids, price, notional, Side::Bid);
        }
        for &(price, notional) in ask_deltas {
            apply_level(&mut asks, price, notional, Side::Ask);
        }

        if let (Some(bid), Some(ask)) = (bids.first(), asks.first()) {
            if fp::gte(bid.price, ask.price) {
                warn!(
                    best_bid = bid.price,
                    best_ask = ask.price,
                    "rejecting merge: deltas would cross the book"
                );
                self.latency_ms = latency_ms;
                self.last_update_ts_ms = last_update_ts_ms;
                return MergeOutcome::RejectedCrossed;
            }
        }

        self.bids = bids;
        self.asks = asks;
        self.latency_ms = latency_ms;
        self.last_update_ts_ms = last_update_ts_ms;
        MergeOutcome::Applied
    }

    /// Highest-priced bid level, if any.
    #[inline]
    pub fn best_bid(&self) -> Option<(f64, f64)> {
        self.bids.first().map(|l| (l.price, l.notional))
    }

    /// Lowest-priced ask level, if any.
    #[inline]
    pub fn best_ask(&self) -> Option<(f64, f64)> {
        self.asks.first().map(|l| (l.price, l.notional))
    }

    pub fn bid_depth(&self) -> usize {
        self.bids.len()
    }

    pub fn ask_depth(&self) -> usize {
        self.asks.len()
    }

    /// Full sorted view (bids descending, asks ascending) with the last
    /// update stamp. Debug/diagnostics only.
    pub fn snapshot(&self) -> (Vec<PriceLevel>, Vec<PriceLevel>, i64) {
        (self.bids.clone(), self.asks.clone(), self.last_update_ts_ms)
    }
}

#[derive(Clone, Copy)]
enum Side {
    Bid,
    Ask,
}

/// Insert/replace/delete a level in a sorted side.
fn apply_level(levels: &mut Vec<PriceLevel>, price: f64, notional: f64, side: Side) {
    if !fp::is_positive(price) {
        return;
    }

    let pos = match side {
        // Bids descending: first index whose price is <= incoming.
        Side::Bid => levels.iter().position(|l| fp::lte(l.price, price)),
        // Asks ascending: first index whose price is >= incoming.
        Side::Ask => levels.iter().position(|l| fp::gte(l.price, price)),
    };

    match pos {
        Some(i) if fp::approx_eq(levels[i].price, price) => {
            if fp::is_zero(notional) {
                levels.remove(i);
            } else {
                levels[i].notional = notional;
            }
        }
        Some(i) if fp::is_positive(notional) => {
            levels.insert(i, PriceLevel { price, notional });
        }
        None if fp::is_positive(notional) => {
            levels.push(PriceLevel { price, notional });
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book_with(bids: &[(f64, f64)], asks: &[(f64, f64)]) -> OrderBook {
        let mut ob = OrderBook::new();
        assert_eq!(ob.merge(bids, asks, 10.0, 1_700_000_000_000), MergeOutcome::Applied);
        ob
    }

    #[test]
    fn best_of_empty_book_is_none() {
        let ob = OrderBook::new();
        assert!(ob.best_bid().is_none());
        assert!(ob.best_ask().is_none());
    }

    #[test]
    fn best_bid_is_max_best_ask_is_min() {
        let ob = book_with(
            &[(0.2360, 50.0), (0.2362, 30.0), (0.2358, 10.0)],
            &[(0.2365, 40.0), (0.2363, 20.0), (0.2370, 5.0)],
        );
        assert_eq!(ob.best_bid(), Some((0.2362, 30.0)));
        assert_eq!(ob.best_ask(), Some((0.2363, 20.0)));
    }

    #[test]
    fn zero_notional_deletes_level() {
        let mut ob = book_with(&[(0.2362, 30.0), (0.2360, 50.0)], &[(0.2363, 20.0)]);
        ob.merge(&[(0.2362, 0.0)], &[], 11.0, 1_700_000_000_100);
        assert_eq!(ob.best_bid(), Some((0.2360, 50.0)));
    }

    #[test]
    fn positive_notional_replaces_level() {
        let mut ob = book_with(&[(0.2362, 30.0)], &[]);
        ob.merge(&[(0.2362, 75.0)], &[], 11.0, 1_700_000_000_100);
        assert_eq!(ob.best_bid(), Some((0.2362, 75.0)));
        assert_eq!(ob.bid_depth(), 1);
    }

    #[test]
    fn merge_is_idempotent() {
        let deltas_b = [(0.2362, 30.0), (0.2360, 50.0)];
        let deltas_a = [(0.2363, 20.0)];
        let mut once = OrderBook::new();
        once.merge(&deltas_b, &deltas_a, 10.0, 1);
        let mut twice = OrderBook::new();
        twice.merge(&deltas_b, &deltas_a, 10.0, 1);
        twice.merge(&deltas_b, &deltas_a, 10.0, 1);
        assert_eq!(once.snapshot().0, twice.snapshot().0);
        assert_eq!(once.snapshot().1, twice.snapshot().1);
    }

    #[test]
    fn crossing_merge_is_rejected() {
        let mut ob = book_with(&[(0.2360, 50.0)], &[(0.2363, 20.0)]);
        let outcome = ob.merge(&[(0.2364, 10.0)], &[], 12.0, 1_700_000_000_200);
        assert_eq!(outcome, MergeOutcome::RejectedCrossed);
        // Levels untouched, freshness still advanced.
        assert_eq!(ob.best_bid(), Some((0.2360, 50.0)));
        assert_eq!(ob.last_update_ts_ms, 1_700_000_000_200);
    }

    #[test]
    fn metadata_taken_verbatim() {
        let mut ob = OrderBook::new();
        ob.merge(&[(1.0, 5.0)], &[], 37.5, 42);
        assert_eq!(ob.latency_ms, 37.5);
        assert_eq!(ob.last_update_ts_ms, 42);
    }

    #[test]
    fn deleting_missing_level_is_a_noop() {
        let mut ob = book_with(&[(0.2360, 50.0)], &[]);
        ob.merge(&[(0.9999, 0.0)], &[], 10.0, 2);
        assert_eq!(ob.bid_depth(), 1);
    }

    #[test]
    fn snapshot_orders_both_sides() {
        let ob = book_with(
            &[(3.0, 1.0), (1.0, 1.0), (2.0, 1.0)],
            &[(6.0, 1.0), (4.0, 1.0), (5.0, 1.0)],
        );
        let (bids, asks, _) = ob.snapshot();
        let bid_prices: Vec<f64> = bids.iter().map(|l| l.price).collect();
        let ask_prices: Vec<f64> = asks.iter().map(|l| l.price).collect();
        assert_eq!(bid_prices, vec![3.0, 2.0, 1.0]);
        assert_eq!(ask_prices, vec![4.0, 5.0, 6.0]);
    }
}
