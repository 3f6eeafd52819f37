//! Arbitrage detection over a pair's spot/perp books.
//!
//! Pure detection (no I/O): pairs every reliable spot ask against every
//! reliable perp bid on a different venue and emits at most one opportunity
//! per pass. Execution and price tracking are handed to the position
//! controller through the `ExecutionHandler` port; a shared `ExecutionGate`
//! caps the process at one live cycle at a time.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

use crate::arbitrage::gate::ExecutionGate;
use crate::exchanges::precision;
use crate::orderbook::book::OrderBook;
use crate::orderbook::pair::PairBooks;
use crate::util::{fp, now_ms};

/// Book freshness classes, from the combination of reported feed latency and
/// local age. Observability signal only; the hard gate is `is_reliable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Reliability {
    NotReliable,
    UltraLow,
    Low,
    Medium,
    High,
    UltraHigh,
}

impl Reliability {
    pub fn classify(age_ms: f64, latency_ms: f64) -> Self {
        match () {
            _ if age_ms < 70.0 && latency_ms < 50.0 => Reliability::UltraHigh,
            _ if age_ms < 120.0 && latency_ms < 100.0 => Reliability::High,
            _ if age_ms < 220.0 && latency_ms < 200.0 => Reliability::Medium,
            _ if age_ms < 320.0 && latency_ms < 300.0 => Reliability::Low,
            _ if age_ms < 1020.0 && latency_ms < 1000.0 => Reliability::UltraLow,
            _ => Reliability::NotReliable,
        }
    }
}

/// Hard freshness gate: reported latency under 200 ms and last update less
/// than 5 s ago.
fn is_reliable(book: &OrderBook) -> bool {
    let age_ms = (now_ms() - book.last_update_ts_ms) as f64;
    fp::lt(book.latency_ms, 200.0) && fp::lt(age_ms, 5000.0)
}

/// A reliable spot-ask / perp-bid pairing on distinct venues, emitted on
/// every pass regardless of the directional and volume gates. This is what
/// keeps the exit policy fed while a position is open, including when the
/// spread has crossed.
#[derive(Debug, Clone, PartialEq)]
pub struct PairQuote {
    pub spot_venue: String,
    pub spot_ask_price: f64,
    pub perp_venue: String,
    pub perp_bid_price: f64,
}

/// Result of one detection pass.
#[derive(Debug, Default)]
pub struct PairScan {
    pub quotes: Vec<PairQuote>,
    pub opportunity: Option<Opportunity>,
}

/// A detected spot-long / perp-short opening.
#[derive(Debug, Clone, PartialEq)]
pub struct Opportunity {
    pub symbol: String,
    pub spot_venue: String,
    pub perp_venue: String,
    pub spot_ask_price: f64,
    pub spot_ask_notional: f64,
    pub perp_bid_price: f64,
    pub perp_bid_notional: f64,
    pub spread_pct: f64,
    pub usable_volume_usd: f64,
    pub detected_at: DateTime<Utc>,
}

/// Typed port from the detector into the position controller.
#[async_trait]
pub trait ExecutionHandler: Send + Sync {
    /// Attempt to open a hedged position for the opportunity. Returns true
    /// when a position was opened and is now being tracked.
    async fn consider_opportunity(&self, opp: Opportunity) -> bool;

    /// Live top-of-book observation for exit-policy tracking. Must be cheap:
    /// runs inline on the feed-consuming task.
    fn update_prices(
        &self,
        symbol: &str,
        perp_venue: &str,
        perp_price: f64,
        spot_venue: &str,
        spot_price: f64,
    );
}

/// Detection settings, fixed at construction.
#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    /// Venues with working trade adapters; both legs must be on these.
    pub supported_venues: HashSet<String>,
    /// Preferred per-leg notional in USDT.
    pub target_notional_usd: f64,
    /// Per-symbol spread floors (percent) for dispatching execution.
    pub spread_floors_pct: std::collections::HashMap<String, f64>,
    /// Divides the per-symbol floor; >1 trades more aggressively.
    pub risk_coefficient: f64,
    /// Floor applied when a symbol has no table entry.
    pub default_spread_floor_pct: f64,
}

impl AnalyzerConfig {
    fn execution_floor_pct(&self, symbol: &str) -> f64 {
        let base = self
            .spread_floors_pct
            .get(symbol)
            .copied()
            .unwrap_or(self.default_spread_floor_pct);
        base / self.risk_coefficient
    }
}

/// Runs detection after every merge and fans the results out to the
/// controller.
pub struct Analyzer {
    config: AnalyzerConfig,
    gate: Arc<ExecutionGate>,
    handler: Arc<dyn ExecutionHandler>,
}

impl Analyzer {
    pub fn new(
        config: AnalyzerConfig,
        gate: Arc<ExecutionGate>,
        handler: Arc<dyn ExecutionHandler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            gate,
            handler,
        })
    }

    /// Called by a pair manager after every successful merge.
    pub fn analyze_pair(&self, pair: &PairBooks) {
        let pass = scan(pair, self.config.target_notional_usd);

        // Exit policy sees every fresh top-of-book pairing on executable
        // venues, including inverted spreads the opening gates reject.
        for quote in &pass.quotes {
            if self.config.supported_venues.contains(&quote.spot_venue)
                && self.config.supported_venues.contains(&quote.perp_venue)
            {
                self.handler.update_prices(
                    &pair.symbol,
                    &quote.perp_venue,
                    quote.perp_bid_price,
                    &quote.spot_venue,
                    quote.spot_ask_price,
                );
            }
        }

        let Some(opp) = pass.opportunity else {
            return;
        };

        // Journal every emission, executable or not.
        let estimated_profit_usd = opp.usable_volume_usd * (opp.spread_pct / 100.0);
        info!(
            symbol = %opp.symbol,
            spot = %opp.spot_venue,
            spot_ask = opp.spot_ask_price,
            spot_notional = opp.spot_ask_notional,
            perp = %opp.perp_venue,
            perp_bid = opp.perp_bid_price,
            perp_notional = opp.perp_bid_notional,
            spread_pct = opp.spread_pct,
            usable_usd = opp.usable_volume_usd,
            estimated_profit_usd,
            "arbitrage opportunity"
        );

        let spot_supported = self.config.supported_venues.contains(&opp.spot_venue);
        let perp_supported = self.config.supported_venues.contains(&opp.perp_venue);
        let distinct = opp.spot_venue != opp.perp_venue;
        if !(spot_supported && perp_supported && distinct) {
            debug!(
                symbol = %opp.symbol,
                spot = %opp.spot_venue,
                perp = %opp.perp_venue,
                "opportunity outside executable venues"
            );
            return;
        }

        if !fp::gte(opp.spread_pct, self.config.execution_floor_pct(&opp.symbol)) {
            return;
        }

        // Single live cycle process-wide: the gate is released by the
        // controller when the cycle ends.
        if !self.gate.try_acquire() {
            return;
        }

        info!(
            symbol = %opp.symbol,
            spot = %opp.spot_venue,
            perp = %opp.perp_venue,
            spread_pct = opp.spread_pct,
            "dispatching opportunity for execution"
        );

        let handler = self.handler.clone();
        let gate = self.gate.clone();
        tokio::spawn(async move {
            let opened = handler.consider_opportunity(opp).await;
            if !opened {
                gate.release();
            }
        });
    }
}

/// Pure detection pass over one pair's books: every reliable distinct
/// pairing becomes a quote; the first pairing that also clears the
/// directional and volume gates becomes the opportunity.
pub fn scan(pair: &PairBooks, target_notional_usd: f64) -> PairScan {
    let mut result = PairScan::default();

    for spot_venue in pair.spot.venues() {
        let Some(spot_book) = pair.spot.get(&spot_venue) else {
            continue;
        };
        let (spot_ask, spot_ask_notional) = {
            let book = spot_book.read();
            if !is_reliable(&book) {
                continue;
            }
            match book.best_ask() {
                Some(level) => level,
                None => continue,
            }
        };

        for perp_venue in pair.perp.venues() {
            if perp_venue == spot_venue {
                continue;
            }
            let Some(perp_book) = pair.perp.get(&perp_venue) else {
                continue;
            };
            let (perp_bid, perp_bid_notional) = {
                let book = perp_book.read();
                if !is_reliable(&book) {
                    continue;
                }
                match book.best_bid() {
                    Some(level) => level,
                    None => continue,
                }
            };

            result.quotes.push(PairQuote {
                spot_venue: spot_venue.clone(),
                spot_ask_price: spot_ask,
                perp_venue: perp_venue.clone(),
                perp_bid_price: perp_bid,
            });

            if result.opportunity.is_some() {
                continue;
            }

            // Usable volume: what both books offer at best, capped at the
            // target notional.
            let mut usable = spot_ask_notional;
            if fp::lt(perp_bid_notional, usable) {
                usable = perp_bid_notional;
            }
            if fp::lt(target_notional_usd, usable) {
                usable = target_notional_usd;
            }

            // Below target: both sides must still express the volume after
            // quantity flooring, otherwise the order dies at placement.
            if fp::lt(usable, target_notional_usd) {
                let spot_ok = precision::can_achieve_volume(usable, spot_ask, &pair.symbol);
                let perp_ok = precision::can_achieve_volume(usable, perp_bid, &pair.symbol);
                if !spot_ok || !perp_ok {
                    continue;
                }
            }

            let spot_min = precision::min_achievable_volume(spot_ask, &pair.symbol);
            let perp_min = precision::min_achievable_volume(perp_bid, &pair.symbol);
            if fp::lt(spot_ask_notional, spot_min) || fp::lt(perp_bid_notional, perp_min) {
                continue;
            }

            if fp::gt(perp_bid, spot_ask) {
                let spread_pct = ((perp_bid - spot_ask) / spot_ask) * 100.0;
                result.opportunity = Some(Opportunity {
                    symbol: pair.symbol.clone(),
                    spot_venue: spot_venue.clone(),
                    perp_venue: perp_venue.clone(),
                    spot_ask_price: spot_ask,
                    spot_ask_notional,
                    perp_bid_price: perp_bid,
                    perp_bid_notional,
                    spread_pct,
                    usable_volume_usd: usable,
                    detected_at: Utc::now(),
                });
            }
        }
    }

    result
}

/// Opportunity-only view of [`scan`].
pub fn detect(pair: &PairBooks, target_notional_usd: f64) -> Option<Opportunity> {
    scan(pair, target_notional_usd).opportunity
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orderbook::pair::PairBooks;

    fn fill(
        pair: &PairBooks,
        venue: &str,
        perp: bool,
        bids: &[(f64, f64)],
        asks: &[(f64, f64)],
        latency_ms: f64,
        ts_ms: i64,
    ) {
        let books = if perp { &pair.perp } else { &pair.spot };
        let book = books.get_or_create(venue);
        book.write().merge(bids, asks, latency_ms, ts_ms);
    }

    fn fresh() -> i64 {
        now_ms()
    }

    #[test]
    fn reliability_bands() {
        assert_eq!(Reliability::classify(50.0, 20.0), Reliability::UltraHigh);
        assert_eq!(Reliability::classify(100.0, 80.0), Reliability::High);
        assert_eq!(Reliability::classify(200.0, 150.0), Reliability::Medium);
        assert_eq!(Reliability::classify(300.0, 250.0), Reliability::Low);
        assert_eq!(Reliability::classify(1000.0, 900.0), Reliability::UltraLow);
        assert_eq!(Reliability::classify(2000.0, 20.0), Reliability::NotReliable);
        assert_eq!(Reliability::classify(50.0, 2000.0), Reliability::NotReliable);
    }

    #[test]
    fn happy_path_emits_one_opportunity() {
        let pair = PairBooks::new("doge-usdt");
        fill(&pair, "okx", false, &[], &[(0.2363, 60.0)], 10.0, fresh());
        fill(&pair, "binance", true, &[(0.2368, 55.0)], &[], 10.0, fresh());

        let opp = detect(&pair, 20.0).expect("opportunity");
        assert_eq!(opp.spot_venue, "okx");
        assert_eq!(opp.perp_venue, "binance");
        assert!((opp.spread_pct - 0.2116).abs() < 0.01);
        assert_eq!(opp.usable_volume_usd, 20.0);
        assert!(fp::gt(opp.perp_bid_price, opp.spot_ask_price));
    }

    #[test]
    fn stale_spot_book_blocks_emission() {
        let pair = PairBooks::new("doge-usdt");
        fill(&pair, "okx", false, &[], &[(0.2363, 60.0)], 10.0, fresh() - 10_000);
        fill(&pair, "binance", true, &[(0.2368, 55.0)], &[], 10.0, fresh());
        assert!(detect(&pair, 20.0).is_none());
    }

    #[test]
    fn high_latency_blocks_emission() {
        let pair = PairBooks::new("doge-usdt");
        fill(&pair, "okx", false, &[], &[(0.2363, 60.0)], 350.0, fresh());
        fill(&pair, "binance", true, &[(0.2368, 55.0)], &[], 10.0, fresh());
        assert!(detect(&pair, 20.0).is_none());
    }

    #[test]
    fn same_venue_pairing_is_skipped() {
        let pair = PairBooks::new("doge-usdt");
        fill(&pair, "okx", false, &[], &[(0.2363, 60.0)], 10.0, fresh());
        fill(&pair, "okx", true, &[(0.2368, 55.0)], &[], 10.0, fresh());
        assert!(detect(&pair, 20.0).is_none());
    }

    #[test]
    fn inverted_prices_quote_but_do_not_emit() {
        let pair = PairBooks::new("doge-usdt");
        fill(&pair, "okx", false, &[], &[(0.2368, 60.0)], 10.0, fresh());
        fill(&pair, "binance", true, &[(0.2363, 55.0)], &[], 10.0, fresh());
        let result = scan(&pair, 20.0);
        assert!(result.opportunity.is_none());
        // Exit tracking still sees the crossed market.
        assert_eq!(result.quotes.len(), 1);
        assert_eq!(result.quotes[0].perp_bid_price, 0.2363);
        assert_eq!(result.quotes[0].spot_ask_price, 0.2368);
    }

    #[test]
    fn same_venue_produces_no_quote() {
        let pair = PairBooks::new("doge-usdt");
        fill(&pair, "okx", false, &[], &[(0.2363, 60.0)], 10.0, fresh());
        fill(&pair, "okx", true, &[(0.2368, 55.0)], &[], 10.0, fresh());
        assert!(scan(&pair, 20.0).quotes.is_empty());
    }

    #[test]
    fn volume_below_precision_floor_is_rejected() {
        // 0.80 USDT of liquidity at 2.5 with whole-unit quantity precision:
        // one unit already costs 2.5 USDT, nothing is achievable.
        let pair = PairBooks::new("doge-usdt");
        fill(&pair, "okx", false, &[], &[(2.5, 0.80)], 10.0, fresh());
        fill(&pair, "binance", true, &[(2.6, 0.80)], &[], 10.0, fresh());
        assert!(detect(&pair, 20.0).is_none());
    }

    #[test]
    fn usable_volume_is_min_of_sides_and_target() {
        let pair = PairBooks::new("xrp-usdt");
        fill(&pair, "okx", false, &[], &[(0.51, 12.0)], 10.0, fresh());
        fill(&pair, "binance", true, &[(0.52, 80.0)], &[], 10.0, fresh());
        let opp = detect(&pair, 20.0).expect("opportunity");
        assert_eq!(opp.usable_volume_usd, 12.0);
    }

    #[test]
    fn empty_sides_block_emission() {
        let pair = PairBooks::new("doge-usdt");
        fill(&pair, "okx", false, &[(0.2360, 60.0)], &[], 10.0, fresh());
        fill(&pair, "binance", true, &[(0.2368, 55.0)], &[], 10.0, fresh());
        assert!(detect(&pair, 20.0).is_none());
    }

    #[derive(Default)]
    struct RecordingHandler {
        considered: parking_lot::Mutex<Vec<Opportunity>>,
        price_updates: parking_lot::Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl ExecutionHandler for RecordingHandler {
        async fn consider_opportunity(&self, opp: Opportunity) -> bool {
            self.considered.lock().push(opp);
            true // position "opened": gate stays held
        }

        fn update_prices(
            &self,
            _symbol: &str,
            perp_venue: &str,
            _perp_price: f64,
            spot_venue: &str,
            _spot_price: f64,
        ) {
            self.price_updates
                .lock()
                .push((spot_venue.to_string(), perp_venue.to_string()));
        }
    }

    fn analyzer_with(
        venues: &[&str],
        handler: Arc<RecordingHandler>,
        gate: Arc<ExecutionGate>,
    ) -> Arc<Analyzer> {
        Analyzer::new(
            AnalyzerConfig {
                supported_venues: venues.iter().map(|v| v.to_string()).collect(),
                target_notional_usd: 20.0,
                spread_floors_pct: std::collections::HashMap::new(),
                risk_coefficient: 10.0,
                default_spread_floor_pct: 0.5,
            },
            gate,
            handler,
        )
    }

    fn ripe_pair() -> Arc<PairBooks> {
        let pair = PairBooks::new("doge-usdt");
        fill(&pair, "okx", false, &[], &[(0.2363, 60.0)], 10.0, fresh());
        fill(&pair, "binance", true, &[(0.2375, 55.0)], &[], 10.0, fresh());
        pair
    }

    #[tokio::test]
    async fn gate_limits_dispatch_to_one_cycle() {
        let handler = Arc::new(RecordingHandler::default());
        let gate = ExecutionGate::new();
        let analyzer = analyzer_with(&["okx", "binance"], handler.clone(), gate.clone());
        let pair = ripe_pair();

        analyzer.analyze_pair(&pair);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(handler.considered.lock().len(), 1);
        assert!(gate.is_executing());

        // Second ripe pass: price tracking continues, execution does not.
        analyzer.analyze_pair(&pair);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(handler.considered.lock().len(), 1);
        assert!(handler.price_updates.lock().len() >= 2);
    }

    #[tokio::test]
    async fn unsupported_venue_gets_neither_callback() {
        let handler = Arc::new(RecordingHandler::default());
        let gate = ExecutionGate::new();
        // Only okx is whitelisted; the perp leg is on binance.
        let analyzer = analyzer_with(&["okx"], handler.clone(), gate.clone());
        let pair = ripe_pair();

        analyzer.analyze_pair(&pair);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(handler.considered.lock().is_empty());
        assert!(handler.price_updates.lock().is_empty());
        assert!(!gate.is_executing());
    }

    #[tokio::test]
    async fn spread_below_floor_tracks_but_does_not_dispatch() {
        let handler = Arc::new(RecordingHandler::default());
        let gate = ExecutionGate::new();
        let analyzer = analyzer_with(&["okx", "binance"], handler.clone(), gate.clone());

        // 0.021% spread, below the 0.05% execution floor.
        let pair = PairBooks::new("doge-usdt");
        fill(&pair, "okx", false, &[], &[(0.2363, 60.0)], 10.0, fresh());
        fill(&pair, "binance", true, &[(0.23635, 55.0)], &[], 10.0, fresh());

        analyzer.analyze_pair(&pair);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(handler.considered.lock().is_empty());
        assert_eq!(handler.price_updates.lock().len(), 1);
        assert!(!gate.is_executing());
    }
}
