//! Pair managers and the global book registry.
//!
//! One `PairManager` per configured symbol: it owns the pair's books and two
//! feed sessions (spot topic `<symbol>`, perpetual topic `<symbol>-perp`),
//! plus a periodic book digest for observability. `BookManager` is the
//! global registry the runtime and the dry-run fill path read from.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

use super::analyzer::Analyzer;
use super::feed::{FeedMetrics, Session};
use super::pair::PairBooks;

const DIGEST_INTERVAL: Duration = Duration::from_secs(10);

pub struct PairManager {
    pair: Arc<PairBooks>,
    metrics: Arc<FeedMetrics>,
    stop_tx: watch::Sender<bool>,
}

impl PairManager {
    /// Spawn the spot session, the perp session and the digest task.
    pub fn start(symbol: &str, signal_url: &str, analyzer: Arc<Analyzer>) -> Arc<Self> {
        let pair = PairBooks::new(symbol);
        let metrics = FeedMetrics::new();
        let (stop_tx, stop_rx) = watch::channel(false);

        info!(symbol = %symbol, "starting pair manager (spot + perp sessions)");

        let spot = Session {
            url: signal_url.to_string(),
            topic: symbol.to_string(),
            is_perp: false,
            pair: pair.clone(),
            analyzer: analyzer.clone(),
            metrics: metrics.clone(),
        };
        tokio::spawn(spot.run(stop_rx.clone()));

        let perp = Session {
            url: signal_url.to_string(),
            topic: format!("{symbol}-perp"),
            is_perp: true,
            pair: pair.clone(),
            analyzer,
            metrics: metrics.clone(),
        };
        tokio::spawn(perp.run(stop_rx.clone()));

        let digest_pair = pair.clone();
        let digest_metrics = metrics.clone();
        let mut digest_stop = stop_rx;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(DIGEST_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = digest_stop.changed() => return,
                    _ = ticker.tick() => log_digest(&digest_pair, &digest_metrics),
                }
            }
        });

        Arc::new(Self {
            pair,
            metrics,
            stop_tx,
        })
    }

    pub fn pair(&self) -> Arc<PairBooks> {
        self.pair.clone()
    }

    pub fn metrics(&self) -> Arc<FeedMetrics> {
        self.metrics.clone()
    }

    pub fn stop(&self) {
        info!(symbol = %self.pair.symbol, "stopping pair manager");
        let _ = self.stop_tx.send(true);
    }
}

fn log_digest(pair: &PairBooks, metrics: &FeedMetrics) {
    for (label, books) in [("spot", &pair.spot), ("perp", &pair.perp)] {
        for venue in books.venues() {
            let Some(book) = books.get(&venue) else { continue };
            let book = book.read();
            let (Some((bid, _)), Some((ask, _))) = (book.best_bid(), book.best_ask()) else {
                continue;
            };
            let spread_pct = if bid > 0.0 { ((ask - bid) / bid) * 100.0 } else { 0.0 };
            debug!(
                symbol = %pair.symbol,
                market = label,
                venue = %venue,
                best_bid = bid,
                best_ask = ask,
                spread_pct,
                bid_levels = book.bid_depth(),
                ask_levels = book.ask_depth(),
                latency_ms = book.latency_ms,
                "book digest"
            );
        }
    }
    debug!(
        symbol = %pair.symbol,
        messages = metrics.messages_received.load(Ordering::Relaxed),
        decode_errors = metrics.decode_errors.load(Ordering::Relaxed),
        reconnects = metrics.reconnects.load(Ordering::Relaxed),
        "feed counters"
    );
}

/// Registry of all live pair managers.
pub struct BookManager {
    signal_url: String,
    analyzer: Arc<Analyzer>,
    pairs: RwLock<HashMap<String, Arc<PairManager>>>,
}

impl BookManager {
    pub fn new(signal_url: &str, analyzer: Arc<Analyzer>) -> Arc<Self> {
        Arc::new(Self {
            signal_url: signal_url.to_string(),
            analyzer,
            pairs: RwLock::new(HashMap::new()),
        })
    }

    /// Start monitoring a symbol. Adding a symbol twice is a no-op.
    pub fn add_pair(&self, symbol: &str) {
        let mut pairs = self.pairs.write();
        if pairs.contains_key(symbol) {
            return;
        }
        let manager = PairManager::start(symbol, &self.signal_url, self.analyzer.clone());
        pairs.insert(symbol.to_string(), manager);
    }

    pub fn get(&self, symbol: &str) -> Option<Arc<PairManager>> {
        self.pairs.read().get(symbol).cloned()
    }

    pub fn symbols(&self) -> Vec<String> {
        self.pairs.read().keys().cloned().collect()
    }

    pub fn stop_all(&self) {
        let mut pairs = self.pairs.write();
        for manager in pairs.values() {
            manager.stop();
        }
        pairs.clear();
    }

    /// Live top-of-book (best bid, best ask) for a symbol/venue, used by the
    /// dry-run fill path. Each side is `(price, usdt_notional)`.
    #[allow(clippy::type_complexity)]
    pub fn top_of_book(
        &self,
        symbol: &str,
        venue: &str,
        perp: bool,
    ) -> Option<(Option<(f64, f64)>, Option<(f64, f64)>)> {
        let manager = self.get(symbol)?;
        let pair = manager.pair();
        let books = if perp { &pair.perp } else { &pair.spot };
        let book = books.get(venue)?;
        let book = book.read();
        Some((book.best_bid(), book.best_ask()))
    }
}
