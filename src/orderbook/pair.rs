//! Per-symbol book state: one spot and one perpetual book per venue.
//!
//! Venue entries are created lazily the first time the feed mentions the
//! venue and never expire; a book that stops updating is simply judged
//! unreliable at query time.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use super::book::OrderBook;

pub type SharedBook = Arc<RwLock<OrderBook>>;

/// All books of one market segment (spot or perp), keyed by venue name.
#[derive(Default)]
pub struct VenueBooks {
    books: RwLock<HashMap<String, SharedBook>>,
}

impl VenueBooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Book for `venue`, creating an empty one on first sight.
    pub fn get_or_create(&self, venue: &str) -> SharedBook {
        {
            let books = self.books.read();
            if let Some(book) = books.get(venue) {
                return book.clone();
            }
        }
        let mut books = self.books.write();
        books
            .entry(venue.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(OrderBook::new())))
            .clone()
    }

    pub fn get(&self, venue: &str) -> Option<SharedBook> {
        self.books.read().get(venue).cloned()
    }

    pub fn venues(&self) -> Vec<String> {
        self.books.read().keys().cloned().collect()
    }
}

/// The spot and perpetual books of one configured symbol.
pub struct PairBooks {
    pub symbol: String,
    pub spot: VenueBooks,
    pub perp: VenueBooks,
}

impl PairBooks {
    pub fn new(symbol: &str) -> Arc<Self> {
        Arc::new(Self {
            symbol: symbol.to_string(),
            spot: VenueBooks::new(),
            perp: VenueBooks::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn venue_entry_created_lazily_and_reused() {
        let books = VenueBooks::new();
        assert!(books.get("okx").is_none());
        let a = books.get_or_create("okx");
        let b = books.get_or_create("okx");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(books.venues(), vec!["okx".to_string()]);
    }

    #[test]
    fn spot_and_perp_sides_are_distinct() {
        let pair = PairBooks::new("doge-usdt");
        pair.spot.get_or_create("binance");
        assert!(pair.perp.get("binance").is_none());
    }
}
