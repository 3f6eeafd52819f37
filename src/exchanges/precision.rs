//! Per-pair quantity/price precision tables and rounding helpers.
//!
//! Venues reject orders whose quantity carries more decimals than the pair
//! allows, so every quantity is floor-rounded before it goes on the wire.
//! Prices, where a venue wants them as strings, are formatted to the pair's
//! price precision.

use once_cell::sync::Lazy;
use std::collections::HashMap;

use crate::util::fp;

/// Decimal places accepted for a pair's order quantity and price.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairPrecision {
    pub quantity_precision: u8,
    pub price_precision: u8,
}

static PAIR_PRECISIONS: Lazy<HashMap<&'static str, PairPrecision>> = Lazy::new(|| {
    let mut m = HashMap::new();
    let mut put = |pair: &'static str, quantity: u8, price: u8| {
        m.insert(
            pair,
            PairPrecision {
                quantity_precision: quantity,
                price_precision: price,
            },
        );
    };
    put("btc-usdt", 5, 2);
    put("eth-usdt", 4, 2);
    put("sol-usdt", 2, 3);
    put("doge-usdt", 0, 6);
    put("xrp-usdt", 1, 4);
    put("ton-usdt", 2, 4);
    put("ada-usdt", 2, 5);
    put("trx-usdt", 0, 5);
    put("link-usdt", 2, 3);
    put("arb-usdt", 1, 4);
    put("op-usdt", 2, 4);
    put("ltc-usdt", 3, 2);
    put("bch-usdt", 3, 2);
    put("uni-usdt", 2, 3);
    put("avax-usdt", 2, 3);
    put("apt-usdt", 2, 3);
    put("near-usdt", 1, 4);
    put("matic-usdt", 0, 5);
    put("pepe-usdt", 0, 8);
    put("floki-usdt", 0, 7);
    put("sui-usdt", 1, 4);
    put("icp-usdt", 2, 3);
    put("xvs-usdt", 2, 3);
    put("ach-usdt", 0, 6);
    put("fet-usdt", 1, 4);
    put("rndr-usdt", 2, 4);
    put("enj-usdt", 1, 5);
    put("cfx-usdt", 0, 5);
    put("kas-usdt", 0, 6);
    put("mina-usdt", 1, 5);
    put("gala-usdt", 0, 6);
    put("blur-usdt", 1, 5);
    put("wojak-usdt", 0, 7);
    put("bnb-usdt", 3, 2);
    m
});

/// Precision for a pair; unknown pairs fall back to 8/8 decimals.
pub fn precision_for(pair: &str) -> PairPrecision {
    PAIR_PRECISIONS.get(pair).copied().unwrap_or(PairPrecision {
        quantity_precision: 8,
        price_precision: 8,
    })
}

/// Floor `qty` to the pair's quantity precision.
pub fn floor_quantity(qty: f64, pair: &str) -> f64 {
    let prec = precision_for(pair);
    let multiplier = 10f64.powi(prec.quantity_precision as i32);
    (qty * multiplier).floor() / multiplier
}

/// Render a quantity with exactly the pair's quantity decimals.
pub fn format_quantity(qty: f64, pair: &str) -> String {
    let prec = precision_for(pair);
    format!("{:.*}", prec.quantity_precision as usize, qty)
}

/// Render a price with exactly the pair's price decimals.
pub fn format_price(price: f64, pair: &str) -> String {
    let prec = precision_for(pair);
    format!("{:.*}", prec.price_precision as usize, price)
}

/// Smallest USDT notional expressible at this pair's quantity precision:
/// one quantity step (`10^-qp`) valued at `price`.
pub fn min_achievable_volume(price: f64, pair: &str) -> f64 {
    let prec = precision_for(pair);
    10f64.powi(-(prec.quantity_precision as i32)) * price
}

/// Whether `volume_usd` at `price` survives quantity flooring, i.e. the order
/// would not round down to zero at placement time.
pub fn can_achieve_volume(volume_usd: f64, price: f64, pair: &str) -> bool {
    if !fp::is_positive(price) {
        return false;
    }
    fp::is_positive(floor_quantity(volume_usd / price, pair))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_pair_lookup() {
        let p = precision_for("doge-usdt");
        assert_eq!(p.quantity_precision, 0);
        assert_eq!(p.price_precision, 6);
    }

    #[test]
    fn unknown_pair_defaults_to_eight() {
        let p = precision_for("zzz-usdt");
        assert_eq!(p.quantity_precision, 8);
        assert_eq!(p.price_precision, 8);
    }

    #[test]
    fn floor_never_rounds_up() {
        // xrp-usdt: 1 decimal
        assert_eq!(floor_quantity(12.39, "xrp-usdt"), 12.3);
        assert_eq!(floor_quantity(12.999, "xrp-usdt"), 12.9);
        // doge-usdt: whole units only
        assert_eq!(floor_quantity(84.6, "doge-usdt"), 84.0);
    }

    #[test]
    fn floor_is_idempotent_at_precision() {
        let once = floor_quantity(0.123456789, "btc-usdt");
        let twice = floor_quantity(once, "btc-usdt");
        assert_eq!(format_quantity(once, "btc-usdt"), format_quantity(twice, "btc-usdt"));
    }

    #[test]
    fn format_matches_precision() {
        assert_eq!(format_quantity(12.3, "xrp-usdt"), "12.3");
        assert_eq!(format_price(0.236812, "doge-usdt"), "0.236812");
        assert_eq!(format_price(43000.5, "btc-usdt"), "43000.50");
    }

    #[test]
    fn min_achievable_is_one_step() {
        // sol-usdt quantity precision 2 -> one step is 0.01 units
        let v = min_achievable_volume(150.0, "sol-usdt");
        assert!((v - 1.5).abs() < 1e-9);
        // doge-usdt precision 0 -> one whole coin
        let v = min_achievable_volume(2.5, "doge-usdt");
        assert!((v - 2.5).abs() < 1e-9);
    }

    #[test]
    fn sub_step_volume_is_unachievable() {
        // 0.80 USDT at price 2.5 with whole-unit precision floors to zero
        assert!(!can_achieve_volume(0.80, 2.5, "doge-usdt"));
        assert!(can_achieve_volume(5.0, 2.5, "doge-usdt"));
    }

    #[test]
    fn zero_price_is_unachievable() {
        assert!(!can_achieve_volume(10.0, 0.0, "doge-usdt"));
    }
}
