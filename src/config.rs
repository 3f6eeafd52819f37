//! Runtime configuration.
//!
//! Credentials and endpoints come from the environment (`.env` supported);
//! the symbol set, per-symbol spread floors, venue whitelist and precision
//! tables are compiled in.

use std::collections::{HashMap, HashSet};
use std::env;

use crate::arbitrage::controller::ControllerConfig;
use crate::orderbook::analyzer::AnalyzerConfig;

pub const DEFAULT_SIGNAL_WS_URL: &str = "ws://127.0.0.1:4010";
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Venues with trade adapters compiled in.
pub const SUPPORTED_VENUES: &[&str] = &["binance", "bitget", "whitebit", "okx"];

/// Symbols monitored by default.
pub const DEFAULT_SYMBOLS: &[&str] = &["xrp-usdt", "ton-usdt", "ada-usdt", "trx-usdt", "avax-usdt"];

/// Per-symbol entry spread floors in percent, before the risk coefficient.
fn spread_floors() -> HashMap<String, f64> {
    let table: &[(&str, f64)] = &[
        ("btc-usdt", 0.5),
        ("eth-usdt", 0.6),
        ("sol-usdt", 0.7),
        ("doge-usdt", 0.8),
        ("xrp-usdt", 0.7),
        ("ton-usdt", 0.9),
        ("ada-usdt", 0.6),
        ("trx-usdt", 0.7),
        ("link-usdt", 0.7),
        ("arb-usdt", 0.8),
        ("op-usdt", 0.8),
        ("ltc-usdt", 0.6),
        ("bch-usdt", 0.7),
        ("uni-usdt", 0.8),
        ("avax-usdt", 0.8),
        ("apt-usdt", 0.3),
        ("near-usdt", 0.8),
        ("matic-usdt", 0.7),
        ("sui-usdt", 0.9),
        ("icp-usdt", 0.9),
        ("xvs-usdt", 1.0),
        ("ach-usdt", 1.1),
        ("fet-usdt", 0.9),
        ("rndr-usdt", 0.8),
        ("enj-usdt", 0.9),
        ("cfx-usdt", 0.5),
        ("kas-usdt", 0.6),
        ("mina-usdt", 1.0),
        ("gala-usdt", 1.1),
        ("blur-usdt", 1.2),
        ("wojak-usdt", 1.3),
        ("bnb-usdt", 0.5),
    ];
    table.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

#[derive(Debug, Clone)]
pub struct Config {
    pub signal_ws_url: String,
    pub redis_url: String,
    pub symbols: Vec<String>,
    pub dry_run: bool,
    pub analyzer: AnalyzerConfig,
    pub controller: ControllerConfig,
}

impl Config {
    pub fn from_env() -> Self {
        let signal_ws_url = env::var("SIGNAL_WS_URL").unwrap_or_else(|_| {
            tracing::warn!(
                default = DEFAULT_SIGNAL_WS_URL,
                "SIGNAL_WS_URL not set, using default"
            );
            DEFAULT_SIGNAL_WS_URL.to_string()
        });
        let redis_url = env::var("REDIS_URL").unwrap_or_else(|_| DEFAULT_REDIS_URL.to_string());
        let dry_run = env::var("DRY_RUN")
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
            .unwrap_or(false);

        let mut controller = ControllerConfig::default();
        if let Ok(v) = env::var("ENTRY_THRESHOLD_PCT") {
            if let Ok(pct) = v.parse::<f64>() {
                if pct > 0.0 {
                    controller.entry_threshold_pct = pct;
                }
            }
        }

        Self {
            signal_ws_url,
            redis_url,
            symbols: DEFAULT_SYMBOLS.iter().map(|s| s.to_string()).collect(),
            dry_run,
            analyzer: AnalyzerConfig {
                supported_venues: supported_venue_set(),
                target_notional_usd: 20.0,
                spread_floors_pct: spread_floors(),
                risk_coefficient: 10.0,
                default_spread_floor_pct: 0.5,
            },
            controller,
        }
    }

    /// API credentials for a venue: `(key, secret, passphrase)` from
    /// `<VENUE>_API_KEY` / `<VENUE>_API_SECRET` / `<VENUE>_PASSPHRASE`.
    pub fn venue_credentials(venue: &str) -> Option<(String, String, Option<String>)> {
        let upper = venue.to_uppercase();
        let key = env::var(format!("{upper}_API_KEY")).ok()?;
        let secret = env::var(format!("{upper}_API_SECRET")).ok()?;
        if key.is_empty() || secret.is_empty() {
            return None;
        }
        let passphrase = env::var(format!("{upper}_PASSPHRASE")).ok().filter(|p| !p.is_empty());
        Some((key, secret, passphrase))
    }
}

pub fn supported_venue_set() -> HashSet<String> {
    SUPPORTED_VENUES.iter().map(|v| v.to_string()).collect()
}
