//! SpreadBot runtime: wire the feed, detector, controller, venue registry
//! and publisher together and run until interrupted.

use anyhow::Result;
use dotenv::dotenv;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use spreadbot_backend::arbitrage::controller::PositionController;
use spreadbot_backend::arbitrage::gate::ExecutionGate;
use spreadbot_backend::config::{Config, SUPPORTED_VENUES};
use spreadbot_backend::exchanges::paper::{PaperConfig, PaperExchange};
use spreadbot_backend::exchanges::{register_live_clients, BalanceBook, ExchangeRouter};
use spreadbot_backend::notify::{EventSink, RedisPublisher};
use spreadbot_backend::orderbook::analyzer::Analyzer;
use spreadbot_backend::orderbook::manager::BookManager;

#[tokio::main]
async fn main() -> Result<()> {
    if dotenv().is_err() {
        eprintln!("no .env file found, using process environment");
    }

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    info!(
        signal_url = %config.signal_ws_url,
        dry_run = config.dry_run,
        symbols = ?config.symbols,
        "starting spreadbot"
    );

    // Publisher first: trading must work even when the broker is down
    // (connect degrades to a dropping sink on failure).
    let sink: Arc<dyn EventSink> = RedisPublisher::connect(&config.redis_url).await;

    let snapshots = BalanceBook::new();
    let router = ExchangeRouter::new();
    let gate = ExecutionGate::new();

    let controller = PositionController::new(
        config.controller.clone(),
        router.clone(),
        sink,
        gate.clone(),
    );

    let analyzer = Analyzer::new(config.analyzer.clone(), gate, controller.clone());
    let books = BookManager::new(&config.signal_ws_url, analyzer);

    if config.dry_run {
        // Simulated venues fill at the live top-of-book from the shared
        // book registry; the event stream matches live trading.
        warn!("DRY_RUN enabled, using simulated venues");
        for venue in SUPPORTED_VENUES {
            router.register(PaperExchange::new(
                venue,
                books.clone(),
                snapshots.clone(),
                PaperConfig::default(),
            ));
        }
    } else {
        register_live_clients(&router, &snapshots);
        if router.venues().is_empty() {
            warn!("no venue credentials configured, detector will never execute");
        }
    }

    for symbol in &config.symbols {
        books.add_pair(symbol);
    }
    info!(pairs = books.symbols().len(), "all pair managers started");

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, shutting down");
    books.stop_all();
    if let Some(position) = config
        .symbols
        .iter()
        .find_map(|s| controller.active_position(s))
    {
        warn!(symbol = %position.symbol, "closing live position before exit");
        controller.close_position(&position.symbol).await;
    }

    Ok(())
}
