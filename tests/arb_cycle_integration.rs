//! Full-cycle integration: a local signal feed pushes books, the detector
//! finds the spot/perp spread, the controller opens both legs on simulated
//! venues, a converging feed closes the cycle, and the sink receives the
//! whole event stream.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rmpv::Value;
use tokio::net::TcpListener;
use tokio_tungstenite::{accept_async, tungstenite::Message};

use spreadbot_backend::arbitrage::controller::{ControllerConfig, PositionController};
use spreadbot_backend::arbitrage::gate::ExecutionGate;
use spreadbot_backend::exchanges::paper::{PaperConfig, PaperExchange};
use spreadbot_backend::exchanges::{BalanceBook, ExchangeRouter};
use spreadbot_backend::notify::RecordingSink;
use spreadbot_backend::orderbook::analyzer::{Analyzer, AnalyzerConfig};
use spreadbot_backend::orderbook::manager::BookManager;

const SYMBOL: &str = "doge-usdt";
const SPOT_ASK: f64 = 0.2363;
const SPOT_BID: f64 = 0.2361;
const PERP_BID_ENTRY: f64 = 0.2375; // ~0.508% over the spot ask
const PERP_ASK_ENTRY: f64 = 0.2377;
const PERP_BID_CONVERGED: f64 = 0.2364; // ~0.042% over the spot ask
const PERP_ASK_CONVERGED: f64 = 0.2366;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn side(levels: &[(f64, f64)]) -> Value {
    Value::Map(
        levels
            .iter()
            .map(|(price, notional)| (Value::from(format!("{price}")), Value::from(*notional)))
            .collect(),
    )
}

/// `{ topic: { venue: [[bids, asks], latency, ts] } }`
fn frame(topic: &str, venue: &str, bids: &[(f64, f64)], asks: &[(f64, f64)]) -> Vec<u8> {
    let entry = Value::Array(vec![
        Value::Array(vec![side(bids), side(asks)]),
        Value::from(12.0f64),
        Value::from(now_ms()),
    ]);
    let value = Value::Map(vec![(
        Value::from(topic),
        Value::Map(vec![(Value::from(venue), entry)]),
    )]);
    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, &value).unwrap();
    buf
}

/// Minimal signal feed: answers each subscription with a scripted frame
/// sequence for that topic.
async fn run_feed(listener: TcpListener) {
    loop {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        tokio::spawn(async move {
            let Ok(ws) = accept_async(stream).await else {
                return;
            };
            let (mut write, mut read) = ws.split();

            let topic = loop {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => {
                        let parsed: HashMap<String, String> =
                            serde_json::from_str(&text).unwrap_or_default();
                        if let Some(topic) = parsed.get("topic") {
                            break topic.clone();
                        }
                    }
                    Some(Ok(_)) => continue,
                    _ => return,
                }
            };

            if topic == SYMBOL {
                // Fresh spot book, repeated to stay inside the freshness gate.
                for _ in 0..40 {
                    let data = frame(SYMBOL, "okx", &[(SPOT_BID, 80.0)], &[(SPOT_ASK, 60.0)]);
                    if write.send(Message::Binary(data)).await.is_err() {
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
            } else {
                // Perp book: entry prices first, then a converged market.
                for _ in 0..4 {
                    let data = frame(
                        &topic,
                        "binance",
                        &[(PERP_BID_ENTRY, 55.0)],
                        &[(PERP_ASK_ENTRY, 55.0)],
                    );
                    if write.send(Message::Binary(data)).await.is_err() {
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
                for _ in 0..40 {
                    let data = frame(
                        &topic,
                        "binance",
                        &[(PERP_BID_CONVERGED, 55.0)],
                        &[(PERP_ASK_CONVERGED, 55.0)],
                    );
                    if write.send(Message::Binary(data)).await.is_err() {
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
            }
        });
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn feed_to_summary_round_trip() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    tokio::spawn(run_feed(listener));
    let url = format!("ws://{addr}");

    let sink = RecordingSink::new();
    let gate = ExecutionGate::new();
    let snapshots = BalanceBook::new();
    let router = ExchangeRouter::new();

    let controller = PositionController::new(
        ControllerConfig::default(),
        router.clone(),
        sink.clone(),
        gate.clone(),
    );

    let analyzer = Analyzer::new(
        AnalyzerConfig {
            supported_venues: ["okx", "binance"].iter().map(|s| s.to_string()).collect(),
            target_notional_usd: 20.0,
            spread_floors_pct: HashMap::new(),
            risk_coefficient: 10.0,
            default_spread_floor_pct: 0.5,
        },
        gate.clone(),
        controller.clone(),
    );

    let books = BookManager::new(&url, analyzer);

    // Dry-run venues fill at the live top-of-book from the same registry.
    for venue in ["okx", "binance"] {
        router.register(PaperExchange::new(
            venue,
            books.clone(),
            snapshots.clone(),
            PaperConfig {
                fee_rate: 0.0,
                latency_ms: (0, 5),
                starting_usdt: 200.0,
            },
        ));
    }

    books.add_pair(SYMBOL);

    // One full cycle: open on the wide spread, close on convergence.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        if sink.summaries.lock().len() >= 1 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "no trade summary within 15s; executions so far: {:?}",
            sink.executions.lock().len()
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    books.stop_all();

    let executions = sink.executions.lock().clone();
    let opens: Vec<_> = executions.iter().filter(|e| e.action == "open").collect();
    let closes: Vec<_> = executions.iter().filter(|e| e.action == "close").collect();
    assert_eq!(opens.len(), 2, "one open per leg");
    assert_eq!(closes.len(), 2, "one close per leg");

    let open_sides: Vec<&str> = opens.iter().map(|e| e.side.as_str()).collect();
    assert!(open_sides.contains(&"spot_long"));
    assert!(open_sides.contains(&"futures_short"));
    let spot_open = opens.iter().find(|e| e.side == "spot_long").unwrap();
    assert_eq!(spot_open.exchange, "okx");
    assert!((spot_open.price - SPOT_ASK).abs() < 1e-9);
    let perp_open = opens.iter().find(|e| e.side == "futures_short").unwrap();
    assert_eq!(perp_open.exchange, "binance");
    assert!((perp_open.price - PERP_BID_ENTRY).abs() < 1e-9);

    let summaries = sink.summaries.lock();
    let summary = &summaries[0];
    assert_eq!(summary.pair, SYMBOL);
    assert_eq!(summary.spot_exchange, "okx");
    assert_eq!(summary.futures_exchange, "binance");
    assert!(summary.entry_spread_pct > 0.5);
    assert!(summary.exit_spread_pct < summary.entry_spread_pct);
    // The short leg gains on the converged price; spot leg pays the
    // bid/ask spread. Either way both profits are finite and the total is
    // their sum.
    assert!(
        (summary.total_profit - (summary.spot_profit + summary.futures_profit)).abs() < 1e-9
    );

    // Cycle fully retired: table empty, gate reopened.
    assert_eq!(controller.active_count(), 0);
    assert!(!gate.is_executing());
}
