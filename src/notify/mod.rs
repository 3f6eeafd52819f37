//! Best-effort trade event publishing.
//!
//! Two logical topics: per-leg executions and per-cycle summaries. Publishes
//! are bounded by a 3 s timeout and never surface failures to the trading
//! path; without a reachable broker the sink degrades to a no-op and the
//! engine keeps trading.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub const TRADE_EXECUTION_TOPIC: &str = "arbitrage-trade-execution";
pub const TRADE_SUMMARY_TOPIC: &str = "arbitrage-trade-summary";

const PUBLISH_TIMEOUT: Duration = Duration::from_secs(3);

/// One leg execution (open or close).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TradeExecution {
    pub exchange: String,
    pub pair: String,
    /// `spot_long` | `futures_short`
    pub side: String,
    /// `open` | `close`
    pub action: String,
    /// USDT notional of the leg.
    pub amount: f64,
    pub price: f64,
    pub spread_pct: f64,
    pub timestamp: DateTime<Utc>,
}

/// Final P&L record once all four legs of a cycle completed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TradeSummary {
    pub pair: String,
    pub spot_exchange: String,
    pub futures_exchange: String,
    pub entry_spread_pct: f64,
    pub exit_spread_pct: f64,
    pub spot_profit: f64,
    pub futures_profit: f64,
    pub total_profit: f64,
    pub amount: f64,
    pub duration_seconds: f64,
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
}

/// Fire-and-forget sink for trade events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish_execution(&self, event: TradeExecution);
    async fn publish_summary(&self, summary: TradeSummary);
}

/// Redis pub/sub sink. Connection failures at startup or publish time are
/// logged and swallowed.
pub struct RedisPublisher {
    conn: Option<ConnectionManager>,
}

impl RedisPublisher {
    /// Connect to the broker; a broker that is down yields a sink that
    /// drops every event (the engine must still trade).
    pub async fn connect(url: &str) -> Arc<Self> {
        let conn = match redis::Client::open(url) {
            Ok(client) => match ConnectionManager::new(client).await {
                Ok(conn) => {
                    info!(url = %url, "connected to redis, trade events enabled");
                    Some(conn)
                }
                Err(err) => {
                    warn!(url = %url, error = %err, "redis unavailable, trade events disabled");
                    None
                }
            },
            Err(err) => {
                warn!(url = %url, error = %err, "bad redis url, trade events disabled");
                None
            }
        };
        Arc::new(Self { conn })
    }

    async fn publish_json(&self, topic: &str, payload: String) {
        let Some(conn) = &self.conn else {
            return;
        };
        let mut conn = conn.clone();
        let publish = async move {
            let result: redis::RedisResult<i64> = conn.publish(topic, payload).await;
            result
        };
        match tokio::time::timeout(PUBLISH_TIMEOUT, publish).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => warn!(topic = %topic, error = %err, "publish failed"),
            Err(_) => warn!(topic = %topic, "publish timed out"),
        }
    }
}

#[async_trait]
impl EventSink for RedisPublisher {
    async fn publish_execution(&self, event: TradeExecution) {
        match serde_json::to_string(&event) {
            Ok(payload) => {
                self.publish_json(TRADE_EXECUTION_TOPIC, payload).await;
                info!(
                    action = %event.action,
                    side = %event.side,
                    pair = %event.pair,
                    exchange = %event.exchange,
                    "published trade execution"
                );
            }
            Err(err) => warn!(error = %err, "failed to serialize trade execution"),
        }
    }

    async fn publish_summary(&self, summary: TradeSummary) {
        match serde_json::to_string(&summary) {
            Ok(payload) => {
                self.publish_json(TRADE_SUMMARY_TOPIC, payload).await;
                info!(
                    pair = %summary.pair,
                    total_profit = summary.total_profit,
                    "published trade summary"
                );
            }
            Err(err) => warn!(error = %err, "failed to serialize trade summary"),
        }
    }
}

/// Sink that drops everything. Used when publishing is disabled.
#[derive(Default)]
pub struct NullSink;

#[async_trait]
impl EventSink for NullSink {
    async fn publish_execution(&self, _event: TradeExecution) {}
    async fn publish_summary(&self, _summary: TradeSummary) {}
}

/// Test sink that records everything it is handed.
#[derive(Default)]
pub struct RecordingSink {
    pub executions: parking_lot::Mutex<Vec<TradeExecution>>,
    pub summaries: parking_lot::Mutex<Vec<TradeSummary>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn publish_execution(&self, event: TradeExecution) {
        self.executions.lock().push(event);
    }

    async fn publish_summary(&self, summary: TradeSummary) {
        self.summaries.lock().push(summary);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_event_wire_shape() {
        let event = TradeExecution {
            exchange: "binance".into(),
            pair: "doge-usdt".into(),
            side: "futures_short".into(),
            action: "open".into(),
            amount: 20.0,
            price: 0.2368,
            spread_pct: 0.21,
            timestamp: Utc::now(),
        };
        let json: serde_json::Value = serde_json::from_str(&serde_json::to_string(&event).unwrap()).unwrap();
        assert_eq!(json["exchange"], "binance");
        assert_eq!(json["side"], "futures_short");
        assert_eq!(json["action"], "open");
        // chrono serializes RFC3339
        assert!(json["timestamp"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn summary_wire_shape() {
        let now = Utc::now();
        let summary = TradeSummary {
            pair: "doge-usdt".into(),
            spot_exchange: "okx".into(),
            futures_exchange: "binance".into(),
            entry_spread_pct: 0.5,
            exit_spread_pct: 0.18,
            spot_profit: 0.03,
            futures_profit: 0.02,
            total_profit: 0.05,
            amount: 20.0,
            duration_seconds: 42.0,
            open_time: now,
            close_time: now,
        };
        let json: serde_json::Value = serde_json::from_str(&serde_json::to_string(&summary).unwrap()).unwrap();
        assert_eq!(json["spot_exchange"], "okx");
        assert_eq!(json["futures_exchange"], "binance");
        assert_eq!(json["duration_seconds"], 42.0);
        assert_eq!(json["total_profit"], 0.05);
    }

    #[tokio::test]
    async fn recording_sink_captures_events() {
        let sink = RecordingSink::new();
        sink.publish_execution(TradeExecution {
            exchange: "okx".into(),
            pair: "doge-usdt".into(),
            side: "spot_long".into(),
            action: "open".into(),
            amount: 20.0,
            price: 0.2363,
            spread_pct: 0.21,
            timestamp: Utc::now(),
        })
        .await;
        assert_eq!(sink.executions.lock().len(), 1);
    }
}
