//! Signal-feed subscription sessions.
//!
//! One session per `(symbol, market)` topic: connect to the signal URL,
//! send `{"topic": "<topic>"}`, then merge every frame into the pair's
//! books and hand the pair to the analyzer. Any read/decode/session error
//! tears the connection down and reconnects after a fixed 5 s back-off,
//! forever, until the stop signal flips.

use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{connect_async_with_config, tungstenite::Message};
use tracing::{debug, info, warn};

use super::analyzer::Analyzer;
use super::codec::decode_frame;
use super::pair::PairBooks;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);
/// Frames can carry full multi-pair state; keep the read limit well above
/// the protocol's 1 MiB floor.
const MAX_MESSAGE_BYTES: usize = 16 << 20;

/// Per-pair feed counters, shared by the spot and perp sessions.
#[derive(Default)]
pub struct FeedMetrics {
    pub messages_received: AtomicU64,
    pub decode_errors: AtomicU64,
    pub reconnects: AtomicU64,
}

impl FeedMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

pub(crate) struct Session {
    pub url: String,
    pub topic: String,
    pub is_perp: bool,
    pub pair: Arc<PairBooks>,
    pub analyzer: Arc<Analyzer>,
    pub metrics: Arc<FeedMetrics>,
}

impl Session {
    /// Maintain the subscription until the stop signal flips.
    pub async fn run(self, mut stop: watch::Receiver<bool>) {
        loop {
            if *stop.borrow() {
                return;
            }
            match self.connect_and_listen(&mut stop).await {
                Ok(()) => return, // orderly stop
                Err(err) => {
                    self.metrics.reconnects.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        topic = %self.topic,
                        error = %err,
                        delay_s = RECONNECT_DELAY.as_secs(),
                        "feed session dropped, reconnecting"
                    );
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                _ = stop.changed() => return,
            }
        }
    }

    async fn connect_and_listen(&self, stop: &mut watch::Receiver<bool>) -> anyhow::Result<()> {
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(MAX_MESSAGE_BYTES);
        config.max_frame_size = Some(MAX_MESSAGE_BYTES);
        let (ws, _) = connect_async_with_config(&self.url, Some(config), false).await?;
        let (mut write, mut read) = ws.split();

        let subscribe = serde_json::json!({ "topic": self.topic }).to_string();
        write.send(Message::Text(subscribe)).await?;
        info!(topic = %self.topic, url = %self.url, "subscribed to signal feed");

        loop {
            tokio::select! {
                _ = stop.changed() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
                msg = read.next() => {
                    let Some(msg) = msg else {
                        anyhow::bail!("stream ended");
                    };
                    match msg? {
                        Message::Binary(data) => self.handle_frame(&data),
                        Message::Text(text) => self.handle_frame(text.as_bytes()),
                        Message::Ping(payload) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Message::Close(frame) => {
                            debug!(topic = %self.topic, ?frame, "feed closed the session");
                            anyhow::bail!("closed by feed");
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    /// Decode one frame and merge whatever matches our topic. Decode errors
    /// drop the frame; the session keeps running.
    fn handle_frame(&self, raw: &[u8]) {
        self.metrics.messages_received.fetch_add(1, Ordering::Relaxed);

        let updates = match decode_frame(raw) {
            Ok(updates) => updates,
            Err(err) => {
                self.metrics.decode_errors.fetch_add(1, Ordering::Relaxed);
                debug!(topic = %self.topic, error = %err, "dropping undecodable frame");
                return;
            }
        };

        let mut merged = false;
        for update in updates {
            if update.topic != self.topic {
                continue;
            }
            let books = if self.is_perp {
                &self.pair.perp
            } else {
                &self.pair.spot
            };
            for venue in update.venues {
                let book = books.get_or_create(&venue.venue);
                book.write().merge(
                    &venue.bids,
                    &venue.asks,
                    venue.latency_ms,
                    venue.last_update_ts_ms,
                );
                merged = true;
            }
        }

        if merged {
            self.analyzer.analyze_pair(&self.pair);
        }
    }
}
