//! Position lifecycle: open two legs in parallel, track the live spread,
//! close both legs when the exit policy fires.
//!
//! Locking is two-level: one mutex guards membership of the active-position
//! table, each position guards its own mutable fields. Venue calls and
//! publishes always happen outside both locks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::arbitrage::gate::ExecutionGate;
use crate::exchanges::{ExchangeClient, ExchangeError, ExchangeRouter, TradeResult};
use crate::notify::{EventSink, TradeExecution, TradeSummary};
use crate::orderbook::analyzer::{ExecutionHandler, Opportunity};
use crate::util::fp;

/// Exit-policy and sizing knobs.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Minimum entry spread (percent) to open a cycle.
    pub entry_threshold_pct: f64,
    /// Close once this much of the entry spread has converged away.
    pub convergence_exit_pct: f64,
    /// Close after holding this long regardless of spread.
    pub max_hold_secs: f64,
    /// Hard per-position watchdog; fires even if the feed stalls.
    pub watchdog_secs: u64,
    /// Estimated round-trip fee drag (percent of notional) used in the
    /// tracking log's profit estimate.
    pub round_trip_fee_pct: f64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            entry_threshold_pct: 0.5,
            convergence_exit_pct: 60.0,
            max_hold_secs: 58.0,
            watchdog_secs: 65,
            round_trip_fee_pct: 0.15,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionState {
    Opening,
    Open,
    Closing,
    Closed,
}

#[derive(Debug)]
struct PositionInner {
    state: PositionState,
    last_spread_pct: f64,
    last_tracked_at: DateTime<Utc>,
}

/// One hedged spot-long / perp-short cycle.
pub struct Position {
    pub symbol: String,
    pub perp_venue: String,
    pub spot_venue: String,
    pub entry_perp_price: f64,
    pub entry_spot_price: f64,
    pub entry_spread_pct: f64,
    pub amount_usd: f64,
    pub opened_at: DateTime<Utc>,
    opened_mono: Instant,
    inner: Mutex<PositionInner>,
}

impl Position {
    fn new(opp: &Opportunity) -> Arc<Self> {
        Arc::new(Self {
            symbol: opp.symbol.clone(),
            perp_venue: opp.perp_venue.clone(),
            spot_venue: opp.spot_venue.clone(),
            entry_perp_price: opp.perp_bid_price,
            entry_spot_price: opp.spot_ask_price,
            entry_spread_pct: opp.spread_pct,
            amount_usd: opp.usable_volume_usd,
            opened_at: Utc::now(),
            opened_mono: Instant::now(),
            inner: Mutex::new(PositionInner {
                state: PositionState::Opening,
                last_spread_pct: opp.spread_pct,
                last_tracked_at: Utc::now(),
            }),
        })
    }

    pub fn state(&self) -> PositionState {
        self.inner.lock().state
    }

    fn held_secs(&self) -> f64 {
        self.opened_mono.elapsed().as_secs_f64()
    }
}

type ActiveTable = Arc<Mutex<HashMap<String, Arc<Position>>>>;

/// Drives the two-leg lifecycle against the venue registry.
pub struct PositionController {
    config: ControllerConfig,
    router: Arc<ExchangeRouter>,
    sink: Arc<dyn EventSink>,
    gate: Arc<ExecutionGate>,
    active: ActiveTable,
}

impl PositionController {
    pub fn new(
        config: ControllerConfig,
        router: Arc<ExchangeRouter>,
        sink: Arc<dyn EventSink>,
        gate: Arc<ExecutionGate>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            router,
            sink,
            gate,
            active: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn active_position(&self, symbol: &str) -> Option<Arc<Position>> {
        self.active.lock().get(symbol).cloned()
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    async fn open_cycle(&self, opp: Opportunity) -> bool {
        if fp::lt(opp.spread_pct, self.config.entry_threshold_pct) {
            return false;
        }

        let position = Position::new(&opp);
        {
            let mut active = self.active.lock();
            if active.contains_key(&opp.symbol) {
                info!(symbol = %opp.symbol, "position already open, skipping");
                return false;
            }
            active.insert(opp.symbol.clone(), position.clone());
        }

        let (Some(perp_client), Some(spot_client)) = (
            self.router.get(&opp.perp_venue),
            self.router.get(&opp.spot_venue),
        ) else {
            warn!(
                spot = %opp.spot_venue,
                perp = %opp.perp_venue,
                "no client registered for one of the venues"
            );
            self.abandon(&position);
            return false;
        };

        info!(
            symbol = %opp.symbol,
            perp = %opp.perp_venue,
            perp_bid = opp.perp_bid_price,
            spot = %opp.spot_venue,
            spot_ask = opp.spot_ask_price,
            spread_pct = opp.spread_pct,
            amount_usd = opp.usable_volume_usd,
            "opening hedged position"
        );

        let amount = opp.usable_volume_usd;
        let (perp_result, spot_result) = tokio::join!(
            open_leg(
                perp_client.clone(),
                "futures_short",
                &opp.symbol,
                amount,
                true
            ),
            open_leg(
                spot_client.clone(),
                "spot_long",
                &opp.symbol,
                amount,
                false
            ),
        );

        let (perp_result, spot_result) = match (perp_result, spot_result) {
            (Ok(perp), Ok(spot)) => (perp, spot),
            (perp, spot) => {
                // One leg may be live on the venue while the other failed.
                // There is no unwind here; this needs eyes immediately.
                let perp_err = perp.as_ref().err().map(|e| e.to_string());
                let spot_err = spot.as_ref().err().map(|e| e.to_string());
                error!(
                    symbol = %opp.symbol,
                    perp_ok = perp.is_ok(),
                    spot_ok = spot.is_ok(),
                    ?perp_err,
                    ?spot_err,
                    "LEG FAILURE: cycle abandoned without unwind, check venue positions by hand"
                );
                self.abandon(&position);
                return false;
            }
        };

        position.inner.lock().state = PositionState::Open;

        let opened_at = position.opened_at;
        self.sink
            .publish_execution(TradeExecution {
                exchange: opp.perp_venue.clone(),
                pair: opp.symbol.clone(),
                side: "futures_short".into(),
                action: "open".into(),
                amount,
                price: executed_or(perp_result.executed_price, opp.perp_bid_price),
                spread_pct: opp.spread_pct,
                timestamp: opened_at,
            })
            .await;
        self.sink
            .publish_execution(TradeExecution {
                exchange: opp.spot_venue.clone(),
                pair: opp.symbol.clone(),
                side: "spot_long".into(),
                action: "open".into(),
                amount,
                price: executed_or(spot_result.executed_price, opp.spot_ask_price),
                spread_pct: opp.spread_pct,
                timestamp: opened_at,
            })
            .await;

        info!(symbol = %opp.symbol, "position open, tracking for exit");
        self.spawn_watchdog(position);
        true
    }

    /// Drop a position that never reached `Open`.
    fn abandon(&self, position: &Arc<Position>) {
        position.inner.lock().state = PositionState::Closed;
        self.active.lock().remove(&position.symbol);
    }

    fn spawn_watchdog(&self, position: Arc<Position>) {
        let router = self.router.clone();
        let sink = self.sink.clone();
        let gate = self.gate.clone();
        let active = self.active.clone();
        let watchdog = Duration::from_secs(self.config.watchdog_secs);
        tokio::spawn(async move {
            tokio::time::sleep(watchdog).await;
            {
                let mut inner = position.inner.lock();
                if inner.state != PositionState::Open {
                    return;
                }
                inner.state = PositionState::Closing;
            }
            warn!(
                symbol = %position.symbol,
                held_secs = position.held_secs(),
                "watchdog expired with position still open, forcing close"
            );
            close_cycle(position, router, sink, gate, active).await;
        });
    }

    /// Manual close entry point (also used by tests).
    pub async fn close_position(&self, symbol: &str) {
        let Some(position) = self.active_position(symbol) else {
            return;
        };
        {
            let mut inner = position.inner.lock();
            if inner.state != PositionState::Open {
                return;
            }
            inner.state = PositionState::Closing;
        }
        close_cycle(
            position,
            self.router.clone(),
            self.sink.clone(),
            self.gate.clone(),
            self.active.clone(),
        )
        .await;
    }
}

#[async_trait]
impl ExecutionHandler for PositionController {
    async fn consider_opportunity(&self, opp: Opportunity) -> bool {
        self.open_cycle(opp).await
    }

    fn update_prices(
        &self,
        symbol: &str,
        perp_venue: &str,
        perp_price: f64,
        spot_venue: &str,
        spot_price: f64,
    ) {
        let Some(position) = self.active_position(symbol) else {
            return;
        };
        if position.perp_venue != perp_venue || position.spot_venue != spot_venue {
            return;
        }
        if fp::is_zero(spot_price) {
            return;
        }

        let should_close = {
            let mut inner = position.inner.lock();
            if inner.state != PositionState::Open {
                return;
            }

            let current_spread_pct = ((perp_price - spot_price) / spot_price) * 100.0;
            let convergence_pct = ((position.entry_spread_pct - current_spread_pct)
                / position.entry_spread_pct)
                * 100.0;
            let elapsed_s = position.held_secs();
            let est_profit = ((position.entry_spread_pct - current_spread_pct) / 100.0)
                * position.amount_usd
                - position.amount_usd * (self.config.round_trip_fee_pct / 100.0);

            inner.last_spread_pct = current_spread_pct;
            inner.last_tracked_at = Utc::now();

            info!(
                symbol = %symbol,
                entry_spread_pct = position.entry_spread_pct,
                current_spread_pct,
                convergence_pct,
                est_profit_usd = est_profit,
                elapsed_s,
                "tracking open position"
            );

            let take_profit = fp::gte(convergence_pct, self.config.convergence_exit_pct);
            let spread_crossed = fp::lte(current_spread_pct, 0.0);
            let timed_out = fp::gte(elapsed_s, self.config.max_hold_secs);

            if take_profit || spread_crossed || timed_out {
                let reason = if take_profit {
                    "convergence target reached"
                } else if spread_crossed {
                    "spread crossed, emergency exit"
                } else {
                    "max hold time reached"
                };
                info!(symbol = %symbol, reason, "exit condition met, closing");
                inner.state = PositionState::Closing;
                true
            } else {
                false
            }
        };

        if should_close {
            let router = self.router.clone();
            let sink = self.sink.clone();
            let gate = self.gate.clone();
            let active = self.active.clone();
            tokio::spawn(async move {
                close_cycle(position, router, sink, gate, active).await;
            });
        }
    }
}

fn executed_or(executed: f64, fallback: f64) -> f64 {
    if fp::is_positive(executed) {
        executed
    } else {
        fallback
    }
}

async fn open_leg(
    client: Arc<dyn ExchangeClient>,
    side: &str,
    symbol: &str,
    amount_usd: f64,
    perp: bool,
) -> Result<TradeResult, ExchangeError> {
    let result = if perp {
        client.put_futures_short(symbol, amount_usd).await
    } else {
        client.put_spot_long(symbol, amount_usd).await
    };
    match &result {
        Ok(trade) if trade.success => {
            info!(
                venue = client.name(),
                side,
                symbol,
                order_id = %trade.order_id,
                price = trade.executed_price,
                qty = trade.executed_qty,
                "leg opened"
            );
        }
        Ok(trade) => {
            warn!(venue = client.name(), side, symbol, message = %trade.message, "leg not filled");
        }
        Err(err) => {
            warn!(venue = client.name(), side, symbol, error = %err, "leg open failed");
        }
    }
    match result {
        Ok(trade) if !trade.success => Err(ExchangeError::OrderFailed(trade.message)),
        other => other,
    }
}

/// Close both legs, publish the cycle outcome, retire the position and
/// release the execution gate. Exactly one caller dispatches this per
/// position: the one that performed the `Open -> Closing` transition.
async fn close_cycle(
    position: Arc<Position>,
    router: Arc<ExchangeRouter>,
    sink: Arc<dyn EventSink>,
    gate: Arc<ExecutionGate>,
    active: ActiveTable,
) {
    {
        let inner = position.inner.lock();
        if inner.state == PositionState::Closed {
            return;
        }
    }

    let perp_client = router.get(&position.perp_venue);
    let spot_client = router.get(&position.spot_venue);

    let (futures_outcome, spot_outcome) = tokio::join!(
        async {
            match &perp_client {
                Some(client) => client.close_futures_short(&position.symbol).await,
                None => Err(ExchangeError::ConnectionFailed(format!(
                    "no client for {}",
                    position.perp_venue
                ))),
            }
        },
        async {
            match &spot_client {
                Some(client) => {
                    client
                        .close_spot_long(&position.symbol, position.amount_usd)
                        .await
                }
                None => Err(ExchangeError::ConnectionFailed(format!(
                    "no client for {}",
                    position.spot_venue
                ))),
            }
        },
    );

    let (futures_result, futures_profit) = match futures_outcome {
        Ok((trade, profit)) => (trade, profit),
        Err(err) => {
            error!(symbol = %position.symbol, venue = %position.perp_venue, error = %err, "failed to close futures short");
            (TradeResult::default(), 0.0)
        }
    };
    let (spot_result, spot_profit) = match spot_outcome {
        Ok((trade, profit)) => (trade, profit),
        Err(err) => {
            error!(symbol = %position.symbol, venue = %position.spot_venue, error = %err, "failed to close spot long");
            (TradeResult::default(), 0.0)
        }
    };

    let close_time = Utc::now();
    let duration_seconds = position.held_secs();
    let (exit_spread_pct, _) = {
        let inner = position.inner.lock();
        (inner.last_spread_pct, inner.last_tracked_at)
    };
    let total_profit = spot_profit + futures_profit;

    info!(
        symbol = %position.symbol,
        total_profit,
        spot_profit,
        futures_profit,
        duration_seconds,
        "cycle closed"
    );

    sink.publish_execution(TradeExecution {
        exchange: position.perp_venue.clone(),
        pair: position.symbol.clone(),
        side: "futures_short".into(),
        action: "close".into(),
        amount: position.amount_usd,
        price: executed_or(futures_result.executed_price, position.entry_perp_price),
        spread_pct: exit_spread_pct,
        timestamp: close_time,
    })
    .await;
    sink.publish_execution(TradeExecution {
        exchange: position.spot_venue.clone(),
        pair: position.symbol.clone(),
        side: "spot_long".into(),
        action: "close".into(),
        amount: position.amount_usd,
        price: executed_or(spot_result.executed_price, position.entry_spot_price),
        spread_pct: exit_spread_pct,
        timestamp: close_time,
    })
    .await;
    sink.publish_summary(TradeSummary {
        pair: position.symbol.clone(),
        spot_exchange: position.spot_venue.clone(),
        futures_exchange: position.perp_venue.clone(),
        entry_spread_pct: position.entry_spread_pct,
        exit_spread_pct,
        spot_profit,
        futures_profit,
        total_profit,
        amount: position.amount_usd,
        duration_seconds,
        open_time: position.opened_at,
        close_time,
    })
    .await;

    active.lock().remove(&position.symbol);
    position.inner.lock().state = PositionState::Closed;
    gate.release();
}
