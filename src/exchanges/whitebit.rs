//! WhiteBIT adapter (spot + collateral "perp" markets).
//!
//! All private endpoints are POSTs carrying `request` and `nonce` in the
//! JSON body; the signature is hex(HMAC-SHA512(base64(body))) with the
//! payload echoed in `X-TXC-PAYLOAD`. The venue rate-limits aggressively,
//! so requests are serialized through a single-permit semaphore with a
//! short gap between calls.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use serde::Deserialize;
use sha2::Sha512;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use super::balance::{BalanceBook, Market};
use super::precision;
use super::{base_asset, ExchangeClient, ExchangeError, OpenPosition, TradeResult};
use crate::util::{fp, now_ms};

const BASE_URL: &str = "https://whitebit.com";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const REQUEST_GAP: Duration = Duration::from_millis(50);
const POSITION_POLL_INTERVAL: Duration = Duration::from_millis(500);
const POSITION_WAIT: Duration = Duration::from_secs(10);

pub struct WhitebitClient {
    api_key: String,
    api_secret: String,
    base_url: String,
    http: reqwest::Client,
    snapshots: Arc<BalanceBook>,
    positions: RwLock<HashMap<String, OpenPosition>>,
    rate_limiter: Semaphore,
}

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    #[serde(default)]
    available: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MarketOrderResponse {
    #[serde(default)]
    order_id: i64,
    #[serde(default)]
    deal_stock: String,
    #[serde(default)]
    deal_money: String,
    #[serde(default)]
    deal_fee: String,
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
struct CollateralPosition {
    market: String,
    #[serde(default)]
    amount: String,
    #[serde(default)]
    base_price: String,
}

#[derive(Debug, Deserialize)]
struct PublicTicker {
    #[serde(default)]
    last_price: String,
}

fn parse_f64(s: &str) -> f64 {
    s.parse().unwrap_or(0.0)
}

impl WhitebitClient {
    pub fn new(api_key: &str, api_secret: &str, snapshots: Arc<BalanceBook>) -> Arc<Self> {
        Arc::new(Self {
            api_key: api_key.to_string(),
            api_secret: api_secret.to_string(),
            base_url: BASE_URL.to_string(),
            http: reqwest::Client::builder()
                .timeout(HTTP_TIMEOUT)
                .build()
                .expect("reqwest client"),
            snapshots,
            positions: RwLock::new(HashMap::new()),
            rate_limiter: Semaphore::new(1),
        })
    }

    /// `"doge-usdt"` -> `"DOGE_USDT"`.
    fn spot_market(pair: &str) -> String {
        pair.to_uppercase().replace('-', "_")
    }

    /// `"doge-usdt"` -> `"DOGE_PERP"`.
    fn perp_market(pair: &str) -> String {
        pair.replacen("-usdt", "-perp", 1).to_uppercase().replace('-', "_")
    }

    async fn signed_request<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
        mut params: serde_json::Map<String, serde_json::Value>,
    ) -> Result<T, ExchangeError> {
        let _permit = self
            .rate_limiter
            .acquire()
            .await
            .map_err(|_| ExchangeError::ConnectionFailed("rate limiter closed".into()))?;
        tokio::time::sleep(REQUEST_GAP).await;

        params.insert("request".into(), serde_json::Value::from(endpoint));
        params.insert("nonce".into(), serde_json::Value::from(now_ms()));
        let body = serde_json::Value::Object(params).to_string();

        let payload = BASE64.encode(body.as_bytes());
        let mut mac = Hmac::<Sha512>::new_from_slice(self.api_secret.as_bytes())
            .expect("hmac accepts any key length");
        mac.update(payload.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        let url = format!("{}{endpoint}", self.base_url);
        let response = self
            .http
            .post(&url)
            .header("Content-Type", "application/json")
            .header("X-TXC-APIKEY", &self.api_key)
            .header("X-TXC-PAYLOAD", payload)
            .header("X-TXC-SIGNATURE", signature)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(ExchangeError::BadResponse(format!(
                "whitebit status {status}: {text}"
            )));
        }
        serde_json::from_str(&text)
            .map_err(|e| ExchangeError::BadResponse(format!("whitebit decode: {e}: {text}")))
    }

    async fn spot_balance(&self, ticker: &str) -> Result<f64, ExchangeError> {
        let mut params = serde_json::Map::new();
        params.insert("ticker".into(), serde_json::Value::from(ticker));
        let balance: BalanceResponse = self
            .signed_request("/api/v4/trade-account/balance", params)
            .await?;
        Ok(parse_f64(&balance.available))
    }

    async fn collateral_balance(&self) -> Result<f64, ExchangeError> {
        let balances: HashMap<String, String> = self
            .signed_request("/api/v4/collateral-account/balance", serde_json::Map::new())
            .await?;
        Ok(balances.get("USDT").map(|v| parse_f64(v)).unwrap_or(0.0))
    }

    async fn open_position(&self, market: &str) -> Result<Option<CollateralPosition>, ExchangeError> {
        let positions: Vec<CollateralPosition> = self
            .signed_request(
                "/api/v4/collateral-account/positions/open",
                serde_json::Map::new(),
            )
            .await?;
        Ok(positions.into_iter().find(|p| p.market == market))
    }

    async fn last_price(&self, market: &str) -> Result<f64, ExchangeError> {
        let url = format!("{}/api/v4/public/ticker", self.base_url);
        let tickers: HashMap<String, PublicTicker> = self
            .http
            .get(&url)
            .send()
            .await?
            .json()
            .await
            .map_err(|e| ExchangeError::BadResponse(format!("whitebit ticker decode: {e}")))?;
        let price = tickers
            .get(market)
            .map(|t| parse_f64(&t.last_price))
            .unwrap_or(0.0);
        if !fp::is_positive(price) {
            return Err(ExchangeError::InvalidPair(market.to_string()));
        }
        Ok(price)
    }

    /// Collateral fills settle asynchronously: poll until the position shows
    /// up (or give up).
    async fn wait_for_position(&self, market: &str) -> Result<CollateralPosition, ExchangeError> {
        let deadline = tokio::time::Instant::now() + POSITION_WAIT;
        loop {
            if let Some(position) = self.open_position(market).await? {
                if parse_f64(&position.amount) != 0.0 {
                    return Ok(position);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ExchangeError::OrderFailed(format!(
                    "position {market} did not open in time"
                )));
            }
            tokio::time::sleep(POSITION_POLL_INTERVAL).await;
        }
    }

    async fn wait_for_flat(&self, market: &str) -> Result<(), ExchangeError> {
        let deadline = tokio::time::Instant::now() + POSITION_WAIT;
        loop {
            match self.open_position(market).await? {
                None => return Ok(()),
                Some(p) if parse_f64(&p.amount) == 0.0 => return Ok(()),
                Some(_) => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ExchangeError::OrderFailed(format!(
                    "position {market} did not close in time"
                )));
            }
            tokio::time::sleep(POSITION_POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl ExchangeClient for WhitebitClient {
    fn name(&self) -> &str {
        "whitebit"
    }

    async fn put_spot_long(
        &self,
        pair: &str,
        amount_usdt: f64,
    ) -> Result<TradeResult, ExchangeError> {
        let market = Self::spot_market(pair);

        let balance = self.spot_balance("USDT").await?;
        self.snapshots.set(self.name(), Market::Spot, "USDT", balance);

        // Market buys are sized in quote currency.
        let mut params = serde_json::Map::new();
        params.insert("market".into(), serde_json::Value::from(market));
        params.insert("side".into(), serde_json::Value::from("buy"));
        params.insert("amount".into(), serde_json::Value::from(amount_usdt));
        let response: MarketOrderResponse =
            self.signed_request("/api/v4/order/market", params).await?;

        let deal_stock = parse_f64(&response.deal_stock);
        let deal_money = parse_f64(&response.deal_money);
        let deal_fee = parse_f64(&response.deal_fee);
        let price = if fp::is_positive(deal_stock) {
            deal_money / deal_stock
        } else {
            0.0
        };

        self.positions.write().insert(
            format!("{pair}_spot"),
            OpenPosition {
                pair: pair.to_string(),
                side: "long".into(),
                market: Market::Spot,
                entry_price: price,
                quantity: deal_stock,
                amount_usdt: deal_money,
                order_id: response.order_id.to_string(),
            },
        );

        info!(pair, price, qty = deal_stock, "whitebit spot long opened");
        Ok(TradeResult {
            order_id: response.order_id.to_string(),
            executed_price: price,
            executed_qty: deal_stock,
            fee: deal_fee,
            success: response.status == "FILLED" || fp::is_positive(deal_stock),
            message: response.status,
        })
    }

    async fn close_spot_long(
        &self,
        pair: &str,
        _amount_usdt: f64,
    ) -> Result<(TradeResult, f64), ExchangeError> {
        let market = Self::spot_market(pair);
        let base = base_asset(pair);

        let balance = self.spot_balance(&base).await?;
        if fp::is_negative_or_zero(balance) {
            warn!(pair, asset = %base, "no whitebit balance to sell, clearing local cache");
            self.positions.write().remove(&format!("{pair}_spot"));
            return Err(ExchangeError::PositionNotFound);
        }

        let qty = precision::floor_quantity(balance, pair);
        if fp::is_negative_or_zero(qty) {
            return Err(ExchangeError::InvalidQuantity(qty));
        }

        let mut params = serde_json::Map::new();
        params.insert("market".into(), serde_json::Value::from(market));
        params.insert("side".into(), serde_json::Value::from("sell"));
        params.insert(
            "amount".into(),
            serde_json::Value::from(precision::format_quantity(qty, pair)),
        );
        let response: MarketOrderResponse =
            self.signed_request("/api/v4/order/market", params).await?;

        self.positions.write().remove(&format!("{pair}_spot"));

        let new_balance = self.spot_balance("USDT").await?;
        let prev_balance = self.snapshots.get(self.name(), Market::Spot, "USDT");
        self.snapshots.set(self.name(), Market::Spot, "USDT", new_balance);
        let profit = new_balance - prev_balance;

        let deal_stock = parse_f64(&response.deal_stock);
        let deal_money = parse_f64(&response.deal_money);
        let price = if fp::is_positive(deal_stock) {
            deal_money / deal_stock
        } else {
            0.0
        };

        info!(pair, price, qty = deal_stock, profit, "whitebit spot long closed");
        Ok((
            TradeResult {
                order_id: response.order_id.to_string(),
                executed_price: price,
                executed_qty: deal_stock,
                fee: parse_f64(&response.deal_fee),
                success: response.status == "FILLED" || fp::is_positive(deal_stock),
                message: response.status,
            },
            profit,
        ))
    }

    async fn put_futures_short(
        &self,
        pair: &str,
        amount_usdt: f64,
    ) -> Result<TradeResult, ExchangeError> {
        let market = Self::perp_market(pair);

        let balance = self.collateral_balance().await?;
        self.snapshots.set(self.name(), Market::Futures, "USDT", balance);

        let price = self.last_price(&market).await?;
        let qty = precision::floor_quantity(amount_usdt / price, pair);
        if fp::is_negative_or_zero(qty) {
            return Err(ExchangeError::InvalidQuantity(qty));
        }

        let mut params = serde_json::Map::new();
        params.insert("market".into(), serde_json::Value::from(market.clone()));
        params.insert("side".into(), serde_json::Value::from("sell"));
        params.insert("amount".into(), serde_json::Value::from(qty));
        let response: MarketOrderResponse = self
            .signed_request("/api/v4/order/collateral/market", params)
            .await?;

        // The order ack does not carry the fill; wait for the position.
        let position = self.wait_for_position(&market).await?;
        let position_qty = parse_f64(&position.amount).abs();
        let base_price = parse_f64(&position.base_price);

        self.positions.write().insert(
            format!("{pair}_futures"),
            OpenPosition {
                pair: pair.to_string(),
                side: "short".into(),
                market: Market::Futures,
                entry_price: base_price,
                quantity: position_qty,
                amount_usdt: position_qty * base_price,
                order_id: response.order_id.to_string(),
            },
        );

        info!(pair, base_price, qty = position_qty, "whitebit futures short opened");
        Ok(TradeResult {
            order_id: response.order_id.to_string(),
            executed_price: base_price,
            executed_qty: position_qty,
            fee: 0.0,
            success: true,
            message: "position open".into(),
        })
    }

    async fn close_futures_short(
        &self,
        pair: &str,
    ) -> Result<(TradeResult, f64), ExchangeError> {
        let market = Self::perp_market(pair);

        let Some(position) = self.open_position(&market).await? else {
            warn!(pair, "no whitebit collateral position, clearing local cache");
            self.positions.write().remove(&format!("{pair}_futures"));
            return Err(ExchangeError::PositionNotFound);
        };

        let qty = precision::floor_quantity(parse_f64(&position.amount).abs(), pair);
        if fp::is_negative_or_zero(qty) {
            return Err(ExchangeError::InvalidQuantity(qty));
        }

        let mut params = serde_json::Map::new();
        params.insert("market".into(), serde_json::Value::from(market.clone()));
        params.insert("side".into(), serde_json::Value::from("buy"));
        params.insert(
            "amount".into(),
            serde_json::Value::from(precision::format_quantity(qty, pair)),
        );
        let response: MarketOrderResponse = self
            .signed_request("/api/v4/order/collateral/market", params)
            .await?;

        self.wait_for_flat(&market).await?;
        self.positions.write().remove(&format!("{pair}_futures"));

        let new_balance = self.collateral_balance().await?;
        let prev_balance = self.snapshots.get(self.name(), Market::Futures, "USDT");
        self.snapshots.set(self.name(), Market::Futures, "USDT", new_balance);
        let profit = new_balance - prev_balance;

        info!(pair, qty, profit, "whitebit futures short closed");
        Ok((
            TradeResult {
                order_id: response.order_id.to_string(),
                executed_price: 0.0,
                executed_qty: qty,
                fee: 0.0,
                success: true,
                message: "position closed".into(),
            },
            profit,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn market_names() {
        assert_eq!(WhitebitClient::spot_market("doge-usdt"), "DOGE_USDT");
        assert_eq!(WhitebitClient::perp_market("doge-usdt"), "DOGE_PERP");
        assert_eq!(WhitebitClient::perp_market("btc-usdt"), "BTC_PERP");
    }

    #[test]
    fn market_order_response_tolerates_partial_bodies() {
        let response: MarketOrderResponse =
            serde_json::from_str(r#"{"orderId": 42, "dealStock": "84", "dealMoney": "19.85"}"#)
                .unwrap();
        assert_eq!(response.order_id, 42);
        assert_eq!(parse_f64(&response.deal_stock), 84.0);
        assert_eq!(response.status, "");
    }

    #[test]
    fn collateral_position_decodes() {
        let positions: Vec<CollateralPosition> = serde_json::from_str(
            r#"[{"market": "DOGE_PERP", "amount": "-84", "basePrice": "0.2368"}]"#,
        )
        .unwrap();
        assert_eq!(positions[0].market, "DOGE_PERP");
        assert_eq!(parse_f64(&positions[0].amount).abs(), 84.0);
    }
}
