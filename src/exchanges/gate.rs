//! Gate.io v4 adapter (spot + USDT futures).
//!
//! Signing: hex(HMAC-SHA512(method \n path \n query \n sha512hex(body) \n
//! timestamp)) with the unix-second timestamp echoed in the `Timestamp`
//! header. Futures orders are sized in signed contract counts; `reduce_only`
//! closes the live short.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use serde::Deserialize;
use sha2::{Digest, Sha512};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::balance::{BalanceBook, Market};
use super::precision;
use super::{base_asset, ExchangeClient, ExchangeError, OpenPosition, TradeResult};
use crate::util::fp;

const BASE_URL: &str = "https://api.gateio.ws";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

pub struct GateClient {
    api_key: String,
    api_secret: String,
    base_url: String,
    http: reqwest::Client,
    snapshots: Arc<BalanceBook>,
    positions: RwLock<HashMap<String, OpenPosition>>,
}

#[derive(Debug, Deserialize)]
struct SpotBalance {
    currency: String,
    available: String,
}

#[derive(Debug, Deserialize)]
struct SpotOrderResponse {
    id: String,
    #[serde(default)]
    amount: String,
    #[serde(default)]
    filled_total: String,
    #[serde(default)]
    avg_deal_price: String,
    #[serde(default)]
    fee: String,
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize)]
struct FuturesAccount {
    #[serde(default)]
    available: String,
}

#[derive(Debug, Deserialize)]
struct FuturesPosition {
    #[serde(default)]
    size: i64,
}

#[derive(Debug, Deserialize)]
struct FuturesOrderResponse {
    id: i64,
    #[serde(default)]
    size: i64,
    #[serde(default)]
    fill_price: String,
    #[serde(default)]
    tkfr: String,
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize)]
struct SpotTicker {
    #[serde(default)]
    last: String,
}

fn parse_f64(s: &str) -> f64 {
    s.parse().unwrap_or(0.0)
}

impl GateClient {
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
        })
    }

    /// `"doge-usdt"` -> `"DOGE_USDT"` (same format for spot and contracts).
    fn market(pair: &str) -> String {
        pair.to_uppercase().replace('-', "_")
    }

    fn sign(&self, method: &str, path: &str, query: &str, body: &str, timestamp: &str) -> String {
        let body_hash = hex::encode(Sha512::digest(body.as_bytes()));
        let sign_string = format!("{method}\n{path}\n{query}\n{body_hash}\n{timestamp}");
        let mut mac = Hmac::<Sha512>::new_from_slice(self.api_secret.as_bytes())
            .expect("hmac accepts any key length");
        mac.update(sign_string.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    async fn signed_request<T: serde::de::DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &str,
        body: &str,
    ) -> Result<T, ExchangeError> {
        let timestamp = chrono::Utc::now().timestamp().to_string();
        let signature = self.sign(method.as_str(), path, query, body, &timestamp);

        let url = if query.is_empty() {
            format!("{}{path}", self.base_url)
        } else {
            format!("{}{path}?{query}", self.base_url)
        };
        let mut request = self
            .http
            .request(method, &url)
            .header("Content-Type", "application/json")
            .header("KEY", &self.api_key)
            .header("SIGN", signature)
            .header("Timestamp", timestamp);
        if !body.is_empty() {
            request = request.body(body.to_string());
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(ExchangeError::BadResponse(format!(
                "gate status {status}: {text}"
            )));
        }
        serde_json::from_str(&text)
            .map_err(|e| ExchangeError::BadResponse(format!("gate decode: {e}: {text}")))
    }

    async fn spot_balance(&self, currency: &str) -> Result<f64, ExchangeError> {
        let balances: Vec<SpotBalance> = self
            .signed_request(reqwest::Method::GET, "/api/v4/spot/accounts", "", "")
            .await?;
        Ok(balances
            .iter()
            .find(|b| b.currency == currency)
            .map(|b| parse_f64(&b.available))
            .unwrap_or(0.0))
    }

    async fn futures_balance(&self) -> Result<f64, ExchangeError> {
        let account: FuturesAccount = self
            .signed_request(reqwest::Method::GET, "/api/v4/futures/usdt/accounts", "", "")
            .await?;
        Ok(parse_f64(&account.available))
    }

    async fn futures_position(&self, contract: &str) -> Result<i64, ExchangeError> {
        let positions: Vec<FuturesPosition> = self
            .signed_request(
                reqwest::Method::GET,
                "/api/v4/futures/usdt/positions",
                &format!("contract={contract}"),
                "",
            )
            .await?;
        Ok(positions.first().map(|p| p.size).unwrap_or(0))
    }

    async fn last_price(&self, market: &str) -> Result<f64, ExchangeError> {
        let url = format!(
            "{}/api/v4/spot/tickers?currency_pair={market}",
            self.base_url
        );
        let tickers: Vec<SpotTicker> = self
            .http
            .get(&url)
            .send()
            .await?
            .json()
            .await
            .map_err(|e| ExchangeError::BadResponse(format!("gate ticker decode: {e}")))?;
        let price = tickers.first().map(|t| parse_f64(&t.last)).unwrap_or(0.0);
        if !fp::is_positive(price) {
            return Err(ExchangeError::InvalidPair(market.to_string()));
        }
        Ok(price)
    }
}

#[async_trait]
impl ExchangeClient for GateClient {
    fn name(&self) -> &str {
        "gate"
    }

    async fn put_spot_long(
        &self,
        pair: &str,
        amount_usdt: f64,
    ) -> Result<TradeResult, ExchangeError> {
        let market = Self::market(pair);

        let balance = self.spot_balance("USDT").await?;
        self.snapshots.set(self.name(), Market::Spot, "USDT", balance);

        let body = serde_json::json!({
            "currency_pair": market,
            "side": "buy",
            "amount": format!("{amount_usdt:.8}"),
            "type": "market",
        })
        .to_string();
        let order: SpotOrderResponse = self
            .signed_request(reqwest::Method::POST, "/api/v4/spot/orders", "", &body)
            .await?;

        let qty = parse_f64(&order.amount);
        let avg_price = parse_f64(&order.avg_deal_price);
        let filled_total = parse_f64(&order.filled_total);

        self.positions.write().insert(
            format!("{pair}_spot"),
            OpenPosition {
                pair: pair.to_string(),
                side: "long".into(),
                market: Market::Spot,
                entry_price: avg_price,
                quantity: qty,
                amount_usdt: filled_total,
                order_id: order.id.clone(),
            },
        );

        info!(pair, avg_price, qty, "gate spot long opened");
        Ok(TradeResult {
            order_id: order.id,
            executed_price: avg_price,
            executed_qty: qty,
            fee: parse_f64(&order.fee),
            success: order.status == "closed",
            message: order.status,
        })
    }

    async fn close_spot_long(
        &self,
        pair: &str,
        _amount_usdt: f64,
    ) -> Result<(TradeResult, f64), ExchangeError> {
        let market = Self::market(pair);
        let base = base_asset(pair);

        let balance = self.spot_balance(&base).await?;
        if fp::is_negative_or_zero(balance) {
            warn!(pair, asset = %base, "no gate balance to sell, clearing local cache");
            self.positions.write().remove(&format!("{pair}_spot"));
            return Err(ExchangeError::PositionNotFound);
        }

        let qty = precision::floor_quantity(balance, pair);
        if fp::is_negative_or_zero(qty) {
            return Err(ExchangeError::InvalidQuantity(qty));
        }

        let body = serde_json::json!({
            "currency_pair": market,
            "side": "sell",
            "amount": precision::format_quantity(qty, pair),
            "type": "market",
        })
        .to_string();
        let order: SpotOrderResponse = self
            .signed_request(reqwest::Method::POST, "/api/v4/spot/orders", "", &body)
            .await?;

        self.positions.write().remove(&format!("{pair}_spot"));

        let new_balance = self.spot_balance("USDT").await?;
        let prev_balance = self.snapshots.get(self.name(), Market::Spot, "USDT");
        self.snapshots.set(self.name(), Market::Spot, "USDT", new_balance);
        let profit = new_balance - prev_balance;

        info!(pair, qty, profit, "gate spot long closed");
        Ok((
            TradeResult {
                order_id: order.id,
                executed_price: parse_f64(&order.avg_deal_price),
                executed_qty: parse_f64(&order.amount),
                fee: parse_f64(&order.fee),
                success: order.status == "closed",
                message: order.status,
            },
            profit,
        ))
    }

    async fn put_futures_short(
        &self,
        pair: &str,
        amount_usdt: f64,
    ) -> Result<TradeResult, ExchangeError> {
        let contract = Self::market(pair);

        let balance = self.futures_balance().await?;
        self.snapshots.set(self.name(), Market::Futures, "USDT", balance);

        let price = self.last_price(&contract).await?;
        let quantity = amount_usdt / price;
        let size = -(quantity as i64);
        if size == 0 {
            return Err(ExchangeError::InvalidQuantity(quantity));
        }

        let body = serde_json::json!({
            "contract": contract,
            "size": size,
            "tif": "ioc",
            "reduce_only": false,
        })
        .to_string();
        let order: FuturesOrderResponse = self
            .signed_request(reqwest::Method::POST, "/api/v4/futures/usdt/orders", "", &body)
            .await?;

        let fill_price = parse_f64(&order.fill_price);
        let filled = (order.size as f64).abs();

        self.positions.write().insert(
            format!("{pair}_futures"),
            OpenPosition {
                pair: pair.to_string(),
                side: "short".into(),
                market: Market::Futures,
                entry_price: fill_price,
                quantity: filled,
                amount_usdt: filled * fill_price,
                order_id: order.id.to_string(),
            },
        );

        info!(pair, fill_price, filled, "gate futures short opened");
        Ok(TradeResult {
            order_id: order.id.to_string(),
            executed_price: fill_price,
            executed_qty: filled,
            fee: parse_f64(&order.tkfr),
            success: order.status == "finished",
            message: order.status,
        })
    }

    async fn close_futures_short(
        &self,
        pair: &str,
    ) -> Result<(TradeResult, f64), ExchangeError> {
        let contract = Self::market(pair);

        let size = self.futures_position(&contract).await?;
        if size == 0 {
            warn!(pair, "no gate futures position, clearing local cache");
            self.positions.write().remove(&format!("{pair}_futures"));
            return Err(ExchangeError::PositionNotFound);
        }

        let body = serde_json::json!({
            "contract": contract,
            "size": -size,
            "tif": "ioc",
            "reduce_only": true,
        })
        .to_string();
        let order: FuturesOrderResponse = self
            .signed_request(reqwest::Method::POST, "/api/v4/futures/usdt/orders", "", &body)
            .await?;

        self.positions.write().remove(&format!("{pair}_futures"));

        let new_balance = self.futures_balance().await?;
        let prev_balance = self.snapshots.get(self.name(), Market::Futures, "USDT");
        self.snapshots.set(self.name(), Market::Futures, "USDT", new_balance);
        let profit = new_balance - prev_balance;

        info!(pair, profit, "gate futures short closed");
        Ok((
            TradeResult {
                order_id: order.id.to_string(),
                executed_price: parse_f64(&order.fill_price),
                executed_qty: (order.size as f64).abs(),
                fee: parse_f64(&order.tkfr),
                success: order.status == "finished",
                message: order.status,
            },
            profit,
        ))
    }
}
