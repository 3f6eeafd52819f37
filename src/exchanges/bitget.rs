//! Bitget v2 adapter (spot + USDT-FUTURES mix).
//!
//! Signing: base64(HMAC-SHA256(timestamp_ms + method + path[?query] + body))
//! with key/timestamp/passphrase in `ACCESS-*` headers. Responses wrap
//! everything in `{code, msg, data}` where success is code `"00000"`.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::balance::{BalanceBook, Market};
use super::precision;
use super::{base_asset, ExchangeClient, ExchangeError, OpenPosition, TradeResult};
use crate::util::{fp, now_ms};

const BASE_URL: &str = "https://api.bitget.com";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const OK_CODE: &str = "00000";

pub struct BitgetClient {
    api_key: String,
    api_secret: String,
    passphrase: String,
    base_url: String,
    http: reqwest::Client,
    snapshots: Arc<BalanceBook>,
    positions: RwLock<HashMap<String, OpenPosition>>,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    code: String,
    #[serde(default)]
    msg: String,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct SpotAsset {
    coin: String,
    available: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MixAccount {
    margin_coin: String,
    available: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TickerData {
    last_pr: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderData {
    order_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SinglePosition {
    #[serde(default)]
    total: String,
    #[serde(default)]
    hold_side: String,
}

fn parse_f64(s: &str) -> f64 {
    s.parse().unwrap_or(0.0)
}

impl BitgetClient {
    pub fn new(
        api_key: &str,
        api_secret: &str,
        passphrase: &str,
        snapshots: Arc<BalanceBook>,
    ) -> Arc<Self> {
        Arc::new(Self {
            api_key: api_key.to_string(),
            api_secret: api_secret.to_string(),
            passphrase: passphrase.to_string(),
            base_url: BASE_URL.to_string(),
            http: reqwest::Client::builder()
                .timeout(HTTP_TIMEOUT)
                .build()
                .expect("reqwest client"),
            snapshots,
            positions: RwLock::new(HashMap::new()),
        })
    }

    /// `"doge-usdt"` -> `"DOGEUSDT"`.
    fn normalize_symbol(pair: &str) -> String {
        pair.replace('-', "").to_uppercase()
    }

    fn sign(&self, prehash: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.api_secret.as_bytes())
            .expect("hmac accepts any key length");
        mac.update(prehash.as_bytes());
        BASE64.encode(mac.finalize().into_bytes())
    }

    /// GET with query params appended to the signed path; POST with a JSON
    /// body included in the prehash.
    async fn signed_request<T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<serde_json::Value>,
    ) -> Result<Envelope<T>, ExchangeError> {
        let timestamp = now_ms().to_string();

        let mut full_path = path.to_string();
        if !query.is_empty() {
            let qs = query
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("&");
            full_path = format!("{path}?{qs}");
        }

        let body_str = body.as_ref().map(|b| b.to_string()).unwrap_or_default();
        let prehash = format!("{timestamp}{}{}{}", method.as_str(), full_path, body_str);
        let signature = self.sign(&prehash);

        let url = format!("{}{full_path}", self.base_url);
        let mut request = self
            .http
            .request(method, &url)
            .header("Content-Type", "application/json")
            .header("ACCESS-KEY", &self.api_key)
            .header("ACCESS-SIGN", signature)
            .header("ACCESS-TIMESTAMP", timestamp)
            .header("ACCESS-PASSPHRASE", &self.passphrase)
            .header("locale", "en-US");
        if !body_str.is_empty() {
            request = request.body(body_str);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(ExchangeError::BadResponse(format!(
                "bitget status {status}: {text}"
            )));
        }
        serde_json::from_str(&text)
            .map_err(|e| ExchangeError::BadResponse(format!("bitget decode: {e}: {text}")))
    }

    fn ok_data<T>(envelope: Envelope<T>, what: &str) -> Result<T, ExchangeError> {
        if envelope.code != OK_CODE {
            return Err(ExchangeError::OrderFailed(format!(
                "bitget {what}: {} - {}",
                envelope.code, envelope.msg
            )));
        }
        envelope
            .data
            .ok_or_else(|| ExchangeError::BadResponse(format!("bitget {what}: empty data")))
    }

    async fn spot_asset_balance(&self, asset: &str) -> Result<f64, ExchangeError> {
        let envelope: Envelope<Vec<SpotAsset>> = self
            .signed_request(reqwest::Method::GET, "/api/v2/spot/account/assets", &[], None)
            .await?;
        let assets = Self::ok_data(envelope, "spot assets")?;
        Ok(assets
            .iter()
            .find(|a| a.coin.eq_ignore_ascii_case(asset))
            .map(|a| parse_f64(&a.available))
            .unwrap_or(0.0))
    }

    async fn futures_balance(&self) -> Result<f64, ExchangeError> {
        let envelope: Envelope<Vec<MixAccount>> = self
            .signed_request(
                reqwest::Method::GET,
                "/api/v2/mix/account/accounts",
                &[("productType", "USDT-FUTURES")],
                None,
            )
            .await?;
        let accounts = Self::ok_data(envelope, "mix accounts")?;
        Ok(accounts
            .iter()
            .find(|a| a.margin_coin == "USDT")
            .map(|a| parse_f64(&a.available))
            .unwrap_or(0.0))
    }

    async fn spot_ticker(&self, symbol: &str) -> Result<f64, ExchangeError> {
        let url = format!(
            "{}/api/v2/spot/market/tickers?symbol={symbol}",
            self.base_url
        );
        let envelope: Envelope<Vec<TickerData>> = self.http.get(&url).send().await?.json().await
            .map_err(|e| ExchangeError::BadResponse(format!("bitget ticker decode: {e}")))?;
        let data = Self::ok_data(envelope, "spot ticker")?;
        data.first()
            .map(|t| parse_f64(&t.last_pr))
            .ok_or_else(|| ExchangeError::BadResponse("bitget ticker empty".into()))
    }

    async fn futures_ticker(&self, symbol: &str) -> Result<f64, ExchangeError> {
        let url = format!(
            "{}/api/v2/mix/market/ticker?symbol={symbol}&productType=USDT-FUTURES",
            self.base_url
        );
        let envelope: Envelope<Vec<TickerData>> = self.http.get(&url).send().await?.json().await
            .map_err(|e| ExchangeError::BadResponse(format!("bitget ticker decode: {e}")))?;
        let data = Self::ok_data(envelope, "mix ticker")?;
        data.first()
            .map(|t| parse_f64(&t.last_pr))
            .ok_or_else(|| ExchangeError::BadResponse("bitget ticker empty".into()))
    }

    async fn short_position(&self, symbol: &str) -> Result<(f64, String), ExchangeError> {
        let envelope: Envelope<Vec<SinglePosition>> = self
            .signed_request(
                reqwest::Method::GET,
                "/api/v2/mix/position/single-position",
                &[
                    ("symbol", symbol),
                    ("productType", "USDT-FUTURES"),
                    ("marginCoin", "USDT"),
                    ("holdSide", "short"),
                ],
                None,
            )
            .await?;
        let data = Self::ok_data(envelope, "single position")?;
        Ok(data
            .first()
            .map(|p| (parse_f64(&p.total), p.hold_side.clone()))
            .unwrap_or((0.0, "short".to_string())))
    }
}

#[async_trait]
impl ExchangeClient for BitgetClient {
    fn name(&self) -> &str {
        "bitget"
    }

    async fn put_spot_long(
        &self,
        pair: &str,
        amount_usdt: f64,
    ) -> Result<TradeResult, ExchangeError> {
        let symbol = Self::normalize_symbol(pair);

        let balance = self.spot_asset_balance("USDT").await?;
        self.snapshots.set(self.name(), Market::Spot, "USDT", balance);

        let price = self.spot_ticker(&symbol).await?;
        if !fp::is_positive(price) {
            return Err(ExchangeError::BadResponse("zero spot price".into()));
        }
        let qty = precision::floor_quantity(amount_usdt / price, pair);
        if fp::is_negative_or_zero(qty) {
            return Err(ExchangeError::InvalidQuantity(qty));
        }

        // Market buys are sized in quote currency.
        let body = serde_json::json!({
            "symbol": symbol,
            "side": "buy",
            "orderType": "market",
            "force": "gtc",
            "size": format!("{amount_usdt:.4}"),
            "clientOid": format!("spot_{}", now_ms()),
        });
        let envelope: Envelope<OrderData> = self
            .signed_request(reqwest::Method::POST, "/api/v2/spot/trade/place-order", &[], Some(body))
            .await?;
        let order = Self::ok_data(envelope, "spot buy")?;

        self.positions.write().insert(
            format!("{pair}_spot"),
            OpenPosition {
                pair: pair.to_string(),
                side: "long".into(),
                market: Market::Spot,
                entry_price: price,
                quantity: qty,
                amount_usdt,
                order_id: order.order_id.clone(),
            },
        );

        info!(pair, price, qty, "bitget spot long opened");
        Ok(TradeResult {
            order_id: order.order_id,
            executed_price: price,
            executed_qty: qty,
            fee: 0.0,
            success: true,
            message: "accepted".into(),
        })
    }

    async fn close_spot_long(
        &self,
        pair: &str,
        _amount_usdt: f64,
    ) -> Result<(TradeResult, f64), ExchangeError> {
        let symbol = Self::normalize_symbol(pair);
        let base = base_asset(pair);

        let balance = self.spot_asset_balance(&base).await?;
        if fp::is_negative_or_zero(balance) {
            warn!(pair, asset = %base, "no bitget balance to sell, clearing local cache");
            self.positions.write().remove(&format!("{pair}_spot"));
            return Err(ExchangeError::PositionNotFound);
        }

        let qty = precision::floor_quantity(balance, pair);
        if fp::is_negative_or_zero(qty) {
            return Err(ExchangeError::InvalidQuantity(qty));
        }

        let body = serde_json::json!({
            "symbol": symbol,
            "side": "sell",
            "orderType": "market",
            "force": "gtc",
            "size": precision::format_quantity(qty, pair),
            "clientOid": format!("close_spot_{}", now_ms()),
        });
        let envelope: Envelope<OrderData> = self
            .signed_request(reqwest::Method::POST, "/api/v2/spot/trade/place-order", &[], Some(body))
            .await?;
        let order = Self::ok_data(envelope, "spot sell")?;

        self.positions.write().remove(&format!("{pair}_spot"));

        let new_balance = self.spot_asset_balance("USDT").await?;
        let prev_balance = self.snapshots.get(self.name(), Market::Spot, "USDT");
        self.snapshots.set(self.name(), Market::Spot, "USDT", new_balance);
        let profit = new_balance - prev_balance;

        info!(pair, qty, profit, "bitget spot long closed");
        Ok((
            TradeResult {
                order_id: order.order_id,
                executed_price: 0.0,
                executed_qty: qty,
                fee: 0.0,
                success: true,
                message: "accepted".into(),
            },
            profit,
        ))
    }

    async fn put_futures_short(
        &self,
        pair: &str,
        amount_usdt: f64,
    ) -> Result<TradeResult, ExchangeError> {
        let symbol = Self::normalize_symbol(pair);

        let balance = self.futures_balance().await?;
        self.snapshots.set(self.name(), Market::Futures, "USDT", balance);

        let price = self.futures_ticker(&symbol).await?;
        if !fp::is_positive(price) {
            return Err(ExchangeError::BadResponse("zero futures price".into()));
        }
        let qty = precision::floor_quantity(amount_usdt / price, pair);
        if fp::is_negative_or_zero(qty) {
            return Err(ExchangeError::InvalidQuantity(qty));
        }

        let body = serde_json::json!({
            "symbol": symbol,
            "productType": "USDT-FUTURES",
            "marginMode": "crossed",
            "marginCoin": "USDT",
            "size": precision::format_quantity(qty, pair),
            "side": "sell",
            "tradeSide": "open",
            "orderType": "market",
            "holdSide": "short",
            "clientOid": format!("fut_{}", now_ms()),
        });
        let envelope: Envelope<OrderData> = self
            .signed_request(reqwest::Method::POST, "/api/v2/mix/order/place-order", &[], Some(body))
            .await?;
        let order = Self::ok_data(envelope, "futures short")?;

        self.positions.write().insert(
            format!("{pair}_futures"),
            OpenPosition {
                pair: pair.to_string(),
                side: "short".into(),
                market: Market::Futures,
                entry_price: price,
                quantity: qty,
                amount_usdt,
                order_id: order.order_id.clone(),
            },
        );

        info!(pair, price, qty, "bitget futures short opened");
        Ok(TradeResult {
            order_id: order.order_id,
            executed_price: price,
            executed_qty: qty,
            fee: 0.0,
            success: true,
            message: "accepted".into(),
        })
    }

    async fn close_futures_short(
        &self,
        pair: &str,
    ) -> Result<(TradeResult, f64), ExchangeError> {
        let symbol = Self::normalize_symbol(pair);

        let (total, hold_side) = self.short_position(&symbol).await?;
        if total == 0.0 {
            warn!(pair, "no bitget futures position, clearing local cache");
            self.positions.write().remove(&format!("{pair}_futures"));
            return Err(ExchangeError::PositionNotFound);
        }

        let qty = precision::floor_quantity(total.abs(), pair);
        if fp::is_negative_or_zero(qty) {
            return Err(ExchangeError::InvalidQuantity(qty));
        }

        let body = serde_json::json!({
            "symbol": symbol,
            "productType": "USDT-FUTURES",
            "marginMode": "crossed",
            "marginCoin": "USDT",
            "size": precision::format_quantity(qty, pair),
            "side": "sell",
            "tradeSide": "close",
            "orderType": "market",
            "holdSide": hold_side,
            "clientOid": format!("close_fut_{}", now_ms()),
        });
        let envelope: Envelope<OrderData> = self
            .signed_request(reqwest::Method::POST, "/api/v2/mix/order/place-order", &[], Some(body))
            .await?;
        let order = Self::ok_data(envelope, "futures close")?;

        self.positions.write().remove(&format!("{pair}_futures"));

        let new_balance = self.futures_balance().await?;
        let prev_balance = self.snapshots.get(self.name(), Market::Futures, "USDT");
        self.snapshots.set(self.name(), Market::Futures, "USDT", new_balance);
        let profit = new_balance - prev_balance;

        info!(pair, qty, profit, "bitget futures short closed");
        Ok((
            TradeResult {
                order_id: order.order_id,
                executed_price: 0.0,
                executed_qty: qty,
                fee: 0.0,
                success: true,
                message: "accepted".into(),
            },
            profit,
        ))
    }
}
