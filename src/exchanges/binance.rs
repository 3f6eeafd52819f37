//! Binance spot + USD-M futures adapter.
//!
//! Signing: HMAC-SHA256 over the query string, hex-encoded, appended as
//! `signature`, with the API key in `X-MBX-APIKEY`.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
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

const SPOT_BASE_URL: &str = "https://api.binance.com";
const FUTURES_BASE_URL: &str = "https://fapi.binance.com";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

pub struct BinanceClient {
    api_key: String,
    api_secret: String,
    spot_base: String,
    futures_base: String,
    http: reqwest::Client,
    snapshots: Arc<BalanceBook>,
    positions: RwLock<HashMap<String, OpenPosition>>,
}

#[derive(Debug, Deserialize)]
struct AccountBalance {
    asset: String,
    free: String,
}

#[derive(Debug, Deserialize)]
struct AccountInfo {
    balances: Vec<AccountBalance>,
}

#[derive(Debug, Deserialize)]
struct TickerPrice {
    price: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Fill {
    price: String,
    #[allow(dead_code)]
    qty: String,
    commission: String,
    commission_asset: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpotOrderResponse {
    order_id: i64,
    executed_qty: String,
    cummulative_quote_qty: String,
    status: String,
    #[serde(default)]
    fills: Vec<Fill>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FuturesOrderResponse {
    order_id: i64,
    executed_qty: String,
    #[serde(default)]
    avg_price: String,
    status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionRisk {
    symbol: String,
    position_amt: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FuturesAssetBalance {
    asset: String,
    available_balance: String,
}

fn parse_f64(s: &str) -> f64 {
    s.parse().unwrap_or(0.0)
}

impl BinanceClient {
    pub fn new(api_key: &str, api_secret: &str, snapshots: Arc<BalanceBook>) -> Arc<Self> {
        Arc::new(Self {
            api_key: api_key.to_string(),
            api_secret: api_secret.to_string(),
            spot_base: SPOT_BASE_URL.to_string(),
            futures_base: FUTURES_BASE_URL.to_string(),
            http: reqwest::Client::builder()
                .timeout(HTTP_TIMEOUT)
                .build()
                .expect("reqwest client"),
            snapshots,
            positions: RwLock::new(HashMap::new()),
        })
    }

    /// `"doge-usdt"` -> `"DOGEUSDT"` (same format on both markets).
    fn normalize_symbol(pair: &str) -> String {
        pair.replace('-', "").to_uppercase()
    }

    fn sign(&self, query: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.api_secret.as_bytes())
            .expect("hmac accepts any key length");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    async fn signed_request<T: serde::de::DeserializeOwned>(
        &self,
        method: reqwest::Method,
        base: &str,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, ExchangeError> {
        let mut query = params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        let signature = self.sign(&query);
        query.push_str(&format!("&signature={signature}"));

        let url = format!("{base}{path}?{query}");
        let response = self
            .http
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ExchangeError::BadResponse(format!(
                "binance status {status}: {body}"
            )));
        }
        serde_json::from_str(&body)
            .map_err(|e| ExchangeError::BadResponse(format!("binance decode: {e}: {body}")))
    }

    async fn get_spot_balance(&self, asset: &str) -> Result<f64, ExchangeError> {
        let params = [("timestamp", now_ms().to_string())];
        let account: AccountInfo = self
            .signed_request(reqwest::Method::GET, &self.spot_base, "/api/v3/account", &params)
            .await?;
        Ok(account
            .balances
            .iter()
            .find(|b| b.asset == asset)
            .map(|b| parse_f64(&b.free))
            .unwrap_or(0.0))
    }

    async fn get_spot_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        let url = format!("{}/api/v3/ticker/price?symbol={symbol}", self.spot_base);
        let ticker: TickerPrice = self.http.get(&url).send().await?.json().await?;
        Ok(parse_f64(&ticker.price))
    }

    async fn get_futures_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        let url = format!("{}/fapi/v1/ticker/price?symbol={symbol}", self.futures_base);
        let ticker: TickerPrice = self.http.get(&url).send().await?.json().await?;
        Ok(parse_f64(&ticker.price))
    }

    async fn get_futures_balance(&self) -> Result<f64, ExchangeError> {
        let params = [("timestamp", now_ms().to_string())];
        let balances: Vec<FuturesAssetBalance> = self
            .signed_request(reqwest::Method::GET, &self.futures_base, "/fapi/v2/balance", &params)
            .await?;
        Ok(balances
            .iter()
            .find(|b| b.asset == "USDT")
            .map(|b| parse_f64(&b.available_balance))
            .unwrap_or(0.0))
    }

    async fn get_futures_position(&self, symbol: &str) -> Result<f64, ExchangeError> {
        let params = [
            ("symbol", symbol.to_string()),
            ("timestamp", now_ms().to_string()),
        ];
        let positions: Vec<PositionRisk> = self
            .signed_request(
                reqwest::Method::GET,
                &self.futures_base,
                "/fapi/v2/positionRisk",
                &params,
            )
            .await?;
        Ok(positions
            .iter()
            .find(|p| p.symbol == symbol && parse_f64(&p.position_amt) != 0.0)
            .map(|p| parse_f64(&p.position_amt))
            .unwrap_or(0.0))
    }
}

#[async_trait]
impl ExchangeClient for BinanceClient {
    fn name(&self) -> &str {
        "binance"
    }

    async fn put_spot_long(
        &self,
        pair: &str,
        amount_usdt: f64,
    ) -> Result<TradeResult, ExchangeError> {
        let symbol = Self::normalize_symbol(pair);
        // Sanity-check the market exists before committing funds.
        self.get_spot_price(&symbol).await?;

        let balance = self.get_spot_balance("USDT").await?;
        self.snapshots.set(self.name(), Market::Spot, "USDT", balance);

        let params = [
            ("symbol", symbol.clone()),
            ("side", "BUY".to_string()),
            ("type", "MARKET".to_string()),
            ("quoteOrderQty", format!("{amount_usdt:.8}")),
            ("timestamp", now_ms().to_string()),
        ];
        let order: SpotOrderResponse = self
            .signed_request(reqwest::Method::POST, &self.spot_base, "/api/v3/order", &params)
            .await
            .map_err(order_failed)?;

        let gross_quote = parse_f64(&order.cummulative_quote_qty);
        let executed_qty = parse_f64(&order.executed_qty);
        if fp::is_zero(executed_qty) {
            return Err(ExchangeError::OrderFailed(format!(
                "spot buy not filled: {}",
                order.status
            )));
        }

        // Fees can be charged in USDT or in the base asset; convert the
        // latter at fill price so the recorded spend is the real one.
        let mut fee_usdt = 0.0;
        for fill in &order.fills {
            let fee = parse_f64(&fill.commission);
            if fill.commission_asset == "USDT" {
                fee_usdt += fee;
            } else {
                fee_usdt += fee * parse_f64(&fill.price);
            }
        }

        let avg_price = gross_quote / executed_qty;
        let spent = gross_quote + fee_usdt;

        self.positions.write().insert(
            format!("{pair}_spot"),
            OpenPosition {
                pair: pair.to_string(),
                side: "long".into(),
                market: Market::Spot,
                entry_price: avg_price,
                quantity: executed_qty,
                amount_usdt: spent,
                order_id: order.order_id.to_string(),
            },
        );

        info!(pair, avg_price, executed_qty, fee_usdt, "binance spot long opened");
        Ok(TradeResult {
            order_id: order.order_id.to_string(),
            executed_price: avg_price,
            executed_qty,
            fee: fee_usdt,
            success: order.status == "FILLED",
            message: order.status,
        })
    }

    async fn close_spot_long(
        &self,
        pair: &str,
        _amount_usdt: f64,
    ) -> Result<(TradeResult, f64), ExchangeError> {
        let symbol = Self::normalize_symbol(pair);
        let base = base_asset(pair);

        let balance = self.get_spot_balance(&base).await?;
        if fp::is_zero(balance) {
            warn!(pair, asset = %base, "no spot balance to close, clearing local cache");
            self.positions.write().remove(&format!("{pair}_spot"));
            return Err(ExchangeError::PositionNotFound);
        }

        let qty = precision::floor_quantity(balance, pair);
        if fp::is_negative_or_zero(qty) {
            return Err(ExchangeError::InvalidQuantity(qty));
        }

        let params = [
            ("symbol", symbol.clone()),
            ("side", "SELL".to_string()),
            ("type", "MARKET".to_string()),
            ("quantity", precision::format_quantity(qty, pair)),
            ("timestamp", now_ms().to_string()),
        ];
        let order: SpotOrderResponse = self
            .signed_request(reqwest::Method::POST, &self.spot_base, "/api/v3/order", &params)
            .await
            .map_err(order_failed)?;

        let gross_quote = parse_f64(&order.cummulative_quote_qty);
        let executed_qty = parse_f64(&order.executed_qty);
        let avg_price = if executed_qty > 0.0 {
            gross_quote / executed_qty
        } else {
            0.0
        };

        let mut fee = 0.0;
        for fill in &order.fills {
            if fill.commission_asset == "USDT" {
                fee += parse_f64(&fill.commission);
            }
        }

        self.positions.write().remove(&format!("{pair}_spot"));

        let new_balance = self.get_spot_balance("USDT").await?;
        let prev_balance = self.snapshots.get(self.name(), Market::Spot, "USDT");
        self.snapshots.set(self.name(), Market::Spot, "USDT", new_balance);
        let profit = new_balance - prev_balance;

        info!(pair, avg_price, executed_qty, profit, "binance spot long closed");
        Ok((
            TradeResult {
                order_id: order.order_id.to_string(),
                executed_price: avg_price,
                executed_qty,
                fee,
                success: order.status == "FILLED",
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
        let symbol = Self::normalize_symbol(pair);

        let price = self.get_futures_price(&symbol).await?;
        if !fp::is_positive(price) {
            return Err(ExchangeError::BadResponse("zero futures price".into()));
        }

        let balance = self.get_futures_balance().await?;
        self.snapshots.set(self.name(), Market::Futures, "USDT", balance);

        let qty = precision::floor_quantity(amount_usdt / price, pair);
        if fp::is_negative_or_zero(qty) {
            return Err(ExchangeError::InvalidQuantity(qty));
        }

        let params = [
            ("symbol", symbol.clone()),
            ("side", "SELL".to_string()),
            ("type", "MARKET".to_string()),
            ("quantity", precision::format_quantity(qty, pair)),
            ("timestamp", now_ms().to_string()),
        ];
        let order: FuturesOrderResponse = self
            .signed_request(reqwest::Method::POST, &self.futures_base, "/fapi/v1/order", &params)
            .await
            .map_err(order_failed)?;

        let executed_qty = parse_f64(&order.executed_qty);
        let avg_price = parse_f64(&order.avg_price);

        self.positions.write().insert(
            format!("{pair}_futures"),
            OpenPosition {
                pair: pair.to_string(),
                side: "short".into(),
                market: Market::Futures,
                entry_price: avg_price,
                quantity: executed_qty,
                amount_usdt,
                order_id: order.order_id.to_string(),
            },
        );

        info!(pair, avg_price, executed_qty, "binance futures short opened");
        Ok(TradeResult {
            order_id: order.order_id.to_string(),
            executed_price: avg_price,
            executed_qty,
            fee: 0.0,
            success: order.status == "FILLED",
            message: order.status,
        })
    }

    async fn close_futures_short(
        &self,
        pair: &str,
    ) -> Result<(TradeResult, f64), ExchangeError> {
        let symbol = Self::normalize_symbol(pair);

        let position_amt = self.get_futures_position(&symbol).await?;
        if position_amt == 0.0 {
            warn!(pair, "no open futures position, clearing local cache");
            self.positions.write().remove(&format!("{pair}_futures"));
            return Err(ExchangeError::PositionNotFound);
        }

        let qty = precision::floor_quantity(position_amt.abs(), pair);
        if fp::is_negative_or_zero(qty) {
            return Err(ExchangeError::InvalidQuantity(qty));
        }

        let params = [
            ("symbol", symbol.clone()),
            ("side", "BUY".to_string()),
            ("type", "MARKET".to_string()),
            ("quantity", precision::format_quantity(qty, pair)),
            ("timestamp", now_ms().to_string()),
        ];
        let order: FuturesOrderResponse = self
            .signed_request(reqwest::Method::POST, &self.futures_base, "/fapi/v1/order", &params)
            .await
            .map_err(order_failed)?;

        self.positions.write().remove(&format!("{pair}_futures"));

        let new_balance = self.get_futures_balance().await?;
        let prev_balance = self.snapshots.get(self.name(), Market::Futures, "USDT");
        self.snapshots.set(self.name(), Market::Futures, "USDT", new_balance);
        let profit = new_balance - prev_balance;

        let executed_qty = parse_f64(&order.executed_qty);
        let avg_price = parse_f64(&order.avg_price);
        info!(pair, avg_price, executed_qty, profit, "binance futures short closed");
        Ok((
            TradeResult {
                order_id: order.order_id.to_string(),
                executed_price: avg_price,
                executed_qty,
                fee: 0.0,
                success: order.status == "FILLED",
                message: order.status,
            },
            profit,
        ))
    }
}

/// Order endpoints: a rejected request is an order failure, not a transport
/// problem.
fn order_failed(err: ExchangeError) -> ExchangeError {
    match err {
        ExchangeError::BadResponse(msg) => ExchangeError::OrderFailed(msg),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_normalization() {
        assert_eq!(BinanceClient::normalize_symbol("doge-usdt"), "DOGEUSDT");
        assert_eq!(BinanceClient::normalize_symbol("btc-usdt"), "BTCUSDT");
    }

    #[test]
    fn signature_is_deterministic_hex() {
        let client = BinanceClient::new("key", "secret", BalanceBook::new());
        let a = client.sign("symbol=DOGEUSDT&timestamp=1");
        let b = client.sign("symbol=DOGEUSDT&timestamp=1");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn spot_order_response_decodes() {
        let body = r#"{
            "orderId": 123,
            "executedQty": "84.0",
            "cummulativeQuoteQty": "19.85",
            "status": "FILLED",
            "fills": [
                {"price": "0.2363", "qty": "84.0", "commission": "0.084", "commissionAsset": "DOGE"}
            ]
        }"#;
        let order: SpotOrderResponse = serde_json::from_str(body).unwrap();
        assert_eq!(order.order_id, 123);
        assert_eq!(order.fills.len(), 1);
        assert_eq!(order.fills[0].commission_asset, "DOGE");
    }

    #[test]
    fn futures_order_response_tolerates_missing_avg_price() {
        let body = r#"{"orderId": 5, "executedQty": "10", "status": "NEW"}"#;
        let order: FuturesOrderResponse = serde_json::from_str(body).unwrap();
        assert_eq!(order.avg_price, "");
        assert_eq!(order.status, "NEW");
    }
}
