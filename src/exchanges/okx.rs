//! OKX unified-account adapter (spot + USDT perpetual swaps).
//!
//! Signing: base64(HMAC-SHA256(timestamp + method + path + body)) with an
//! ISO-8601 millisecond timestamp and the account passphrase in headers.
//! Market orders fill asynchronously, so each placement is followed by an
//! order-detail query for the actual fill.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use serde::Deserialize;
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::balance::{BalanceBook, Market};
use super::{base_asset, ExchangeClient, ExchangeError, OpenPosition, TradeResult};
use crate::exchanges::precision;
use crate::util::fp;

const BASE_URL: &str = "https://www.okx.com";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
/// Market orders report fills asynchronously; wait this long before the
/// detail query.
const FILL_QUERY_DELAY: Duration = Duration::from_millis(200);

pub struct OkxClient {
    api_key: String,
    api_secret: String,
    passphrase: String,
    base_url: String,
    http: reqwest::Client,
    snapshots: Arc<BalanceBook>,
    positions: RwLock<HashMap<String, OpenPosition>>,
}

#[derive(Debug, Deserialize)]
struct OkxEnvelope<T> {
    code: String,
    #[serde(default)]
    msg: String,
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct BalanceDetail {
    ccy: String,
    #[serde(default)]
    #[serde(rename = "availBal")]
    avail_bal: String,
    #[serde(default)]
    #[serde(rename = "availEq")]
    avail_eq: String,
    #[serde(default)]
    #[serde(rename = "cashBal")]
    cash_bal: String,
}

#[derive(Debug, Deserialize)]
struct BalanceData {
    #[serde(default = "Vec::new")]
    details: Vec<BalanceDetail>,
}

#[derive(Debug, Deserialize)]
struct OrderAck {
    #[serde(rename = "ordId")]
    ord_id: String,
    #[serde(default)]
    #[serde(rename = "sMsg")]
    s_msg: String,
}

#[derive(Debug, Deserialize)]
struct OrderDetail {
    #[serde(default)]
    #[serde(rename = "avgPx")]
    avg_px: String,
    #[serde(default)]
    #[serde(rename = "accFillSz")]
    acc_fill_sz: String,
    #[serde(default)]
    fee: String,
    #[serde(default)]
    state: String,
}

#[derive(Debug, Deserialize)]
struct PositionData {
    #[serde(rename = "instId")]
    inst_id: String,
    #[serde(default)]
    pos: String,
}

fn parse_f64(s: &str) -> f64 {
    s.parse().unwrap_or(0.0)
}

impl OkxClient {
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

    /// `"doge-usdt"` -> `"DOGE-USDT"`.
    fn spot_inst(pair: &str) -> String {
        pair.to_uppercase()
    }

    /// `"doge-usdt"` -> `"DOGE-USDT-SWAP"`.
    fn swap_inst(pair: &str) -> String {
        format!("{}-SWAP", pair.to_uppercase())
    }

    fn sign(&self, timestamp: &str, method: &str, path: &str, body: &str) -> String {
        let prehash = format!("{timestamp}{method}{path}{body}");
        let mut mac = Hmac::<Sha256>::new_from_slice(self.api_secret.as_bytes())
            .expect("hmac accepts any key length");
        mac.update(prehash.as_bytes());
        BASE64.encode(mac.finalize().into_bytes())
    }

    async fn signed_request<T: serde::de::DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: &str,
    ) -> Result<OkxEnvelope<T>, ExchangeError> {
        let timestamp = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string();
        let signature = self.sign(&timestamp, method.as_str(), path, body);

        let url = format!("{}{path}", self.base_url);
        let mut request = self
            .http
            .request(method, &url)
            .header("Content-Type", "application/json")
            .header("OK-ACCESS-KEY", &self.api_key)
            .header("OK-ACCESS-SIGN", signature)
            .header("OK-ACCESS-TIMESTAMP", timestamp)
            .header("OK-ACCESS-PASSPHRASE", &self.passphrase);
        if !body.is_empty() {
            request = request.body(body.to_string());
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(ExchangeError::BadResponse(format!(
                "okx status {status}: {text}"
            )));
        }
        serde_json::from_str(&text)
            .map_err(|e| ExchangeError::BadResponse(format!("okx decode: {e}: {text}")))
    }

    async fn balance(&self, ccy: &str) -> Result<f64, ExchangeError> {
        let path = format!("/api/v5/account/balance?ccy={ccy}");
        let envelope: OkxEnvelope<BalanceData> =
            self.signed_request(reqwest::Method::GET, &path, "").await?;
        if envelope.code != "0" {
            return Err(ExchangeError::BadResponse(format!(
                "okx balance code {}: {}",
                envelope.code, envelope.msg
            )));
        }
        for data in &envelope.data {
            for detail in &data.details {
                if detail.ccy == ccy {
                    // Prefer tradable equity, fall back to plain balances.
                    let mut available = parse_f64(&detail.avail_eq);
                    if available == 0.0 {
                        available = parse_f64(&detail.avail_bal);
                    }
                    if available == 0.0 {
                        available = parse_f64(&detail.cash_bal);
                    }
                    return Ok(available);
                }
            }
        }
        Ok(0.0)
    }

    async fn place_order(&self, body: serde_json::Value) -> Result<String, ExchangeError> {
        let body = body.to_string();
        let envelope: OkxEnvelope<OrderAck> = self
            .signed_request(reqwest::Method::POST, "/api/v5/trade/order", &body)
            .await?;
        if envelope.code != "0" {
            let msg = envelope
                .data
                .first()
                .filter(|d| !d.s_msg.is_empty())
                .map(|d| d.s_msg.clone())
                .unwrap_or(envelope.msg);
            return Err(ExchangeError::OrderFailed(format!(
                "okx code {}: {msg}",
                envelope.code
            )));
        }
        envelope
            .data
            .into_iter()
            .next()
            .map(|d| d.ord_id)
            .ok_or_else(|| ExchangeError::BadResponse("okx empty order response".into()))
    }

    async fn order_detail(&self, inst_id: &str, ord_id: &str) -> Result<OrderDetail, ExchangeError> {
        tokio::time::sleep(FILL_QUERY_DELAY).await;
        let path = format!("/api/v5/trade/order?instId={inst_id}&ordId={ord_id}");
        let envelope: OkxEnvelope<OrderDetail> =
            self.signed_request(reqwest::Method::GET, &path, "").await?;
        envelope
            .data
            .into_iter()
            .next()
            .ok_or_else(|| ExchangeError::BadResponse("okx order detail missing".into()))
    }

    async fn open_short_position(&self, inst_id: &str) -> Result<Option<f64>, ExchangeError> {
        let path = format!("/api/v5/account/positions?instId={inst_id}");
        let envelope: OkxEnvelope<PositionData> =
            self.signed_request(reqwest::Method::GET, &path, "").await?;
        if envelope.code != "0" {
            return Err(ExchangeError::BadResponse(format!(
                "okx positions code {}",
                envelope.code
            )));
        }
        Ok(envelope
            .data
            .iter()
            .find(|p| p.inst_id == inst_id && p.pos != "0" && !p.pos.is_empty())
            .map(|p| parse_f64(&p.pos)))
    }

    fn trade_result(ord_id: String, detail: &OrderDetail) -> TradeResult {
        TradeResult {
            order_id: ord_id,
            executed_price: parse_f64(&detail.avg_px),
            executed_qty: parse_f64(&detail.acc_fill_sz),
            fee: parse_f64(&detail.fee).abs(),
            success: detail.state == "filled",
            message: detail.state.clone(),
        }
    }
}

#[async_trait]
impl ExchangeClient for OkxClient {
    fn name(&self) -> &str {
        "okx"
    }

    async fn put_spot_long(
        &self,
        pair: &str,
        amount_usdt: f64,
    ) -> Result<TradeResult, ExchangeError> {
        let inst_id = Self::spot_inst(pair);

        let balance = self.balance("USDT").await?;
        self.snapshots.set(self.name(), Market::Spot, "USDT", balance);

        let ord_id = self
            .place_order(serde_json::json!({
                "instId": inst_id,
                "tdMode": "cash",
                "side": "buy",
                "ordType": "market",
                "sz": format!("{amount_usdt:.8}"),
                "tgtCcy": "quote_ccy",
            }))
            .await?;

        let detail = self.order_detail(&inst_id, &ord_id).await?;
        let result = Self::trade_result(ord_id.clone(), &detail);

        self.positions.write().insert(
            format!("{pair}_spot"),
            OpenPosition {
                pair: pair.to_string(),
                side: "long".into(),
                market: Market::Spot,
                entry_price: result.executed_price,
                quantity: result.executed_qty,
                amount_usdt,
                order_id: ord_id,
            },
        );

        info!(pair, price = result.executed_price, qty = result.executed_qty, "okx spot long opened");
        Ok(result)
    }

    async fn close_spot_long(
        &self,
        pair: &str,
        _amount_usdt: f64,
    ) -> Result<(TradeResult, f64), ExchangeError> {
        let inst_id = Self::spot_inst(pair);
        let base = base_asset(pair);

        let balance = self.balance(&base).await?;
        if fp::is_negative_or_zero(balance) {
            warn!(pair, asset = %base, "no okx balance to sell, clearing local cache");
            self.positions.write().remove(&format!("{pair}_spot"));
            return Err(ExchangeError::PositionNotFound);
        }

        let qty = precision::floor_quantity(balance, pair);
        if fp::is_negative_or_zero(qty) {
            return Err(ExchangeError::InvalidQuantity(qty));
        }

        let ord_id = self
            .place_order(serde_json::json!({
                "instId": inst_id,
                "tdMode": "cash",
                "side": "sell",
                "ordType": "market",
                "sz": precision::format_quantity(qty, pair),
            }))
            .await?;

        let detail = self.order_detail(&inst_id, &ord_id).await?;
        let result = Self::trade_result(ord_id, &detail);

        self.positions.write().remove(&format!("{pair}_spot"));

        let new_balance = self.balance("USDT").await?;
        let prev_balance = self.snapshots.get(self.name(), Market::Spot, "USDT");
        self.snapshots.set(self.name(), Market::Spot, "USDT", new_balance);
        let profit = new_balance - prev_balance;

        info!(pair, profit, "okx spot long closed");
        Ok((result, profit))
    }

    async fn put_futures_short(
        &self,
        pair: &str,
        amount_usdt: f64,
    ) -> Result<TradeResult, ExchangeError> {
        let inst_id = Self::swap_inst(pair);

        // Cross 10x; already-configured accounts reject this harmlessly.
        let lever_body = serde_json::json!({
            "instId": inst_id,
            "lever": "10",
            "mgnMode": "cross",
        })
        .to_string();
        let _: Result<OkxEnvelope<serde_json::Value>, _> = self
            .signed_request(reqwest::Method::POST, "/api/v5/account/set-leverage", &lever_body)
            .await;

        let balance = self.balance("USDT").await?;
        self.snapshots.set(self.name(), Market::Futures, "USDT", balance);

        // USDT-margined swaps are sized in contracts of 1 USDT.
        let contracts = amount_usdt.max(1.0);

        let ord_id = self
            .place_order(serde_json::json!({
                "instId": inst_id,
                "tdMode": "cross",
                "side": "sell",
                "ordType": "market",
                "sz": format!("{contracts:.0}"),
            }))
            .await?;

        let detail = self.order_detail(&inst_id, &ord_id).await?;
        let result = Self::trade_result(ord_id.clone(), &detail);

        self.positions.write().insert(
            format!("{pair}_futures"),
            OpenPosition {
                pair: pair.to_string(),
                side: "short".into(),
                market: Market::Futures,
                entry_price: result.executed_price,
                quantity: result.executed_qty,
                amount_usdt: result.executed_qty * result.executed_price,
                order_id: ord_id,
            },
        );

        info!(pair, price = result.executed_price, qty = result.executed_qty, "okx futures short opened");
        Ok(result)
    }

    async fn close_futures_short(
        &self,
        pair: &str,
    ) -> Result<(TradeResult, f64), ExchangeError> {
        let inst_id = Self::swap_inst(pair);

        let Some(pos) = self.open_short_position(&inst_id).await? else {
            warn!(pair, "no okx swap position, clearing local cache");
            self.positions.write().remove(&format!("{pair}_futures"));
            return Err(ExchangeError::PositionNotFound);
        };

        let contracts = pos.abs();
        if contracts <= 0.0 {
            return Err(ExchangeError::PositionNotFound);
        }

        let prev_balance = self.snapshots.get(self.name(), Market::Futures, "USDT");

        let ord_id = self
            .place_order(serde_json::json!({
                "instId": inst_id,
                "tdMode": "cross",
                "side": "buy",
                "ordType": "market",
                "sz": format!("{contracts:.0}"),
            }))
            .await?;

        let detail = self.order_detail(&inst_id, &ord_id).await?;
        let result = Self::trade_result(ord_id, &detail);

        self.positions.write().remove(&format!("{pair}_futures"));

        let new_balance = self.balance("USDT").await?;
        self.snapshots.set(self.name(), Market::Futures, "USDT", new_balance);
        let profit = new_balance - prev_balance;

        info!(pair, profit, "okx futures short closed");
        Ok((result, profit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instrument_ids() {
        assert_eq!(OkxClient::spot_inst("doge-usdt"), "DOGE-USDT");
        assert_eq!(OkxClient::swap_inst("doge-usdt"), "DOGE-USDT-SWAP");
    }

    #[test]
    fn signature_is_base64() {
        let client = OkxClient::new("k", "s", "p", BalanceBook::new());
        let sig = client.sign("2026-01-01T00:00:00.000Z", "GET", "/api/v5/account/balance", "");
        assert!(BASE64.decode(&sig).is_ok());
    }

    #[test]
    fn envelope_decodes_error_shape() {
        let body = r#"{"code":"51000","msg":"Parameter error","data":[]}"#;
        let envelope: OkxEnvelope<OrderAck> = serde_json::from_str(body).unwrap();
        assert_eq!(envelope.code, "51000");
        assert!(envelope.data.is_empty());
    }

    #[test]
    fn balance_detail_prefers_avail_eq() {
        let body = r#"{"code":"0","msg":"","data":[{"details":[
            {"ccy":"USDT","availBal":"5","availEq":"7","cashBal":"9"}
        ]}]}"#;
        let envelope: OkxEnvelope<BalanceData> = serde_json::from_str(body).unwrap();
        let detail = &envelope.data[0].details[0];
        assert_eq!(parse_f64(&detail.avail_eq), 7.0);
    }
}
