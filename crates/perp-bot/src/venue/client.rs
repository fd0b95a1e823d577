//! REST client for the venue's v5 API.
//!
//! Reads hit public market endpoints; account and order endpoints are
//! HMAC-SHA256 signed over `timestamp + api_key + recv_window + payload`,
//! where payload is the key-sorted query string for GETs and the raw JSON
//! body for POSTs. A small allow-list of venue retCodes ("not modified"
//! answers to idempotent writes) is demoted to warnings.

use std::time::Duration;

use chrono::Utc;
use hmac::{Hmac, Mac};
use perp_common::{floor_to_step, format_step, Candle, Interval, Side};
use reqwest::Client;
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::{debug, warn};

use crate::config::VenueConfig;
use crate::error::VenueError;

use super::types::{
    Balance, BookLevel, InstrumentInfo, MarketSnapshot, OrderBook, OrderRecord, OrderResult,
    PositionSnapshot, TradeProposal,
};
use super::VenueApi;

type HmacSha256 = Hmac<Sha256>;

/// Venue retCodes that mean "already in the requested state".
const IGNORED_RET_CODES: &[i64] = &[110043, 34036];

const CATEGORY: &str = "linear";

/// REST venue adapter.
pub struct VenueClient {
    http: Client,
    cfg: VenueConfig,
}

impl VenueClient {
    pub fn new(cfg: VenueConfig) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .user_agent("perp-bot/0.3")
            .build()
            .expect("reqwest client construction is infallible with these options");
        Self { http, cfg }
    }

    fn sign(&self, timestamp: i64, payload: &str) -> Result<String, VenueError> {
        let mut mac = HmacSha256::new_from_slice(self.cfg.api_secret.as_bytes())
            .map_err(|_| VenueError::MissingCredentials)?;
        mac.update(
            format!(
                "{timestamp}{}{}{payload}",
                self.cfg.api_key, self.cfg.recv_window_ms
            )
            .as_bytes(),
        );
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Public (unsigned) GET.
    async fn get(&self, path: &str, params: &[(&str, String)]) -> Result<Value, VenueError> {
        let query = serde_urlencoded::to_string(params)
            .map_err(|e| VenueError::InvalidOrder(e.to_string()))?;
        let url = format!("{}{}?{}", self.cfg.base_url(), path, query);
        let resp = self.http.get(&url).send().await?;
        self.unwrap_envelope(resp.json::<Value>().await?)
    }

    /// Signed GET. Params are key-sorted before signing so the signature is
    /// deterministic.
    async fn signed_get(
        &self,
        path: &str,
        mut params: Vec<(&str, String)>,
    ) -> Result<Value, VenueError> {
        if !self.cfg.has_credentials() {
            return Err(VenueError::MissingCredentials);
        }
        params.sort_by(|a, b| a.0.cmp(b.0));
        let query = serde_urlencoded::to_string(&params)
            .map_err(|e| VenueError::InvalidOrder(e.to_string()))?;
        let timestamp = Utc::now().timestamp_millis();
        let signature = self.sign(timestamp, &query)?;
        let url = format!("{}{}?{}", self.cfg.base_url(), path, query);
        let resp = self
            .http
            .get(&url)
            .header("X-BAPI-API-KEY", &self.cfg.api_key)
            .header("X-BAPI-TIMESTAMP", timestamp.to_string())
            .header("X-BAPI-RECV-WINDOW", self.cfg.recv_window_ms.to_string())
            .header("X-BAPI-SIGN", signature)
            .send()
            .await?;
        self.unwrap_envelope(resp.json::<Value>().await?)
    }

    /// Signed POST; the signature covers the raw JSON body.
    async fn signed_post(&self, path: &str, body: &Value) -> Result<Value, VenueError> {
        if !self.cfg.has_credentials() {
            return Err(VenueError::MissingCredentials);
        }
        let raw = serde_json::to_string(body)
            .map_err(|e| VenueError::InvalidOrder(e.to_string()))?;
        let timestamp = Utc::now().timestamp_millis();
        let signature = self.sign(timestamp, &raw)?;
        let url = format!("{}{}", self.cfg.base_url(), path);
        let resp = self
            .http
            .post(&url)
            .header("X-BAPI-API-KEY", &self.cfg.api_key)
            .header("X-BAPI-TIMESTAMP", timestamp.to_string())
            .header("X-BAPI-RECV-WINDOW", self.cfg.recv_window_ms.to_string())
            .header("X-BAPI-SIGN", signature)
            .header("Content-Type", "application/json")
            .body(raw)
            .send()
            .await?;
        self.unwrap_envelope(resp.json::<Value>().await?)
    }

    fn unwrap_envelope(&self, payload: Value) -> Result<Value, VenueError> {
        let code = payload.get("retCode").and_then(Value::as_i64).unwrap_or(-1);
        if code == 0 {
            return Ok(payload.get("result").cloned().unwrap_or(Value::Null));
        }
        let message = payload
            .get("retMsg")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        if IGNORED_RET_CODES.contains(&code) {
            warn!(code, %message, "venue returned not-modified, ignoring");
            return Ok(payload.get("result").cloned().unwrap_or(Value::Null));
        }
        Err(VenueError::Api { code, message })
    }
}

/// Parse a numeric field the venue renders as a string.
fn num(value: &Value, key: &str) -> f64 {
    match value.get(key) {
        Some(Value::String(s)) => s.parse().unwrap_or(0.0),
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        _ => 0.0,
    }
}

fn first_of_list(result: &Value) -> Result<&Value, VenueError> {
    result
        .get("list")
        .and_then(Value::as_array)
        .and_then(|l| l.first())
        .ok_or(VenueError::MissingData("list"))
}

fn parse_level(raw: &Value) -> Option<BookLevel> {
    let pair = raw.as_array()?;
    Some(BookLevel {
        price: pair.first()?.as_str()?.parse().ok()?,
        qty: pair.get(1)?.as_str()?.parse().ok()?,
    })
}

#[async_trait::async_trait]
impl VenueApi for VenueClient {
    async fn market_data(&self, symbol: &str) -> Result<MarketSnapshot, VenueError> {
        let result = self
            .get(
                "/v5/market/tickers",
                &[("category", CATEGORY.into()), ("symbol", symbol.into())],
            )
            .await?;
        let ticker = first_of_list(&result)?;
        Ok(MarketSnapshot {
            symbol: symbol.to_string(),
            price: num(ticker, "lastPrice"),
            bid: num(ticker, "bid1Price"),
            ask: num(ticker, "ask1Price"),
            volume_24h: num(ticker, "volume24h"),
            change_24h_pct: num(ticker, "price24hPcnt") * 100.0,
            high_24h: num(ticker, "highPrice24h"),
            low_24h: num(ticker, "lowPrice24h"),
            timestamp: Utc::now().timestamp_millis(),
        })
    }

    async fn candles(
        &self,
        symbol: &str,
        interval: Interval,
        limit: usize,
    ) -> Result<Vec<Candle>, VenueError> {
        let result = self
            .get(
                "/v5/market/kline",
                &[
                    ("category", CATEGORY.into()),
                    ("symbol", symbol.into()),
                    ("interval", interval.as_str().into()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;
        let rows = result
            .get("list")
            .and_then(Value::as_array)
            .ok_or(VenueError::MissingData("kline list"))?;
        // The venue emits newest first; the buffer wants oldest first.
        let mut candles: Vec<Candle> = rows
            .iter()
            .filter_map(|row| {
                let row = row.as_array()?;
                let field = |i: usize| -> Option<f64> { row.get(i)?.as_str()?.parse().ok() };
                let open_time = row.first()?.as_str()?.parse::<i64>().ok()?;
                Some(Candle {
                    open_time,
                    close_time: open_time + interval.seconds() as i64 * 1_000,
                    open: field(1)?,
                    high: field(2)?,
                    low: field(3)?,
                    close: field(4)?,
                    volume: field(5)?,
                })
            })
            .collect();
        candles.reverse();
        Ok(candles)
    }

    async fn order_book(&self, symbol: &str, depth: usize) -> Result<OrderBook, VenueError> {
        let result = self
            .get(
                "/v5/market/orderbook",
                &[
                    ("category", CATEGORY.into()),
                    ("symbol", symbol.into()),
                    ("limit", depth.to_string()),
                ],
            )
            .await?;
        let side = |key: &str| -> Vec<BookLevel> {
            result
                .get(key)
                .and_then(Value::as_array)
                .map(|levels| levels.iter().filter_map(parse_level).collect())
                .unwrap_or_default()
        };
        Ok(OrderBook {
            bids: side("b"),
            asks: side("a"),
        })
    }

    async fn submit_order(&self, proposal: &TradeProposal) -> Result<OrderResult, VenueError> {
        if !(proposal.quantity.is_finite() && proposal.quantity > 0.0) {
            return Err(VenueError::InvalidOrder(format!(
                "quantity {}",
                proposal.quantity
            )));
        }
        let instrument = self.instrument(&proposal.symbol).await?;
        let qty = format_step(proposal.quantity, instrument.qty_step);
        if floor_to_step(proposal.quantity, instrument.qty_step) <= 0.0 {
            return Err(VenueError::InvalidOrder(format!(
                "quantity {} rounds to zero at step {}",
                proposal.quantity, instrument.qty_step
            )));
        }

        self.set_leverage(&proposal.symbol, proposal.leverage).await?;

        let mut body = json!({
            "category": CATEGORY,
            "symbol": proposal.symbol,
            "side": proposal.side.as_str(),
            "orderType": "Market",
            "qty": qty,
            "timeInForce": "IOC",
        });
        if let Some(sl) = proposal.stop_loss {
            body["stopLoss"] = json!(format_step(sl, instrument.tick_size));
        }
        if let Some(tp) = proposal.take_profit {
            body["takeProfit"] = json!(format_step(tp, instrument.tick_size));
        }

        let result = self.signed_post("/v5/order/create", &body).await?;
        let order_id = result
            .get("orderId")
            .and_then(Value::as_str)
            .ok_or(VenueError::MissingData("orderId"))?
            .to_string();

        // The create response carries no fill data; pick it up from the
        // freshest history entry, falling back to the last tick.
        let (avg_price, fees) = match self.order_history(&proposal.symbol, 10).await {
            Ok(history) => history
                .iter()
                .find(|o| o.order_id == order_id)
                .map(|o| (o.avg_price, 0.0))
                .unwrap_or((0.0, 0.0)),
            Err(e) => {
                debug!("fill lookup after submit failed: {e}");
                (0.0, 0.0)
            }
        };
        let avg_price = if avg_price > 0.0 {
            avg_price
        } else {
            self.market_data(&proposal.symbol).await?.price
        };

        Ok(OrderResult {
            order_id,
            avg_price,
            fees,
        })
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), VenueError> {
        let body = json!({
            "category": CATEGORY,
            "symbol": symbol,
            "buyLeverage": leverage.to_string(),
            "sellLeverage": leverage.to_string(),
        });
        self.signed_post("/v5/position/set-leverage", &body).await?;
        Ok(())
    }

    async fn positions(
        &self,
        symbol: Option<&str>,
    ) -> Result<Vec<PositionSnapshot>, VenueError> {
        let mut params = vec![("category", CATEGORY.to_string())];
        match symbol {
            Some(s) => params.push(("symbol", s.to_string())),
            None => params.push(("settleCoin", "USDT".to_string())),
        }
        let result = self.signed_get("/v5/position/list", params).await?;
        let rows = result
            .get("list")
            .and_then(Value::as_array)
            .ok_or(VenueError::MissingData("position list"))?;
        let now = Utc::now().timestamp_millis();
        Ok(rows
            .iter()
            .filter_map(|row| {
                let size = num(row, "size");
                if size <= 0.0 {
                    return None;
                }
                let side = Side::from_str_opt(row.get("side")?.as_str()?)?;
                let entry_price = num(row, "avgPrice");
                let current_price = num(row, "markPrice");
                let unrealised_pnl = num(row, "unrealisedPnl");
                let notional = entry_price * size;
                Some(PositionSnapshot {
                    symbol: row.get("symbol")?.as_str()?.to_string(),
                    side,
                    size,
                    entry_price,
                    current_price,
                    unrealised_pnl,
                    pnl_pct: if notional > 0.0 {
                        unrealised_pnl / notional * 100.0
                    } else {
                        0.0
                    },
                    leverage: num(row, "leverage"),
                    timestamp: now,
                })
            })
            .collect())
    }

    async fn balance(&self) -> Result<Balance, VenueError> {
        let result = self
            .signed_get(
                "/v5/account/wallet-balance",
                vec![("accountType", "UNIFIED".to_string())],
            )
            .await?;
        let account = first_of_list(&result)?;
        let total = num(account, "totalEquity");
        let available = match account.get("totalAvailableBalance") {
            Some(Value::String(s)) if !s.is_empty() => s.parse().unwrap_or(total * 0.95),
            _ => total * 0.95,
        };
        Ok(Balance {
            total,
            available,
            used_margin: num(account, "totalInitialMargin"),
        })
    }

    async fn update_stop_loss(
        &self,
        symbol: &str,
        stop_loss: f64,
        take_profit: Option<f64>,
    ) -> Result<(), VenueError> {
        let instrument = self.instrument(symbol).await?;
        let mut body = json!({
            "category": CATEGORY,
            "symbol": symbol,
            "stopLoss": format_step(stop_loss, instrument.tick_size),
            "positionIdx": 0,
        });
        if let Some(tp) = take_profit {
            body["takeProfit"] = json!(format_step(tp, instrument.tick_size));
        }
        self.signed_post("/v5/position/trading-stop", &body).await?;
        Ok(())
    }

    async fn close(&self, symbol: &str, side: Side, pct: u8) -> Result<OrderResult, VenueError> {
        if pct == 0 || pct > 100 {
            return Err(VenueError::InvalidOrder(format!("close pct {pct}")));
        }
        let position = self
            .positions(Some(symbol))
            .await?
            .into_iter()
            .find(|p| p.side == side)
            .ok_or(VenueError::MissingData("position to close"))?;
        let instrument = self.instrument(symbol).await?;
        let qty = floor_to_step(position.size * pct as f64 / 100.0, instrument.qty_step);
        if qty <= 0.0 {
            return Err(VenueError::InvalidOrder(format!(
                "close quantity rounds to zero (size {}, pct {pct})",
                position.size
            )));
        }
        let body = json!({
            "category": CATEGORY,
            "symbol": symbol,
            "side": side.opposite().as_str(),
            "orderType": "Market",
            "qty": format_step(qty, instrument.qty_step),
            "timeInForce": "IOC",
            "reduceOnly": true,
        });
        let result = self.signed_post("/v5/order/create", &body).await?;
        let order_id = result
            .get("orderId")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Ok(OrderResult {
            order_id,
            avg_price: position.current_price,
            fees: 0.0,
        })
    }

    async fn order_history(
        &self,
        symbol: &str,
        limit: usize,
    ) -> Result<Vec<OrderRecord>, VenueError> {
        let result = self
            .signed_get(
                "/v5/order/history",
                vec![
                    ("category", CATEGORY.to_string()),
                    ("symbol", symbol.to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;
        let rows = result
            .get("list")
            .and_then(Value::as_array)
            .ok_or(VenueError::MissingData("order history list"))?;
        Ok(rows
            .iter()
            .filter_map(|row| {
                let status = row.get("orderStatus")?.as_str()?;
                if status != "Filled" && status != "PartiallyFilled" {
                    return None;
                }
                Some(OrderRecord {
                    order_id: row.get("orderId")?.as_str()?.to_string(),
                    side: Side::from_str_opt(row.get("side")?.as_str()?)?,
                    qty: num(row, "qty"),
                    avg_price: num(row, "avgPrice"),
                    order_type: row
                        .get("orderType")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    stop_order_type: row
                        .get("stopOrderType")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    updated_at: row
                        .get("updatedTime")
                        .and_then(Value::as_str)
                        .and_then(|s| s.parse().ok())
                        .unwrap_or_default(),
                })
            })
            .collect())
    }

    async fn instrument(&self, symbol: &str) -> Result<InstrumentInfo, VenueError> {
        let result = self
            .get(
                "/v5/market/instruments-info",
                &[("category", CATEGORY.into()), ("symbol", symbol.into())],
            )
            .await?;
        let info = first_of_list(&result)?;
        let lot = info
            .get("lotSizeFilter")
            .ok_or(VenueError::MissingData("lotSizeFilter"))?;
        let price = info
            .get("priceFilter")
            .ok_or(VenueError::MissingData("priceFilter"))?;
        Ok(InstrumentInfo {
            symbol: symbol.to_string(),
            base_coin: info
                .get("baseCoin")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            quote_coin: info
                .get("quoteCoin")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            min_order_qty: num(lot, "minOrderQty"),
            qty_step: num(lot, "qtyStep"),
            tick_size: num(price, "tickSize"),
        })
    }

    async fn health(&self) -> bool {
        self.get("/v5/market/time", &[]).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> VenueClient {
        VenueClient::new(VenueConfig {
            api_key: "key".into(),
            api_secret: "secret".into(),
            testnet: true,
            recv_window_ms: 5_000,
            timeout_ms: 10_000,
        })
    }

    #[test]
    fn signature_is_deterministic() {
        let c = client();
        let a = c.sign(1_700_000_000_000, "category=linear&symbol=BTCUSDT").unwrap();
        let b = c.sign(1_700_000_000_000, "category=linear&symbol=BTCUSDT").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64); // hex sha256
        let other = c.sign(1_700_000_000_001, "category=linear&symbol=BTCUSDT").unwrap();
        assert_ne!(a, other);
    }

    #[test]
    fn envelope_ok_and_error_paths() {
        let c = client();
        let ok = c
            .unwrap_envelope(serde_json::json!({"retCode": 0, "result": {"x": 1}}))
            .unwrap();
        assert_eq!(ok["x"], 1);

        let err = c.unwrap_envelope(serde_json::json!({"retCode": 10001, "retMsg": "params"}));
        assert!(matches!(err, Err(VenueError::Api { code: 10001, .. })));
    }

    #[test]
    fn not_modified_codes_are_ignored() {
        let c = client();
        let leverage = c.unwrap_envelope(serde_json::json!({
            "retCode": 110043, "retMsg": "leverage not modified", "result": {}
        }));
        assert!(leverage.is_ok());
        let tpsl = c.unwrap_envelope(serde_json::json!({
            "retCode": 34036, "retMsg": "not modified", "result": {}
        }));
        assert!(tpsl.is_ok());
    }

    #[test]
    fn num_parses_strings_and_numbers() {
        let v = serde_json::json!({"a": "1.5", "b": 2, "c": "oops"});
        assert_eq!(num(&v, "a"), 1.5);
        assert_eq!(num(&v, "b"), 2.0);
        assert_eq!(num(&v, "c"), 0.0);
        assert_eq!(num(&v, "missing"), 0.0);
    }

    #[test]
    fn book_level_parsing() {
        let level = parse_level(&serde_json::json!(["50000.5", "0.25"])).unwrap();
        assert_eq!(level.price, 50_000.5);
        assert_eq!(level.qty, 0.25);
        assert!(parse_level(&serde_json::json!(["bad"])).is_none());
    }
}
