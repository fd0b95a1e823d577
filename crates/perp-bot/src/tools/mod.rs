//! Tools server: exposes individual capabilities to an external supervisor
//! over a bidirectional text-frame protocol.
//!
//! Each frame is one JSON object. Request: `{id, method, params, timestamp}`.
//! Response: `{id, result|error, timestamp}`. Methods are `tools/list` and
//! `tools/call`; everything a tool does goes through the same adapters the
//! engine uses, including the risk gate for `execute_trade`.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use perp_common::{Interval, Side};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, tungstenite::protocol::Message};
use tracing::{debug, error, info, warn};

use crate::candles::CandleBuffer;
use crate::config::BotConfig;
use crate::engine::entry;
use crate::indicators::{self, levels, patterns};
use crate::kalman::KalmanPredictor;
use crate::reasoning::{prompt, ReasoningApi};
use crate::risk::{RiskContext, RiskGate};
use crate::venue::types::TradeProposal;
use crate::venue::VenueApi;

/// Close percentages accepted by `close_position`.
const CLOSE_PERCENTAGES: [u8; 3] = [25, 50, 100];

/// Shared adapters the tools dispatch over.
pub struct ToolsContext {
    pub cfg: BotConfig,
    pub venue: Arc<dyn VenueApi>,
    pub reasoning: Arc<dyn ReasoningApi>,
    pub buffer: Arc<CandleBuffer>,
    pub risk: Arc<RiskGate>,
}

#[derive(Debug, Deserialize)]
struct ToolRequest {
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
    #[serde(default)]
    #[allow(dead_code)]
    timestamp: Option<i64>,
}

fn response_ok(id: &Value, result: Value) -> String {
    json!({
        "id": id,
        "result": result,
        "timestamp": chrono::Utc::now().timestamp_millis(),
    })
    .to_string()
}

fn response_err(id: &Value, error: impl std::fmt::Display) -> String {
    json!({
        "id": id,
        "error": error.to_string(),
        "timestamp": chrono::Utc::now().timestamp_millis(),
    })
    .to_string()
}

/// Tool metadata for `tools/list`.
fn tool_specs() -> Value {
    let spec = |name: &str, description: &str, schema: Value| {
        json!({ "name": name, "description": description, "input_schema": schema })
    };
    let no_args = json!({ "type": "object", "properties": {} });
    json!([
        spec("get_market_data", "Latest tick with bid/ask and 24h stats", no_args.clone()),
        spec("analyze_technical", "Composite technical indicator snapshot", no_args.clone()),
        spec(
            "kalman_predict",
            "Kalman filter price forecast",
            json!({ "type": "object", "properties": {
                "look_ahead": { "type": "integer", "minimum": 1, "maximum": 50 }
            }}),
        ),
        spec("ai_analysis", "Full entry analysis through the reasoning engine", no_args.clone()),
        spec(
            "execute_trade",
            "Submit a risk-gated market order",
            json!({ "type": "object", "required": ["side", "quantity"], "properties": {
                "side": { "type": "string", "enum": ["Buy", "Sell"] },
                "quantity": { "type": "number", "exclusiveMinimum": 0 },
                "leverage": { "type": "integer", "minimum": 1, "maximum": 50 }
            }}),
        ),
        spec("get_positions", "Open positions on the configured symbol", no_args.clone()),
        spec(
            "close_position",
            "Close part or all of the open position",
            json!({ "type": "object", "required": ["percentage"], "properties": {
                "percentage": { "type": "integer", "enum": [25, 50, 100] }
            }}),
        ),
        spec("get_market_data_1m", "Recent 1-minute candles", no_args.clone()),
        spec("analyze_candle_pattern", "Short-window candle patterns on 1m data", no_args.clone()),
        spec("detect_micro_trend", "Macro vs micro timeframe trend comparison", no_args.clone()),
        spec("analyze_order_book", "Order book pressure and walls", no_args),
    ])
}

async fn dispatch(ctx: &ToolsContext, name: &str, args: &Value) -> Result<Value, String> {
    let symbol = &ctx.cfg.symbol;
    match name {
        "get_market_data" => ctx
            .venue
            .market_data(symbol)
            .await
            .map(|s| serde_json::to_value(s).unwrap_or_default())
            .map_err(|e| e.to_string()),

        "analyze_technical" => {
            let candles = ctx.buffer.get(100);
            let snapshot = indicators::compute(&candles, ctx.cfg.trading.macd_ema_signal);
            let sr = levels::support_resistance(&candles, 5);
            let volatility = levels::annualized_volatility(&candles, 20, ctx.cfg.interval);
            Ok(json!({
                "indicators": snapshot,
                "support_resistance": sr,
                "annualized_volatility": volatility,
            }))
        }

        "kalman_predict" => {
            let look_ahead = args
                .get("look_ahead")
                .and_then(Value::as_u64)
                .unwrap_or(5)
                .clamp(1, 50) as usize;
            let candles = ctx.buffer.get(100);
            let prediction = KalmanPredictor::new().predict(&candles, look_ahead);
            Ok(serde_json::to_value(prediction).unwrap_or_default())
        }

        "ai_analysis" => {
            let candles = ctx.buffer.get(100);
            let technicals = indicators::compute(&candles, ctx.cfg.trading.macd_ema_signal);
            let kalman = KalmanPredictor::new().predict(&candles, 5);
            let snapshot = ctx
                .venue
                .market_data(symbol)
                .await
                .map_err(|e| e.to_string())?;
            let text = prompt::build_entry_prompt(&snapshot, &technicals, &kalman, None);
            let verdict = ctx.reasoning.analyse_entry(&text).await;
            Ok(serde_json::to_value(verdict).unwrap_or_default())
        }

        "execute_trade" => {
            let side = args
                .get("side")
                .and_then(Value::as_str)
                .and_then(Side::from_str_opt)
                .ok_or("side must be Buy or Sell")?;
            let quantity = args
                .get("quantity")
                .and_then(Value::as_f64)
                .filter(|q| *q > 0.0)
                .ok_or("quantity must be positive")?;
            let leverage = args
                .get("leverage")
                .and_then(Value::as_u64)
                .unwrap_or(5)
                .clamp(1, 50) as u32;

            let snapshot = ctx
                .venue
                .market_data(symbol)
                .await
                .map_err(|e| e.to_string())?;
            let instrument = ctx.venue.instrument(symbol).await.map_err(|e| e.to_string())?;
            let balance = ctx.venue.balance().await.map_err(|e| e.to_string())?;
            let (stop_loss, take_profit) = entry::compute_sl_tp(
                side,
                snapshot.price,
                ctx.cfg.trading.stop_loss_pct,
                0.5,
            );
            let proposal = TradeProposal {
                symbol: symbol.clone(),
                side,
                quantity,
                leverage,
                stop_loss: Some(stop_loss),
                take_profit: Some(take_profit),
            };
            let verdict = ctx.risk.validate(
                &proposal,
                &RiskContext {
                    price: snapshot.price,
                    total_balance: balance.total,
                    existing_exposure: 0.0,
                    volatility: 0.0,
                    qty_step: instrument.qty_step,
                },
            );
            if !verdict.approved {
                return Err(verdict
                    .reason
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| "rejected by risk gate".into()));
            }
            let result = ctx
                .venue
                .submit_order(&proposal)
                .await
                .map_err(|e| e.to_string())?;
            ctx.risk.increment_daily();
            Ok(serde_json::to_value(result).unwrap_or_default())
        }

        "get_positions" => ctx
            .venue
            .positions(Some(symbol))
            .await
            .map(|p| serde_json::to_value(p).unwrap_or_default())
            .map_err(|e| e.to_string()),

        "close_position" => {
            let pct = args
                .get("percentage")
                .and_then(Value::as_u64)
                .unwrap_or(100) as u8;
            if !CLOSE_PERCENTAGES.contains(&pct) {
                return Err(format!("percentage must be one of {CLOSE_PERCENTAGES:?}"));
            }
            let position = ctx
                .venue
                .positions(Some(symbol))
                .await
                .map_err(|e| e.to_string())?
                .into_iter()
                .next()
                .ok_or("no open position")?;
            ctx.venue
                .close(symbol, position.side, pct)
                .await
                .map(|r| serde_json::to_value(r).unwrap_or_default())
                .map_err(|e| e.to_string())
        }

        "get_market_data_1m" => ctx
            .venue
            .candles(symbol, Interval::OneMin, 20)
            .await
            .map(|c| serde_json::to_value(c).unwrap_or_default())
            .map_err(|e| e.to_string()),

        "analyze_candle_pattern" => {
            let candles = ctx
                .venue
                .candles(symbol, Interval::OneMin, 10)
                .await
                .map_err(|e| e.to_string())?;
            Ok(serde_json::to_value(patterns::analyze_candle_patterns(&candles))
                .unwrap_or_default())
        }

        "detect_micro_trend" => {
            let coarse = ctx.buffer.get(20);
            let fine = ctx
                .venue
                .candles(symbol, Interval::OneMin, 10)
                .await
                .map_err(|e| e.to_string())?;
            Ok(serde_json::to_value(patterns::micro_trend(&coarse, &fine)).unwrap_or_default())
        }

        "analyze_order_book" => {
            let book = ctx
                .venue
                .order_book(symbol, 25)
                .await
                .map_err(|e| e.to_string())?;
            Ok(serde_json::to_value(patterns::order_book_pressure(&book)).unwrap_or_default())
        }

        other => Err(format!("unknown tool: {other}")),
    }
}

async fn handle_frame(ctx: &ToolsContext, raw: &str) -> String {
    let request: ToolRequest = match serde_json::from_str(raw) {
        Ok(r) => r,
        Err(e) => return response_err(&Value::Null, format!("malformed request: {e}")),
    };
    match request.method.as_str() {
        "tools/list" => response_ok(&request.id, json!({ "tools": tool_specs() })),
        "tools/call" => {
            let name = request
                .params
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let args = request
                .params
                .get("arguments")
                .cloned()
                .unwrap_or_else(|| json!({}));
            match dispatch(ctx, &name, &args).await {
                Ok(result) => response_ok(&request.id, result),
                Err(e) => response_err(&request.id, e),
            }
        }
        other => response_err(&request.id, format!("unknown method: {other}")),
    }
}

async fn handle_client(ctx: Arc<ToolsContext>, stream: TcpStream, peer: SocketAddr) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("tools handshake with {peer} failed: {e}");
            return;
        }
    };
    debug!("tools client connected: {peer}");
    let (mut sink, mut source) = ws.split();
    while let Some(message) = source.next().await {
        match message {
            Ok(Message::Text(text)) => {
                let reply = handle_frame(&ctx, &text).await;
                if sink.send(Message::Text(reply)).await.is_err() {
                    break;
                }
            }
            Ok(Message::Ping(payload)) => {
                let _ = sink.send(Message::Pong(payload)).await;
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }
    debug!("tools client disconnected: {peer}");
}

/// Serve the tools protocol on `port`. Port 0 in config disables the server
/// (the caller checks); the returned handle is aborted on shutdown.
pub fn spawn_tools_server(ctx: Arc<ToolsContext>, port: u16) -> JoinHandle<()> {
    tokio::spawn(async move {
        let addr: SocketAddr = ([0, 0, 0, 0], port).into();
        let listener = match TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("tools server failed to bind {addr}: {e}");
                return;
            }
        };
        info!("tools server listening on ws://{addr}");
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    tokio::spawn(handle_client(Arc::clone(&ctx), stream, peer));
                }
                Err(e) => {
                    warn!("tools accept failed: {e}");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_specs_cover_the_required_surface() {
        let specs = tool_specs();
        let names: Vec<&str> = specs
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s["name"].as_str().unwrap())
            .collect();
        for required in [
            "get_market_data",
            "analyze_technical",
            "kalman_predict",
            "ai_analysis",
            "execute_trade",
            "get_positions",
            "close_position",
            "get_market_data_1m",
            "analyze_candle_pattern",
            "detect_micro_trend",
            "analyze_order_book",
        ] {
            assert!(names.contains(&required), "missing tool {required}");
        }
        // Every spec carries a schema.
        for spec in specs.as_array().unwrap() {
            assert!(spec["input_schema"].is_object());
            assert!(spec["description"].is_string());
        }
    }

    #[test]
    fn malformed_request_produces_error_frame() {
        let request: Result<ToolRequest, _> = serde_json::from_str("not json");
        assert!(request.is_err());

        let frame = response_err(&Value::Null, "malformed request");
        let parsed: Value = serde_json::from_str(&frame).unwrap();
        assert!(parsed["error"].as_str().unwrap().contains("malformed"));
        assert!(parsed["timestamp"].is_i64());
    }

    #[test]
    fn request_shape_parses_with_optional_fields() {
        let request: ToolRequest = serde_json::from_str(
            r#"{"id": 7, "method": "tools/call", "params": {"name": "get_positions"}}"#,
        )
        .unwrap();
        assert_eq!(request.id, serde_json::json!(7));
        assert_eq!(request.method, "tools/call");
        assert_eq!(request.params["name"], "get_positions");
    }

    #[test]
    fn close_percentage_whitelist() {
        assert!(CLOSE_PERCENTAGES.contains(&25));
        assert!(CLOSE_PERCENTAGES.contains(&100));
        assert!(!CLOSE_PERCENTAGES.contains(&10));
    }
}
