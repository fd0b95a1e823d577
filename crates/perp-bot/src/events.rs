//! Structured log events.
//!
//! Every event goes through `tracing` under the `events` target with a
//! monotonic timestamp and the originating component, so downstream log
//! shippers can filter them without parsing free text.

use perp_common::Side;
use serde::Serialize;
use tracing::{info, warn};

/// How a close was classified in the TRADE_CLOSE event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloseKind {
    TakeProfit,
    StopLoss,
    Liquidation,
    ManualClose,
}

impl CloseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseKind::TakeProfit => "TAKE_PROFIT",
            CloseKind::StopLoss => "STOP_LOSS",
            CloseKind::Liquidation => "LIQUIDATION",
            CloseKind::ManualClose => "MANUAL_CLOSE",
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub fn trade_open(symbol: &str, side: Side, qty: f64, price: f64, leverage: u32, trade_id: &str) {
    info!(
        target: "events",
        event = "TRADE_OPEN",
        component = "engine",
        ts = now_ms(),
        symbol,
        side = %side,
        qty,
        price,
        leverage,
        trade_id,
    );
}

pub fn trade_close(
    symbol: &str,
    side: Side,
    kind: CloseKind,
    executed_by: &str,
    pnl: f64,
    pnl_pct: f64,
) {
    info!(
        target: "events",
        event = "TRADE_CLOSE",
        component = "engine",
        ts = now_ms(),
        symbol,
        side = %side,
        r#type = kind.as_str(),
        executed_by,
        pnl,
        pnl_pct,
    );
}

pub fn ai_analysis(symbol: &str, decision: &str, confidence: f64, duration_ms: u64) {
    info!(
        target: "events",
        event = "AI_ANALYSIS",
        component = "reasoning",
        ts = now_ms(),
        symbol,
        decision,
        confidence,
        duration_ms,
    );
}

pub fn system(component: &str, phase: &str) {
    info!(
        target: "events",
        event = %format!("SYSTEM_{}_{}", component.to_uppercase(), phase.to_uppercase()),
        component,
        ts = now_ms(),
    );
}

pub fn system_error(component: &str, error: &str) {
    warn!(
        target: "events",
        event = %format!("SYSTEM_{}_ERROR", component.to_uppercase()),
        component,
        ts = now_ms(),
        error,
    );
}

pub fn risk_event(kind: &str, detail: &str) {
    warn!(
        target: "events",
        event = %format!("RISK_{kind}"),
        component = "risk",
        ts = now_ms(),
        detail,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_kind_wire_names() {
        assert_eq!(CloseKind::TakeProfit.as_str(), "TAKE_PROFIT");
        assert_eq!(CloseKind::ManualClose.as_str(), "MANUAL_CLOSE");
    }
}
