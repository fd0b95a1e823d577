//! Typed views of venue data.
//!
//! These are the engine-facing shapes; wire deserialisation lives in
//! `client.rs` and maps the venue's stringly payloads into them.

use perp_common::Side;
use serde::{Deserialize, Serialize};

/// Latest tick with 24 h statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub price: f64,
    pub bid: f64,
    pub ask: f64,
    pub volume_24h: f64,
    pub change_24h_pct: f64,
    pub high_24h: f64,
    pub low_24h: f64,
    /// Unix millis at fetch time.
    pub timestamp: i64,
}

/// A single order-book level.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: f64,
    pub qty: f64,
}

/// Order book snapshot: bids descending, asks ascending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBook {
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
}

/// Result of a filled market order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResult {
    pub order_id: String,
    pub avg_price: f64,
    pub fees: f64,
}

/// A live position as reported by the venue (size > 0 only).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub symbol: String,
    pub side: Side,
    pub size: f64,
    pub entry_price: f64,
    pub current_price: f64,
    pub unrealised_pnl: f64,
    /// Margin-unadjusted: `unrealised_pnl / (entry_price · size) · 100`.
    /// The management thresholds assume this convention.
    pub pnl_pct: f64,
    pub leverage: f64,
    pub timestamp: i64,
}

/// Wallet balance. `available` falls back to 95% of `total` when the venue
/// omits the field.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Balance {
    pub total: f64,
    pub available: f64,
    pub used_margin: f64,
}

/// Instrument trading rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentInfo {
    pub symbol: String,
    pub base_coin: String,
    pub quote_coin: String,
    pub min_order_qty: f64,
    pub qty_step: f64,
    pub tick_size: f64,
}

/// A filled order from recent history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    pub order_id: String,
    pub side: Side,
    pub qty: f64,
    pub avg_price: f64,
    /// Venue order classification, e.g. "TakeProfit", "StopLoss", "Market".
    pub order_type: String,
    pub stop_order_type: String,
    /// Fill time, unix millis.
    pub updated_at: i64,
}

/// Outcome of scanning recent order history for conditional exits.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TpSlCheck {
    pub tp_executed: bool,
    pub sl_executed: bool,
    /// Fill price of the detected exit, when present.
    pub exit_price: Option<f64>,
}

/// A market order request, already risk-approved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeProposal {
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub leverage: u32,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
}
