//! Venue adapter: typed interface over the exchange REST API.
//!
//! Purely transport; no trading decisions live here. The engine talks to
//! the [`VenueApi`] trait so tests (and the paper executor) can substitute
//! implementations.

pub mod client;
pub mod paper;
pub mod types;

use async_trait::async_trait;
use perp_common::{Candle, Interval, Side};

use crate::error::VenueError;
use types::{
    Balance, InstrumentInfo, MarketSnapshot, OrderBook, OrderRecord, OrderResult,
    PositionSnapshot, TpSlCheck, TradeProposal,
};

pub use client::VenueClient;
pub use paper::PaperVenue;

/// Typed venue operations used by the engine and the tools server.
#[async_trait]
pub trait VenueApi: Send + Sync {
    /// Latest tick with bid/ask and 24 h stats.
    async fn market_data(&self, symbol: &str) -> Result<MarketSnapshot, VenueError>;

    /// Chronological candles, oldest first.
    async fn candles(
        &self,
        symbol: &str,
        interval: Interval,
        limit: usize,
    ) -> Result<Vec<Candle>, VenueError>;

    /// Order book: bids descending, asks ascending.
    async fn order_book(&self, symbol: &str, depth: usize) -> Result<OrderBook, VenueError>;

    /// Submit an IOC market order. Quantity is normalised to the
    /// instrument's step before submission.
    async fn submit_order(&self, proposal: &TradeProposal) -> Result<OrderResult, VenueError>;

    /// Idempotent; the venue's "leverage not modified" answer is not an error.
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), VenueError>;

    /// Open positions with size > 0, optionally filtered by symbol.
    async fn positions(&self, symbol: Option<&str>)
        -> Result<Vec<PositionSnapshot>, VenueError>;

    async fn balance(&self) -> Result<Balance, VenueError>;

    /// Modify the live position's conditional orders.
    async fn update_stop_loss(
        &self,
        symbol: &str,
        stop_loss: f64,
        take_profit: Option<f64>,
    ) -> Result<(), VenueError>;

    /// Close `pct` percent of the position by a reduce-only market order.
    /// The rounded quantity must be non-zero.
    async fn close(&self, symbol: &str, side: Side, pct: u8) -> Result<OrderResult, VenueError>;

    /// Filled orders, newest first.
    async fn order_history(&self, symbol: &str, limit: usize)
        -> Result<Vec<OrderRecord>, VenueError>;

    /// Instrument trading rules (min qty, steps).
    async fn instrument(&self, symbol: &str) -> Result<InstrumentInfo, VenueError>;

    /// Connectivity probe.
    async fn health(&self) -> bool;

    /// Scan recent order history for a TP- or SL-typed fill after `since_ts`
    /// (unix millis).
    async fn check_tp_sl(&self, symbol: &str, since_ts: i64) -> Result<TpSlCheck, VenueError> {
        let history = self.order_history(symbol, 20).await?;
        let mut check = TpSlCheck::default();
        for order in history {
            if order.updated_at <= since_ts {
                continue;
            }
            let kind = order.stop_order_type.to_ascii_lowercase();
            if kind.contains("takeprofit") || kind.contains("partialtakeprofit") {
                check.tp_executed = true;
                check.exit_price.get_or_insert(order.avg_price);
            } else if kind.contains("stoploss") || kind.contains("partialstoploss") {
                check.sl_executed = true;
                check.exit_price.get_or_insert(order.avg_price);
            }
        }
        Ok(check)
    }
}
