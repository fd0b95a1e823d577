//! Paper trading venue: live market reads, simulated account writes.
//!
//! Wraps a real venue adapter for market data and simulates order
//! execution in-process. Conditional exits are evaluated lazily: each
//! `positions()` read checks whether the latest price crossed the stored
//! stop-loss or take-profit and, if so, converts the position into a
//! synthetic fill so `check_tp_sl` behaves exactly as in live mode.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use perp_common::{floor_to_step, Candle, Interval, Side};
use tokio::sync::Mutex;
use tracing::info;

use crate::error::VenueError;

use super::types::{
    Balance, InstrumentInfo, MarketSnapshot, OrderBook, OrderRecord, OrderResult,
    PositionSnapshot, TradeProposal,
};
use super::VenueApi;

#[derive(Debug, Clone)]
struct PaperPosition {
    side: Side,
    size: f64,
    entry_price: f64,
    leverage: f64,
    stop_loss: Option<f64>,
    take_profit: Option<f64>,
}

#[derive(Debug, Default)]
struct PaperAccount {
    /// Open positions keyed by symbol (at most one per symbol).
    positions: HashMap<String, PaperPosition>,
    /// Synthetic fill log, newest first.
    fills: Vec<OrderRecord>,
    realised_pnl: f64,
}

/// Simulated execution over live market data.
pub struct PaperVenue {
    inner: Arc<dyn VenueApi>,
    account: Mutex<PaperAccount>,
    initial_balance: f64,
    next_order_id: AtomicU64,
}

impl PaperVenue {
    pub fn new(inner: Arc<dyn VenueApi>, initial_balance: f64) -> Self {
        Self {
            inner,
            account: Mutex::new(PaperAccount::default()),
            initial_balance,
            next_order_id: AtomicU64::new(1),
        }
    }

    fn order_id(&self) -> String {
        format!("paper-{}", self.next_order_id.fetch_add(1, Ordering::Relaxed))
    }

    fn record_fill(
        account: &mut PaperAccount,
        order_id: String,
        side: Side,
        qty: f64,
        price: f64,
        stop_order_type: &str,
    ) {
        account.fills.insert(
            0,
            OrderRecord {
                order_id,
                side,
                qty,
                avg_price: price,
                order_type: "Market".to_string(),
                stop_order_type: stop_order_type.to_string(),
                updated_at: Utc::now().timestamp_millis(),
            },
        );
        account.fills.truncate(50);
    }

    /// Close out the stored position if price crossed its SL or TP.
    fn settle_conditionals(
        &self,
        account: &mut PaperAccount,
        symbol: &str,
        price: f64,
    ) {
        let Some(position) = account.positions.get(symbol).cloned() else {
            return;
        };
        let (crossed, kind, level) = match position.side {
            Side::Buy => {
                if position.stop_loss.is_some_and(|sl| price <= sl) {
                    (true, "StopLoss", position.stop_loss.unwrap())
                } else if position.take_profit.is_some_and(|tp| price >= tp) {
                    (true, "TakeProfit", position.take_profit.unwrap())
                } else {
                    (false, "", 0.0)
                }
            }
            Side::Sell => {
                if position.stop_loss.is_some_and(|sl| price >= sl) {
                    (true, "StopLoss", position.stop_loss.unwrap())
                } else if position.take_profit.is_some_and(|tp| price <= tp) {
                    (true, "TakeProfit", position.take_profit.unwrap())
                } else {
                    (false, "", 0.0)
                }
            }
        };
        if !crossed {
            return;
        }
        let pnl =
            (level - position.entry_price) * position.size * position.side.sign();
        account.realised_pnl += pnl;
        account.positions.remove(symbol);
        let order_id = self.order_id();
        Self::record_fill(
            account,
            order_id,
            position.side.opposite(),
            position.size,
            level,
            kind,
        );
        info!(symbol, kind, level, pnl, "paper conditional exit filled");
    }
}

#[async_trait]
impl VenueApi for PaperVenue {
    async fn market_data(&self, symbol: &str) -> Result<MarketSnapshot, VenueError> {
        self.inner.market_data(symbol).await
    }

    async fn candles(
        &self,
        symbol: &str,
        interval: Interval,
        limit: usize,
    ) -> Result<Vec<Candle>, VenueError> {
        self.inner.candles(symbol, interval, limit).await
    }

    async fn order_book(&self, symbol: &str, depth: usize) -> Result<OrderBook, VenueError> {
        self.inner.order_book(symbol, depth).await
    }

    async fn submit_order(&self, proposal: &TradeProposal) -> Result<OrderResult, VenueError> {
        if !(proposal.quantity.is_finite() && proposal.quantity > 0.0) {
            return Err(VenueError::InvalidOrder(format!(
                "quantity {}",
                proposal.quantity
            )));
        }
        let price = self.inner.market_data(&proposal.symbol).await?.price;
        let mut account = self.account.lock().await;
        if let Some(existing) = account.positions.get(&proposal.symbol) {
            if existing.side != proposal.side {
                return Err(VenueError::InvalidOrder(
                    "opposite-side order while position open".to_string(),
                ));
            }
        }
        account.positions.insert(
            proposal.symbol.clone(),
            PaperPosition {
                side: proposal.side,
                size: proposal.quantity,
                entry_price: price,
                leverage: proposal.leverage as f64,
                stop_loss: proposal.stop_loss,
                take_profit: proposal.take_profit,
            },
        );
        let order_id = self.order_id();
        Self::record_fill(
            &mut account,
            order_id.clone(),
            proposal.side,
            proposal.quantity,
            price,
            "",
        );
        info!(
            symbol = %proposal.symbol,
            side = %proposal.side,
            qty = proposal.quantity,
            price,
            "paper order filled"
        );
        Ok(OrderResult {
            order_id,
            avg_price: price,
            fees: 0.0,
        })
    }

    async fn set_leverage(&self, _symbol: &str, _leverage: u32) -> Result<(), VenueError> {
        Ok(())
    }

    async fn positions(
        &self,
        symbol: Option<&str>,
    ) -> Result<Vec<PositionSnapshot>, VenueError> {
        let mut out = Vec::new();
        let mut account = self.account.lock().await;
        let symbols: Vec<String> = account
            .positions
            .keys()
            .filter(|s| symbol.is_none_or(|want| want == s.as_str()))
            .cloned()
            .collect();
        for sym in symbols {
            let price = self.inner.market_data(&sym).await?.price;
            self.settle_conditionals(&mut account, &sym, price);
            if let Some(p) = account.positions.get(&sym) {
                let notional = p.entry_price * p.size;
                let unrealised = (price - p.entry_price) * p.size * p.side.sign();
                out.push(PositionSnapshot {
                    symbol: sym.clone(),
                    side: p.side,
                    size: p.size,
                    entry_price: p.entry_price,
                    current_price: price,
                    unrealised_pnl: unrealised,
                    pnl_pct: if notional > 0.0 {
                        unrealised / notional * 100.0
                    } else {
                        0.0
                    },
                    leverage: p.leverage,
                    timestamp: Utc::now().timestamp_millis(),
                });
            }
        }
        Ok(out)
    }

    async fn balance(&self) -> Result<Balance, VenueError> {
        let account = self.account.lock().await;
        let total = self.initial_balance + account.realised_pnl;
        Ok(Balance {
            total,
            available: total * 0.95,
            used_margin: 0.0,
        })
    }

    async fn update_stop_loss(
        &self,
        symbol: &str,
        stop_loss: f64,
        take_profit: Option<f64>,
    ) -> Result<(), VenueError> {
        let mut account = self.account.lock().await;
        let position = account
            .positions
            .get_mut(symbol)
            .ok_or(VenueError::MissingData("position for trading stop"))?;
        position.stop_loss = Some(stop_loss);
        if take_profit.is_some() {
            position.take_profit = take_profit;
        }
        Ok(())
    }

    async fn close(&self, symbol: &str, side: Side, pct: u8) -> Result<OrderResult, VenueError> {
        if pct == 0 || pct > 100 {
            return Err(VenueError::InvalidOrder(format!("close pct {pct}")));
        }
        let price = self.inner.market_data(symbol).await?.price;
        let step = self
            .inner
            .instrument(symbol)
            .await
            .map(|i| i.qty_step)
            .unwrap_or(0.0);
        let mut account = self.account.lock().await;
        let position = account
            .positions
            .get(symbol)
            .filter(|p| p.side == side)
            .cloned()
            .ok_or(VenueError::MissingData("position to close"))?;
        let mut qty = position.size * pct as f64 / 100.0;
        if step > 0.0 {
            qty = floor_to_step(qty, step);
        }
        if qty <= 0.0 {
            return Err(VenueError::InvalidOrder(format!(
                "close quantity rounds to zero (size {}, pct {pct})",
                position.size
            )));
        }
        let pnl = (price - position.entry_price) * qty * side.sign();
        account.realised_pnl += pnl;
        if qty >= position.size {
            account.positions.remove(symbol);
        } else if let Some(p) = account.positions.get_mut(symbol) {
            p.size -= qty;
        }
        let order_id = self.order_id();
        Self::record_fill(&mut account, order_id.clone(), side.opposite(), qty, price, "");
        Ok(OrderResult {
            order_id,
            avg_price: price,
            fees: 0.0,
        })
    }

    async fn order_history(
        &self,
        _symbol: &str,
        limit: usize,
    ) -> Result<Vec<OrderRecord>, VenueError> {
        let account = self.account.lock().await;
        Ok(account.fills.iter().take(limit).cloned().collect())
    }

    async fn instrument(&self, symbol: &str) -> Result<InstrumentInfo, VenueError> {
        self.inner.instrument(symbol).await
    }

    async fn health(&self) -> bool {
        self.inner.health().await
    }
}
