//! Engine scenario tests with a scripted venue and reasoning engine.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use perp_common::{Candle, Interval, Side, Trend};

use crate::config::BotConfig;
use crate::error::VenueError;
use crate::history::{HistoryStore, TradeResult};
use crate::metrics::Metrics;
use crate::reasoning::{
    Decision, EntryVerdict, PositionAction, PositionVerdict, ReasoningApi, RiskLevel,
};
use crate::venue::types::{
    Balance, InstrumentInfo, MarketSnapshot, OrderBook, OrderRecord, OrderResult,
    PositionSnapshot, TradeProposal,
};
use crate::venue::VenueApi;

use super::tracking::TrackingRecord;
use super::Engine;

#[derive(Default)]
struct MockState {
    price: f64,
    balance: Balance,
    positions: Vec<PositionSnapshot>,
    order_history: Vec<OrderRecord>,
    submitted: Vec<TradeProposal>,
    closes: Vec<(Side, u8)>,
    sl_updates: Vec<f64>,
}

struct MockVenue {
    state: Mutex<MockState>,
}

impl MockVenue {
    fn new(price: f64, balance_total: f64) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState {
                price,
                balance: Balance {
                    total: balance_total,
                    available: balance_total,
                    used_margin: 0.0,
                },
                ..MockState::default()
            }),
        })
    }

    fn set_price(&self, price: f64) {
        self.state.lock().unwrap().price = price;
    }

    fn set_position(&self, position: Option<PositionSnapshot>) {
        let mut state = self.state.lock().unwrap();
        state.positions = position.into_iter().collect();
    }

    fn push_order_record(&self, record: OrderRecord) {
        self.state.lock().unwrap().order_history.insert(0, record);
    }

    fn submitted(&self) -> Vec<TradeProposal> {
        self.state.lock().unwrap().submitted.clone()
    }

    fn closes(&self) -> Vec<(Side, u8)> {
        self.state.lock().unwrap().closes.clone()
    }

    fn sl_updates(&self) -> Vec<f64> {
        self.state.lock().unwrap().sl_updates.clone()
    }
}

#[async_trait]
impl VenueApi for MockVenue {
    async fn market_data(&self, symbol: &str) -> Result<MarketSnapshot, VenueError> {
        let price = self.state.lock().unwrap().price;
        Ok(MarketSnapshot {
            symbol: symbol.to_string(),
            price,
            bid: price - 0.5,
            ask: price + 0.5,
            volume_24h: 100_000.0,
            change_24h_pct: 0.5,
            high_24h: price * 1.01,
            low_24h: price * 0.99,
            timestamp: Utc::now().timestamp_millis(),
        })
    }

    async fn candles(
        &self,
        _symbol: &str,
        _interval: Interval,
        limit: usize,
    ) -> Result<Vec<Candle>, VenueError> {
        let price = self.state.lock().unwrap().price;
        Ok((0..limit as i64)
            .map(|i| Candle {
                open_time: i * 300_000,
                close_time: (i + 1) * 300_000,
                open: price,
                high: price,
                low: price,
                close: price,
                volume: 100.0,
            })
            .collect())
    }

    async fn order_book(&self, _symbol: &str, _depth: usize) -> Result<OrderBook, VenueError> {
        Ok(OrderBook {
            bids: vec![],
            asks: vec![],
        })
    }

    async fn submit_order(&self, proposal: &TradeProposal) -> Result<OrderResult, VenueError> {
        let mut state = self.state.lock().unwrap();
        state.submitted.push(proposal.clone());
        Ok(OrderResult {
            order_id: format!("mock-{}", state.submitted.len()),
            avg_price: state.price,
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
        let state = self.state.lock().unwrap();
        Ok(state
            .positions
            .iter()
            .filter(|p| symbol.is_none() || symbol == Some(p.symbol.as_str()))
            .cloned()
            .collect())
    }

    async fn balance(&self) -> Result<Balance, VenueError> {
        Ok(self.state.lock().unwrap().balance)
    }

    async fn update_stop_loss(
        &self,
        _symbol: &str,
        stop_loss: f64,
        _take_profit: Option<f64>,
    ) -> Result<(), VenueError> {
        self.state.lock().unwrap().sl_updates.push(stop_loss);
        Ok(())
    }

    async fn close(&self, _symbol: &str, side: Side, pct: u8) -> Result<OrderResult, VenueError> {
        let mut state = self.state.lock().unwrap();
        state.closes.push((side, pct));
        Ok(OrderResult {
            order_id: format!("close-{}", state.closes.len()),
            avg_price: state.price,
            fees: 0.0,
        })
    }

    async fn order_history(
        &self,
        _symbol: &str,
        limit: usize,
    ) -> Result<Vec<OrderRecord>, VenueError> {
        let state = self.state.lock().unwrap();
        Ok(state.order_history.iter().take(limit).cloned().collect())
    }

    async fn instrument(&self, symbol: &str) -> Result<InstrumentInfo, VenueError> {
        Ok(InstrumentInfo {
            symbol: symbol.to_string(),
            base_coin: "BTC".into(),
            quote_coin: "USDT".into(),
            min_order_qty: 0.001,
            qty_step: 0.001,
            tick_size: 0.5,
        })
    }

    async fn health(&self) -> bool {
        true
    }
}

struct MockReasoning {
    entry: Mutex<EntryVerdict>,
    position: Mutex<PositionVerdict>,
}

impl MockReasoning {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            entry: Mutex::new(hold_entry()),
            position: Mutex::new(PositionVerdict {
                action: PositionAction::Hold,
                confidence: 0.5,
                reasoning: String::new(),
                risk_level: RiskLevel::Medium,
            }),
        })
    }

    fn set_entry(&self, verdict: EntryVerdict) {
        *self.entry.lock().unwrap() = verdict;
    }

    fn set_position_action(&self, action: PositionAction) {
        self.position.lock().unwrap().action = action;
    }
}

#[async_trait]
impl ReasoningApi for MockReasoning {
    async fn analyse_entry(&self, _prompt: &str) -> EntryVerdict {
        self.entry.lock().unwrap().clone()
    }

    async fn analyse_position(&self, _prompt: &str) -> PositionVerdict {
        self.position.lock().unwrap().clone()
    }

    async fn health(&self) -> bool {
        true
    }
}

fn hold_entry() -> EntryVerdict {
    EntryVerdict {
        decision: Decision::Hold,
        confidence: 0.5,
        reasoning: String::new(),
        suggested_leverage: 5,
        risk_level: RiskLevel::Medium,
        market_sentiment: Trend::Neutral,
    }
}

fn buy_entry(confidence: f64, suggested: u32) -> EntryVerdict {
    EntryVerdict {
        decision: Decision::Buy,
        confidence,
        suggested_leverage: suggested,
        ..hold_entry()
    }
}

fn sell_entry(confidence: f64) -> EntryVerdict {
    EntryVerdict {
        decision: Decision::Sell,
        confidence,
        ..hold_entry()
    }
}

fn long_position(entry: f64, current: f64, size: f64) -> PositionSnapshot {
    let notional = entry * size;
    let unrealised = (current - entry) * size;
    PositionSnapshot {
        symbol: "BTCUSDT".into(),
        side: Side::Buy,
        size,
        entry_price: entry,
        current_price: current,
        unrealised_pnl: unrealised,
        pnl_pct: if notional > 0.0 { unrealised / notional * 100.0 } else { 0.0 },
        leverage: 20.0,
        timestamp: Utc::now().timestamp_millis(),
    }
}

struct Harness {
    engine: Arc<Engine>,
    venue: Arc<MockVenue>,
    reasoning: Arc<MockReasoning>,
    history: Arc<HistoryStore>,
}

fn harness() -> Harness {
    let mut cfg = BotConfig::default();
    cfg.trading.auto_trading = true;
    let venue = MockVenue::new(50_000.0, 10_000.0);
    let reasoning = MockReasoning::new();
    let history = Arc::new(HistoryStore::in_memory());
    let metrics = Metrics::new();
    let engine = Engine::new(
        cfg,
        venue.clone() as Arc<dyn VenueApi>,
        reasoning.clone() as Arc<dyn ReasoningApi>,
        history.clone(),
        metrics,
    );
    // Seed a flat 100-candle window; buffer refresh tasks are not started.
    let candles: Vec<Candle> = (0..100)
        .map(|i| Candle {
            open_time: i * 300_000,
            close_time: (i + 1) * 300_000,
            open: 50_000.0,
            high: 50_000.0,
            low: 50_000.0,
            close: 50_000.0,
            volume: 100.0,
        })
        .collect();
    engine.candle_buffer().apply(candles);
    Harness {
        engine,
        venue,
        reasoning,
        history,
    }
}

fn insert_tracking(engine: &Engine, record: TrackingRecord) {
    engine
        .tracking
        .lock()
        .unwrap()
        .insert(record.symbol.clone(), record);
}

fn tracking_snapshot(engine: &Engine) -> HashMap<String, TrackingRecord> {
    engine.tracking.lock().unwrap().clone()
}

// Scenario: empty start, confident BUY verdict opens a long. The sizer asks
// for 0.266 BTC; the risk gate's balance-relative check downsizes the order
// to 0.060 and the engine retries with the adjusted proposal.
#[tokio::test]
async fn empty_start_opens_long_with_gate_adjustment() {
    let h = harness();
    h.reasoning.set_entry(buy_entry(0.8, 15));

    h.engine.tick().await.unwrap();

    let submitted = h.venue.submitted();
    assert_eq!(submitted.len(), 1);
    let order = &submitted[0];
    assert_eq!(order.side, Side::Buy);
    // 5 base + 15 (AI at 0.8) + 5 (Kalman 1.0 on a flat series) + 3 (RSI
    // clamp at 100) = 28, clipped to the 20x scalp cap.
    assert_eq!(order.leverage, 20);
    // Sizer: min(10, 20/3)% of 10k at 20x => 0.266; gate caps notional at
    // 30% of balance => floor(3000/50000/0.001) = 0.060.
    assert!((order.quantity - 0.060).abs() < 1e-12);
    assert!((order.stop_loss.unwrap() - 49_700.0).abs() < 1e-6);
    assert!((order.take_profit.unwrap() - 50_570.0).abs() < 1e-6);

    assert_eq!(h.engine.risk_gate().daily_count(), 1);
    let tracking = tracking_snapshot(&h.engine);
    assert!(tracking.contains_key("BTCUSDT"));
    assert!(!tracking["BTCUSDT"].trade_id.is_empty());
}

#[tokio::test]
async fn hold_verdict_opens_nothing() {
    let h = harness();
    h.engine.tick().await.unwrap();
    assert!(h.venue.submitted().is_empty());
    assert_eq!(h.engine.risk_gate().daily_count(), 0);
}

#[tokio::test]
async fn auto_trading_off_suppresses_execution() {
    let mut cfg = BotConfig::default();
    cfg.trading.auto_trading = false;
    let venue = MockVenue::new(50_000.0, 10_000.0);
    let reasoning = MockReasoning::new();
    reasoning.set_entry(buy_entry(0.9, 20));
    let engine = Engine::new(
        cfg,
        venue.clone() as Arc<dyn VenueApi>,
        reasoning.clone() as Arc<dyn ReasoningApi>,
        Arc::new(HistoryStore::in_memory()),
        Metrics::new(),
    );
    engine.candle_buffer().apply(
        (0..100)
            .map(|i| Candle {
                open_time: i * 300_000,
                close_time: (i + 1) * 300_000,
                open: 50_000.0,
                high: 50_000.0,
                low: 50_000.0,
                close: 50_000.0,
                volume: 100.0,
            })
            .collect(),
    );
    engine.tick().await.unwrap();
    assert!(venue.submitted().is_empty());
}

// Scenario: profit ladder first rung fires once and only once.
#[tokio::test]
async fn profit_ladder_first_rung_fires_once() {
    let h = harness();
    h.venue.set_position(Some(long_position(50_000.0, 50_150.0, 0.266)));

    h.engine.tick().await.unwrap();
    assert_eq!(h.venue.closes(), vec![(Side::Buy, 25)]);
    let tracking = tracking_snapshot(&h.engine);
    assert!(tracking["BTCUSDT"].profit_ladder_fired.contains(&30));

    // Same PnL next tick: the rung must not re-fire.
    h.engine.tick().await.unwrap();
    assert_eq!(h.venue.closes().len(), 1);
}

// Scenario: trailing stop ratchets once per new high.
#[tokio::test]
async fn trailing_stop_updates_once_per_new_high() {
    let h = harness();
    let mut record = TrackingRecord::new("BTCUSDT", Side::Buy, 50_000.0, Some(49_700.0), "t1");
    // Ladder rungs pre-fired so only the trailing logic acts here.
    record.profit_ladder_fired.extend([30, 60, 100]);
    insert_tracking(&h.engine, record);

    h.venue.set_price(50_400.0);
    h.venue.set_position(Some(long_position(50_000.0, 50_400.0, 0.266)));
    h.engine.tick().await.unwrap();

    h.venue.set_price(50_600.0);
    h.venue.set_position(Some(long_position(50_000.0, 50_600.0, 0.266)));
    h.engine.tick().await.unwrap();

    // Price revisits the same high: no further update.
    h.engine.tick().await.unwrap();

    let updates = h.venue.sl_updates();
    assert_eq!(updates.len(), 2, "{updates:?}");
    assert!((updates[0] - 50_400.0 * 0.997).abs() < 1e-6);
    assert!((updates[1] - 50_448.2).abs() < 1e-6);
    // The stop only ever moved up.
    assert!(updates[1] > updates[0]);
}

// Scenario: a take-profit fill detected in order history closes the book.
#[tokio::test]
async fn tp_detected_via_history_scan() {
    let h = harness();
    let trade_id = h
        .history
        .record_open(
            "BTCUSDT",
            crate::history::open_record(
                Side::Buy,
                0.8,
                crate::history::EntryDetail {
                    price: 50_000.0,
                    rsi: 35.0,
                    macd_hist: 0.2,
                    kalman_trend: Trend::Bullish,
                    leverage: 20,
                    qty: 0.266,
                },
            ),
        )
        .await
        .unwrap();
    insert_tracking(
        &h.engine,
        TrackingRecord::new("BTCUSDT", Side::Buy, 50_000.0, Some(49_700.0), trade_id),
    );
    h.venue.set_position(Some(long_position(50_000.0, 50_560.0, 0.266)));
    h.venue.push_order_record(OrderRecord {
        order_id: "tp-1".into(),
        side: Side::Sell,
        qty: 0.266,
        avg_price: 50_570.0,
        order_type: "Market".into(),
        stop_order_type: "TakeProfit".into(),
        updated_at: Utc::now().timestamp_millis() + 60_000,
    });

    h.engine.tick().await.unwrap();

    // The venue already closed the position; the engine must not close again.
    assert!(h.venue.closes().is_empty());
    assert!(tracking_snapshot(&h.engine).is_empty());
    let ctx = h.history.context("BTCUSDT").await.unwrap();
    assert_eq!(ctx.recent.len(), 1);
    assert_eq!(ctx.recent[0].result, TradeResult::Win);
    assert_eq!(
        ctx.recent[0].exit.as_ref().unwrap().exit_type,
        crate::history::ExitType::TakeProfit
    );
}

// Scenario: no hedging. An opposite entry signal while a position is open
// must not submit a counter-order.
#[tokio::test]
async fn no_hedge_on_opposite_signal() {
    let h = harness();
    h.venue.set_position(Some(long_position(50_000.0, 50_010.0, 0.266)));
    h.reasoning.set_entry(sell_entry(0.65)); // below the reversal threshold

    h.engine.tick().await.unwrap();

    assert!(h.venue.submitted().is_empty());
    assert!(h.venue.closes().is_empty());
    // Tracking was adopted for the live position instead.
    assert!(tracking_snapshot(&h.engine).contains_key("BTCUSDT"));
}

// A confident opposite signal exits through the management policy, never
// by opening a counter-position.
#[tokio::test]
async fn confident_reversal_closes_via_management() {
    let h = harness();
    h.venue.set_position(Some(long_position(50_000.0, 50_010.0, 0.266)));
    h.reasoning.set_entry(sell_entry(0.85));

    h.engine.tick().await.unwrap();

    assert!(h.venue.submitted().is_empty());
    assert_eq!(h.venue.closes(), vec![(Side::Buy, 100)]);
    assert!(tracking_snapshot(&h.engine).is_empty());
}

#[tokio::test]
async fn ai_partial_close_keeps_tracking() {
    let h = harness();
    h.venue.set_position(Some(long_position(50_000.0, 50_020.0, 0.266)));
    h.reasoning.set_position_action(PositionAction::Close50);

    h.engine.tick().await.unwrap();

    assert_eq!(h.venue.closes(), vec![(Side::Buy, 50)]);
    assert!(tracking_snapshot(&h.engine).contains_key("BTCUSDT"));
}

#[tokio::test]
async fn at_most_one_position_per_symbol_after_tick() {
    let h = harness();
    h.reasoning.set_entry(buy_entry(0.9, 15));
    // Position already open: the BUY signal must not stack another order.
    h.venue.set_position(Some(long_position(50_000.0, 50_010.0, 0.266)));

    h.engine.tick().await.unwrap();
    assert!(h.venue.submitted().is_empty());
    assert_eq!(tracking_snapshot(&h.engine).len(), 1);
}
