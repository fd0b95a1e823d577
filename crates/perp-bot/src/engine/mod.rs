//! Strategy orchestrator: the per-symbol control loop.
//!
//! Each tick runs three serial steps over the shared components:
//!
//! - **A. Analysis**: candles into indicators and the Kalman forecast,
//!   market snapshot, history context, entry verdict from the reasoning
//!   engine.
//! - **B. Manage**: for the (at most one) open position: TP/SL fill scan,
//!   trailing stop, reasoning verdict, backup exit rules.
//! - **C. Open**: when flat and the verdict says so: size, gate, submit.
//!
//! The per-symbol state machine is Idle → Opening → Open → Closing → Idle;
//! `Opening` is transient within a tick, and `Open` needs no extra state
//! because every management step re-reads the venue's position list, which
//! is what keeps the one-position invariant checkable in a single place.
//!
//! ## Modules
//!
//! - `tracking`: per-position bookkeeping
//! - `entry`: leverage/quantity/SL-TP sizing
//! - `manage`: trailing arithmetic and backup exit rules

pub mod entry;
pub mod manage;
pub mod tracking;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use perp_common::Side;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::candles::{CandleBuffer, DEFAULT_CAP};
use crate::config::BotConfig;
use crate::error::{EngineError, VenueError};
use crate::events::{self, CloseKind};
use crate::history::{EntryDetail, ExitDetail, ExitType, HistoryStore};
use crate::indicators::{self, TechnicalIndicators};
use crate::kalman::{KalmanPredictor, KalmanPrediction};
use crate::metrics::{GaugeState, Metrics};
use crate::reasoning::{prompt, Decision, EntryVerdict, PositionAction, ReasoningApi};
use crate::risk::{RiskContext, RiskGate};
use crate::venue::types::{MarketSnapshot, PositionSnapshot, TradeProposal};
use crate::venue::VenueApi;

use manage::{evaluate_backup_exits, trailing_stop_candidate, TRAILING_ACTIVATION_PNL_PCT};
use tracking::TrackingRecord;

/// Candles handed to the per-tick analysis.
const ANALYSIS_WINDOW: usize = 100;
/// Minimum candles before the loop starts ticking.
const WARMUP_MIN: usize = 50;
/// Bound on the warmup wait.
const WARMUP_TIMEOUT_SECS: u64 = 60;
/// Extra delay after a transport failure before the next tick.
const ERROR_BACKOFF: Duration = Duration::from_secs(30);
/// Volatility lookback for the risk score.
const VOLATILITY_PERIOD: usize = 20;

/// Everything Step A produces, consumed by Steps B and C.
pub struct Analysis {
    pub snapshot: MarketSnapshot,
    pub indicators: TechnicalIndicators,
    pub kalman: KalmanPrediction,
    pub verdict: EntryVerdict,
    /// Raw per-interval volatility for the risk gate.
    pub volatility: f64,
}

/// The orchestrator. One per symbol; ticks are strictly serialised.
pub struct Engine {
    cfg: BotConfig,
    venue: Arc<dyn VenueApi>,
    reasoning: Arc<dyn ReasoningApi>,
    history: Arc<HistoryStore>,
    risk: Arc<RiskGate>,
    buffer: Arc<CandleBuffer>,
    kalman: KalmanPredictor,
    metrics: Arc<Metrics>,
    /// Keyed by symbol; the one-position invariant keeps this at most one
    /// entry per symbol, with the side carried inside the record.
    tracking: Mutex<HashMap<String, TrackingRecord>>,
    shutdown: broadcast::Sender<()>,
}

impl Engine {
    pub fn new(
        cfg: BotConfig,
        venue: Arc<dyn VenueApi>,
        reasoning: Arc<dyn ReasoningApi>,
        history: Arc<HistoryStore>,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        let buffer = Arc::new(CandleBuffer::new(cfg.symbol.clone(), cfg.interval, DEFAULT_CAP));
        let risk = Arc::new(RiskGate::new(cfg.trading.clone()));
        let (shutdown, _) = broadcast::channel(4);
        Arc::new(Self {
            cfg,
            venue,
            reasoning,
            history,
            risk,
            buffer,
            kalman: KalmanPredictor::new(),
            metrics: metrics.clone(),
            tracking: Mutex::new(HashMap::new()),
            shutdown,
        })
    }

    pub fn risk_gate(&self) -> Arc<RiskGate> {
        Arc::clone(&self.risk)
    }

    pub fn candle_buffer(&self) -> Arc<CandleBuffer> {
        Arc::clone(&self.buffer)
    }

    /// Request a graceful stop; the loop observes it between ticks.
    pub fn stop(&self) {
        let _ = self.shutdown.send(());
        self.buffer.stop();
        events::system("engine", "stop");
    }

    /// Run the control loop until stopped. Health checks and warmup are
    /// fatal; everything after is tick-resilient.
    pub async fn run(self: Arc<Self>) -> Result<(), EngineError> {
        events::system("engine", "start");

        if !self.venue.health().await {
            return Err(EngineError::Startup("venue unreachable".into()));
        }
        if !self.reasoning.health().await {
            return Err(EngineError::Startup("reasoning engine unreachable".into()));
        }
        self.metrics.set_health(true, true);

        self.buffer.start(Arc::clone(&self.venue)).await?;
        let warmup_deadline = Instant::now() + Duration::from_secs(WARMUP_TIMEOUT_SECS);
        while !self.buffer.has_enough(WARMUP_MIN) {
            if Instant::now() >= warmup_deadline {
                return Err(EngineError::WarmupTimeout {
                    min: WARMUP_MIN,
                    secs: WARMUP_TIMEOUT_SECS,
                });
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        info!(
            symbol = %self.cfg.symbol,
            interval = %self.cfg.interval,
            "engine warmed up, entering control loop"
        );

        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            let backoff = match self.tick().await {
                Ok(()) => None,
                Err(e) => {
                    self.metrics.record_error();
                    events::system_error("engine", &e.to_string());
                    e.is_transient().then_some(ERROR_BACKOFF)
                }
            };
            let sleep = self.cfg.interval.as_duration() + backoff.unwrap_or_default();
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = tokio::time::sleep(sleep) => {}
            }
        }
        info!(symbol = %self.cfg.symbol, "control loop stopped");
        Ok(())
    }

    /// One serialised tick: analyse, manage, maybe open.
    async fn tick(&self) -> Result<(), VenueError> {
        let analysis = self.analyse().await?;

        let positions = self.venue.positions(Some(&self.cfg.symbol)).await?;
        let position = positions.into_iter().find(|p| p.symbol == self.cfg.symbol);

        match position {
            Some(position) => {
                // No-hedge advisory: an opposite entry signal never opens a
                // counter-position; the management policy owns the exit.
                let opposite = match position.side {
                    Side::Buy => Decision::Sell,
                    Side::Sell => Decision::Buy,
                };
                if analysis.verdict.decision == opposite {
                    info!(
                        symbol = %self.cfg.symbol,
                        side = %position.side,
                        verdict = analysis.verdict.decision.as_str(),
                        "opposite entry signal while position open, managing instead"
                    );
                }
                self.manage_position(position, &analysis).await?;
            }
            None => {
                self.maybe_open(&analysis).await?;
            }
        }

        self.publish_gauges(&analysis).await;
        Ok(())
    }

    /// Step A: composite analysis.
    async fn analyse(&self) -> Result<Analysis, VenueError> {
        let started = Instant::now();
        let candles = self.buffer.get(ANALYSIS_WINDOW);

        let technicals = indicators::compute(&candles, self.cfg.trading.macd_ema_signal);
        let kalman = self.kalman.predict(&candles, 5);
        let volatility = indicators::levels::raw_volatility(&candles, VOLATILITY_PERIOD);
        let snapshot = self.venue.market_data(&self.cfg.symbol).await?;

        // History context is best-effort; the prompt just loses a section.
        let context = match self.history.context(&self.cfg.symbol).await {
            Ok(ctx) => Some(HistoryStore::format_context(&ctx)),
            Err(e) => {
                debug!("history context unavailable: {e}");
                None
            }
        };

        let entry_prompt =
            prompt::build_entry_prompt(&snapshot, &technicals, &kalman, context.as_deref());
        let verdict = self.reasoning.analyse_entry(&entry_prompt).await;

        let elapsed = started.elapsed().as_secs_f64();
        self.metrics.observe_analysis(elapsed);
        events::ai_analysis(
            &self.cfg.symbol,
            verdict.decision.as_str(),
            verdict.confidence,
            (elapsed * 1_000.0) as u64,
        );

        Ok(Analysis {
            snapshot,
            indicators: technicals,
            kalman,
            verdict,
            volatility,
        })
    }

    /// Step B: manage the open position.
    async fn manage_position(
        &self,
        position: PositionSnapshot,
        analysis: &Analysis,
    ) -> Result<(), VenueError> {
        let symbol = position.symbol.clone();

        // Ensure a tracking record exists and fold in the fresh price.
        let mut record = {
            let mut tracking = self.tracking.lock().expect("tracking map poisoned");
            let record = tracking.entry(symbol.clone()).or_insert_with(|| {
                warn!(symbol = %symbol, "position without tracking record, adopting");
                let (sl, _) = entry::compute_sl_tp(
                    position.side,
                    position.entry_price,
                    self.cfg.trading.stop_loss_pct,
                    0.5,
                );
                TrackingRecord::adopt(&position, Some(sl))
            });
            if record.side != position.side {
                // Venue and local state disagree; trust the venue, rebuild.
                warn!(symbol = %symbol, "tracking side mismatch, rebuilding record");
                *record = TrackingRecord::adopt(&position, None);
            }
            record.observe_price(position.current_price);
            record.clone()
        };

        // Poll for TP/SL fills since the last check.
        let scan_from = record.last_order_check_time;
        record.last_order_check_time = Utc::now().timestamp_millis();
        match self.venue.check_tp_sl(&symbol, scan_from).await {
            Ok(check) if check.tp_executed || check.sl_executed => {
                let kind = if check.tp_executed {
                    CloseKind::TakeProfit
                } else {
                    CloseKind::StopLoss
                };
                let exit_price = check.exit_price.unwrap_or(position.current_price);
                self.finalise_close(&record, &position, exit_price, kind, "venue")
                    .await;
                self.tracking.lock().expect("tracking map poisoned").remove(&symbol);
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => {
                debug!("tp/sl scan failed: {e}");
            }
        }

        // Trailing stop: arm on the activation threshold, then ratchet.
        if !record.trailing_active && position.pnl_pct >= TRAILING_ACTIVATION_PNL_PCT {
            record.trailing_active = true;
            info!(symbol = %symbol, pnl_pct = position.pnl_pct, "trailing stop armed");
        }
        if record.trailing_active {
            if let Some(new_stop) = trailing_stop_candidate(&record, position.pnl_pct) {
                match self.venue.update_stop_loss(&symbol, new_stop, None).await {
                    Ok(()) => {
                        info!(symbol = %symbol, new_stop, "trailing stop moved");
                        record.current_stop = Some(new_stop);
                    }
                    Err(e) => warn!("trailing stop update failed: {e}"),
                }
            }
        }

        // Reasoning verdict for the position.
        let position_prompt = prompt::build_position_prompt(
            &position,
            &analysis.snapshot,
            &analysis.indicators,
            &analysis.kalman,
            record.hours_open(Utc::now()),
        );
        let verdict = self.reasoning.analyse_position(&position_prompt).await;

        let (close_pct, executed_by) = if verdict.action != PositionAction::Hold {
            (verdict.action.close_pct(), "ai".to_string())
        } else {
            match evaluate_backup_exits(
                &record,
                position.pnl_pct,
                record.hours_open(Utc::now()),
                &analysis.verdict,
                &analysis.indicators,
            ) {
                Some(exit) => {
                    if let manage::BackupExit::ProfitLadder { level } = exit {
                        record.profit_ladder_fired.insert(level);
                    }
                    (exit.close_pct(), exit.tag())
                }
                None => (0, String::new()),
            }
        };

        if close_pct > 0 {
            let started = Instant::now();
            match self.venue.close(&symbol, position.side, close_pct).await {
                Ok(result) => {
                    self.metrics.observe_execution(started.elapsed().as_secs_f64());
                    info!(
                        symbol = %symbol,
                        close_pct,
                        executed_by = %executed_by,
                        "position exit executed"
                    );
                    if close_pct == 100 {
                        self.finalise_close(
                            &record,
                            &position,
                            result.avg_price,
                            CloseKind::ManualClose,
                            &executed_by,
                        )
                        .await;
                        self.tracking.lock().expect("tracking map poisoned").remove(&symbol);
                        return Ok(());
                    }
                }
                Err(e) => {
                    warn!("position close failed: {e}");
                    self.metrics.record_error();
                }
            }
        }

        // Persist the mutated record.
        self.tracking
            .lock()
            .expect("tracking map poisoned")
            .insert(symbol, record);
        Ok(())
    }

    /// Record the close everywhere it needs to land.
    async fn finalise_close(
        &self,
        record: &TrackingRecord,
        position: &PositionSnapshot,
        exit_price: f64,
        kind: CloseKind,
        executed_by: &str,
    ) {
        let pnl = (exit_price - position.entry_price)
            * position.size
            * position.side.sign();
        let notional = position.entry_price * position.size;
        let pnl_pct = if notional > 0.0 { pnl / notional * 100.0 } else { 0.0 };

        events::trade_close(&record.symbol, position.side, kind, executed_by, pnl, pnl_pct);
        self.metrics.record_trade_result(pnl > 0.0);

        if record.trade_id.is_empty() {
            // Adopted position with no open record; nothing to close upstream.
            return;
        }
        let exit = ExitDetail {
            exit_type: match kind {
                CloseKind::TakeProfit => ExitType::TakeProfit,
                CloseKind::StopLoss => ExitType::StopLoss,
                CloseKind::Liquidation => ExitType::Liquidation,
                CloseKind::ManualClose => ExitType::Manual,
            },
            price: exit_price,
            pnl,
            pnl_pct,
            duration_min: record.minutes_open(Utc::now()),
            time: Utc::now().timestamp_millis(),
        };
        if let Err(e) = self
            .history
            .record_close(&record.symbol, &record.trade_id, exit)
            .await
        {
            warn!("history close record failed: {e}");
        }
    }

    /// Step C: open a new position when flat and the verdict says so.
    async fn maybe_open(&self, analysis: &Analysis) -> Result<(), VenueError> {
        let side = match analysis.verdict.decision {
            Decision::Buy => Side::Buy,
            Decision::Sell => Side::Sell,
            Decision::Hold => return Ok(()),
        };
        if !self.cfg.trading.auto_trading {
            debug!("auto-trading disabled, signal not executed");
            return Ok(());
        }

        let instrument = self.venue.instrument(&self.cfg.symbol).await?;
        let balance = self.venue.balance().await?;
        let price = analysis.snapshot.price;

        let leverage = entry::compute_leverage(
            &analysis.verdict,
            &analysis.kalman,
            &analysis.indicators,
            price,
            self.cfg.trading.scalp_leverage_cap,
        );
        let quantity = entry::compute_quantity(
            balance.available,
            leverage,
            price,
            self.cfg.trading.risk_pct,
            &instrument,
        );
        let (stop_loss, take_profit) = entry::compute_sl_tp(
            side,
            price,
            self.cfg.trading.stop_loss_pct,
            analysis.verdict.confidence,
        );

        let mut proposal = TradeProposal {
            symbol: self.cfg.symbol.clone(),
            side,
            quantity,
            leverage,
            stop_loss: Some(stop_loss),
            take_profit: Some(take_profit),
        };

        // Exposure across all symbols feeds the gate.
        let existing_exposure: f64 = self
            .venue
            .positions(None)
            .await
            .unwrap_or_default()
            .iter()
            .map(|p| p.entry_price * p.size)
            .sum();
        let risk_ctx = RiskContext {
            price,
            total_balance: balance.total,
            existing_exposure,
            volatility: analysis.volatility,
            qty_step: instrument.qty_step,
        };

        let mut verdict = self.risk.validate(&proposal, &risk_ctx);
        if !verdict.approved {
            if let Some(adjusted) = verdict.adjusted.take() {
                // One retry with the downsized proposal.
                let retry = self.risk.validate(&adjusted, &risk_ctx);
                if retry.approved {
                    info!(
                        original_qty = proposal.quantity,
                        adjusted_qty = adjusted.quantity,
                        "risk gate downsized order"
                    );
                    proposal = adjusted;
                } else {
                    events::risk_event(
                        "REJECT",
                        &retry
                            .reason
                            .map(|r| r.to_string())
                            .unwrap_or_else(|| "adjusted proposal rejected".into()),
                    );
                    return Ok(());
                }
            } else {
                events::risk_event(
                    "REJECT",
                    &verdict
                        .reason
                        .map(|r| r.to_string())
                        .unwrap_or_else(|| "rejected".into()),
                );
                return Ok(());
            }
        }

        let started = Instant::now();
        let result = match self.venue.submit_order(&proposal).await {
            Ok(result) => result,
            Err(e) => {
                events::system_error("venue", &format!("order submit failed: {e}"));
                self.metrics.record_error();
                return Ok(());
            }
        };
        self.metrics.observe_execution(started.elapsed().as_secs_f64());

        let fill_price = if result.avg_price > 0.0 { result.avg_price } else { price };
        let record = crate::history::open_record(
            side,
            analysis.verdict.confidence,
            EntryDetail {
                price: fill_price,
                rsi: analysis.indicators.rsi,
                macd_hist: analysis.indicators.macd.histogram,
                kalman_trend: analysis.kalman.trend,
                leverage,
                qty: proposal.quantity,
            },
        );
        let trade_id = match self.history.record_open(&self.cfg.symbol, record).await {
            Ok(id) => id,
            Err(e) => {
                warn!("history open record failed: {e}");
                String::new()
            }
        };

        self.tracking.lock().expect("tracking map poisoned").insert(
            self.cfg.symbol.clone(),
            TrackingRecord::new(
                self.cfg.symbol.clone(),
                side,
                fill_price,
                Some(stop_loss),
                trade_id.clone(),
            ),
        );
        self.risk.increment_daily();
        self.metrics.record_trade_open();
        events::trade_open(
            &self.cfg.symbol,
            side,
            proposal.quantity,
            fill_price,
            leverage,
            &trade_id,
        );
        Ok(())
    }

    /// Refresh the gauge snapshot after a tick.
    async fn publish_gauges(&self, analysis: &Analysis) {
        let (open_positions, position_pnl_pct, unrealised) = {
            match self.venue.positions(Some(&self.cfg.symbol)).await {
                Ok(positions) => {
                    let count = positions.len() as u32;
                    let pnl_pct = positions.first().map(|p| p.pnl_pct).unwrap_or(0.0);
                    let unrealised: f64 = positions.iter().map(|p| p.unrealised_pnl).sum();
                    (count, pnl_pct, unrealised)
                }
                Err(_) => (0, 0.0, 0.0),
            }
        };
        let balance_total = self
            .venue
            .balance()
            .await
            .map(|b| b.total)
            .unwrap_or_default();
        let (win_rate, realised) = match self.history.context(&self.cfg.symbol).await {
            Ok(ctx) => (ctx.global.win_rate(), ctx.global.pnl),
            Err(_) => (0.0, 0.0),
        };
        self.metrics.set_gauges(GaugeState {
            balance_total,
            realised_pnl: realised,
            unrealised_pnl: unrealised,
            win_rate,
            open_positions,
            position_pnl_pct,
            ai_confidence: analysis.verdict.confidence,
            kalman_confidence: analysis.kalman.confidence,
            rsi: analysis.indicators.rsi,
            macd_line: analysis.indicators.macd.line,
            macd_signal: analysis.indicators.macd.signal,
            macd_histogram: analysis.indicators.macd.histogram,
            venue_healthy: true,
            reasoning_healthy: true,
        });
    }
}

#[cfg(test)]
mod tests;
