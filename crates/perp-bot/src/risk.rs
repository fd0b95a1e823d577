//! Pre-trade risk gate.
//!
//! All checks run before order submission. Hard failures short-circuit;
//! an oversized-but-otherwise-valid proposal comes back with a downsized
//! `adjusted` copy so the orchestrator can retry within the same tick.
//! The daily trade counter lives here and resets on local-calendar day
//! change; the orchestrator calls `increment_daily` only after a
//! confirmed open.

use std::sync::Mutex;

use chrono::{Local, NaiveDate};
use perp_common::floor_to_step;
use serde::Serialize;

use crate::config::TradingConfig;
use crate::venue::types::TradeProposal;

/// Fraction of total balance a single order's notional may use before the
/// gate downsizes it.
const MAX_NOTIONAL_BALANCE_FRACTION: f64 = 0.30;
/// Tolerance on the configured stop-loss distance.
const SL_DISTANCE_SLACK: f64 = 1.05;
/// Composite risk score above which the proposal is rejected outright.
const MAX_RISK_SCORE: f64 = 0.8;

/// Market/account context the gate evaluates a proposal against.
#[derive(Debug, Clone, Copy)]
pub struct RiskContext {
    pub price: f64,
    pub total_balance: f64,
    /// Notional of positions already open (quote currency).
    pub existing_exposure: f64,
    /// Per-interval volatility of returns, clamped into [0, 1] for scoring.
    pub volatility: f64,
    /// Instrument quantity step, used when downsizing.
    pub qty_step: f64,
}

/// Why the gate refused a proposal.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum RiskRejection {
    DailyLimitReached { used: u32, max: u32 },
    InvalidQuantity { qty: f64 },
    LeverageExceeded { requested: u32, max: u32 },
    ExposureExceeded { notional: f64, existing: f64, max: f64 },
    StopLossTooWide { distance_pct: f64, max_pct: f64 },
    ScoreTooHigh { score: f64 },
}

impl RiskRejection {
    /// Short code for logs and metrics labels.
    pub fn code(&self) -> &'static str {
        match self {
            RiskRejection::DailyLimitReached { .. } => "DAILY_LIMIT",
            RiskRejection::InvalidQuantity { .. } => "BAD_QTY",
            RiskRejection::LeverageExceeded { .. } => "LEVERAGE",
            RiskRejection::ExposureExceeded { .. } => "EXPOSURE",
            RiskRejection::StopLossTooWide { .. } => "SL_DISTANCE",
            RiskRejection::ScoreTooHigh { .. } => "RISK_SCORE",
        }
    }
}

impl std::fmt::Display for RiskRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskRejection::DailyLimitReached { used, max } => {
                write!(f, "daily trade limit reached ({used}/{max})")
            }
            RiskRejection::InvalidQuantity { qty } => write!(f, "invalid quantity {qty}"),
            RiskRejection::LeverageExceeded { requested, max } => {
                write!(f, "leverage {requested}x exceeds cap {max}x")
            }
            RiskRejection::ExposureExceeded {
                notional,
                existing,
                max,
            } => write!(
                f,
                "exposure limit: {notional:.2} + {existing:.2} existing > {max:.2}"
            ),
            RiskRejection::StopLossTooWide {
                distance_pct,
                max_pct,
            } => write!(f, "stop-loss {distance_pct:.2}% wider than {max_pct:.2}%"),
            RiskRejection::ScoreTooHigh { score } => {
                write!(f, "composite risk score {score:.2} above limit")
            }
        }
    }
}

/// Outcome of `validate`.
#[derive(Debug, Clone, Serialize)]
pub struct RiskVerdict {
    pub approved: bool,
    pub reason: Option<RiskRejection>,
    /// Composite soft score in [0, 1] (populated on full evaluation).
    pub risk_score: f64,
    /// Downsized proposal when the only problem was order size.
    pub adjusted: Option<TradeProposal>,
}

impl RiskVerdict {
    fn reject(reason: RiskRejection) -> Self {
        Self {
            approved: false,
            reason: Some(reason),
            risk_score: 1.0,
            adjusted: None,
        }
    }
}

struct DailyCounter {
    date: NaiveDate,
    count: u32,
}

/// The gate. One per engine; owns the daily counter.
pub struct RiskGate {
    cfg: TradingConfig,
    daily: Mutex<DailyCounter>,
}

impl RiskGate {
    pub fn new(cfg: TradingConfig) -> Self {
        Self {
            cfg,
            daily: Mutex::new(DailyCounter {
                date: Local::now().date_naive(),
                count: 0,
            }),
        }
    }

    /// Confirmed opens today (after any day-boundary reset).
    pub fn daily_count(&self) -> u32 {
        let mut daily = self.daily.lock().expect("daily counter poisoned");
        let today = Local::now().date_naive();
        if daily.date != today {
            daily.date = today;
            daily.count = 0;
        }
        daily.count
    }

    /// Called by the orchestrator after a confirmed open.
    pub fn increment_daily(&self) {
        let mut daily = self.daily.lock().expect("daily counter poisoned");
        let today = Local::now().date_naive();
        if daily.date != today {
            daily.date = today;
            daily.count = 0;
        }
        daily.count += 1;
    }

    /// Run the ordered checks against a proposal.
    pub fn validate(&self, proposal: &TradeProposal, ctx: &RiskContext) -> RiskVerdict {
        // 1. Daily count (with day rollover).
        let used = self.daily_count();
        if used >= self.cfg.max_daily_trades {
            return RiskVerdict::reject(RiskRejection::DailyLimitReached {
                used,
                max: self.cfg.max_daily_trades,
            });
        }

        // 2. Quantity sanity.
        if !(proposal.quantity.is_finite() && proposal.quantity > 0.0) {
            return RiskVerdict::reject(RiskRejection::InvalidQuantity {
                qty: proposal.quantity,
            });
        }

        // 3. Balance-relative order size; downsize instead of rejecting.
        let notional = proposal.quantity * ctx.price;
        let notional_cap = ctx.total_balance * MAX_NOTIONAL_BALANCE_FRACTION;
        if notional > notional_cap && ctx.price > 0.0 {
            let mut adjusted = proposal.clone();
            adjusted.quantity = floor_to_step(notional_cap / ctx.price, ctx.qty_step);
            return RiskVerdict {
                approved: false,
                reason: None,
                risk_score: 0.0,
                adjusted: Some(adjusted),
            };
        }

        // 4. Leverage cap.
        if proposal.leverage > self.cfg.max_leverage {
            return RiskVerdict::reject(RiskRejection::LeverageExceeded {
                requested: proposal.leverage,
                max: self.cfg.max_leverage,
            });
        }

        // 5. Total exposure cap.
        if notional + ctx.existing_exposure > self.cfg.max_position_size {
            return RiskVerdict::reject(RiskRejection::ExposureExceeded {
                notional,
                existing: ctx.existing_exposure,
                max: self.cfg.max_position_size,
            });
        }

        // 6. Stop-loss distance.
        if let Some(sl) = proposal.stop_loss {
            if ctx.price > 0.0 {
                let distance_pct = (ctx.price - sl).abs() / ctx.price * 100.0;
                let max_pct = self.cfg.stop_loss_pct * SL_DISTANCE_SLACK;
                if distance_pct > max_pct {
                    return RiskVerdict::reject(RiskRejection::StopLossTooWide {
                        distance_pct,
                        max_pct,
                    });
                }
            }
        }

        // 7. Composite soft score.
        let balance = ctx.total_balance.max(f64::EPSILON);
        let score = (proposal.leverage as f64 / self.cfg.max_leverage as f64) * 0.3
            + (notional / balance).clamp(0.0, 1.0) * 0.2
            + (ctx.existing_exposure / balance).clamp(0.0, 1.0) * 0.2
            + ctx.volatility.clamp(0.0, 1.0) * 0.3;
        if score > MAX_RISK_SCORE {
            return RiskVerdict::reject(RiskRejection::ScoreTooHigh { score });
        }

        RiskVerdict {
            approved: true,
            reason: None,
            risk_score: score,
            adjusted: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use perp_common::Side;

    fn trading_config() -> TradingConfig {
        TradingConfig {
            auto_trading: true,
            paper_trading: true,
            max_leverage: 50,
            scalp_leverage_cap: 20,
            max_position_size: 10_000.0,
            risk_pct: 10.0,
            stop_loss_pct: 0.6,
            max_daily_trades: 10,
            macd_ema_signal: false,
        }
    }

    fn proposal(qty: f64, leverage: u32) -> TradeProposal {
        TradeProposal {
            symbol: "BTCUSDT".into(),
            side: Side::Buy,
            quantity: qty,
            leverage,
            stop_loss: Some(49_700.0),
            take_profit: Some(50_570.0),
        }
    }

    fn ctx() -> RiskContext {
        RiskContext {
            price: 50_000.0,
            total_balance: 10_000.0,
            existing_exposure: 0.0,
            volatility: 0.01,
            qty_step: 0.001,
        }
    }

    #[test]
    fn valid_proposal_passes_with_score() {
        let gate = RiskGate::new(trading_config());
        let verdict = gate.validate(&proposal(0.05, 10), &ctx());
        assert!(verdict.approved, "{:?}", verdict.reason);
        assert!((0.0..=1.0).contains(&verdict.risk_score));
    }

    #[test]
    fn notional_exactly_at_thirty_pct_is_approved() {
        let gate = RiskGate::new(trading_config());
        // 0.060 * 50000 = 3000 = 0.30 * 10000 exactly.
        let verdict = gate.validate(&proposal(0.060, 10), &ctx());
        assert!(verdict.approved);
        assert!(verdict.adjusted.is_none());
    }

    #[test]
    fn oversized_notional_is_adjusted_downward() {
        let gate = RiskGate::new(trading_config());
        // qty 1.0 at 50000 => notional 50000 > 3000.
        let verdict = gate.validate(&proposal(1.0, 10), &ctx());
        assert!(!verdict.approved);
        assert!(verdict.reason.is_none());
        let adjusted = verdict.adjusted.expect("adjusted proposal");
        assert_eq!(adjusted.quantity, 0.060);
        // The adjusted proposal passes on retry.
        let retry = gate.validate(&adjusted, &ctx());
        assert!(retry.approved);
    }

    #[test]
    fn epsilon_over_the_cap_is_adjusted() {
        let gate = RiskGate::new(trading_config());
        let verdict = gate.validate(&proposal(0.0601, 10), &ctx());
        assert!(!verdict.approved);
        assert_eq!(verdict.adjusted.unwrap().quantity, 0.060);
    }

    #[test]
    fn bad_quantities_reject() {
        let gate = RiskGate::new(trading_config());
        for qty in [0.0, -1.0, f64::NAN] {
            let verdict = gate.validate(&proposal(qty, 10), &ctx());
            assert!(!verdict.approved);
            assert_eq!(verdict.reason.as_ref().unwrap().code(), "BAD_QTY");
        }
    }

    #[test]
    fn leverage_above_cap_rejects() {
        let gate = RiskGate::new(trading_config());
        let verdict = gate.validate(&proposal(0.01, 51), &ctx());
        assert_eq!(verdict.reason.unwrap().code(), "LEVERAGE");
    }

    #[test]
    fn exposure_cap_counts_existing_positions() {
        let gate = RiskGate::new(trading_config());
        let mut context = ctx();
        context.existing_exposure = 9_000.0;
        // 0.04 * 50000 = 2000; 2000 + 9000 > 10000.
        let verdict = gate.validate(&proposal(0.04, 10), &context);
        assert_eq!(verdict.reason.unwrap().code(), "EXPOSURE");
    }

    #[test]
    fn wide_stop_loss_rejects() {
        let gate = RiskGate::new(trading_config());
        let mut p = proposal(0.01, 10);
        p.stop_loss = Some(49_000.0); // 2% away, cap is 0.63%
        let verdict = gate.validate(&p, &ctx());
        assert_eq!(verdict.reason.unwrap().code(), "SL_DISTANCE");
    }

    #[test]
    fn stop_loss_within_slack_passes() {
        let gate = RiskGate::new(trading_config());
        let mut p = proposal(0.01, 10);
        p.stop_loss = Some(50_000.0 * (1.0 - 0.0062)); // 0.62% < 0.63%
        assert!(gate.validate(&p, &ctx()).approved);
    }

    #[test]
    fn high_volatility_drives_score_rejection() {
        let mut cfg = trading_config();
        cfg.max_position_size = 50_000.0;
        let gate = RiskGate::new(cfg);
        let mut context = ctx();
        context.volatility = 1.0;
        context.existing_exposure = 9_000.0;
        // 0.3 (leverage) + 0.058 (notional) + 0.18 (exposure) + 0.3 (vol)
        let verdict = gate.validate(&proposal(0.058, 50), &context);
        assert_eq!(verdict.reason.unwrap().code(), "RISK_SCORE");
    }

    #[test]
    fn daily_counter_enforced_and_incremented_explicitly() {
        let mut cfg = trading_config();
        cfg.max_daily_trades = 2;
        let gate = RiskGate::new(cfg);

        assert!(gate.validate(&proposal(0.01, 10), &ctx()).approved);
        // Validation alone does not consume the budget.
        assert_eq!(gate.daily_count(), 0);

        gate.increment_daily();
        gate.increment_daily();
        let verdict = gate.validate(&proposal(0.01, 10), &ctx());
        assert_eq!(verdict.reason.unwrap().code(), "DAILY_LIMIT");
    }
}
