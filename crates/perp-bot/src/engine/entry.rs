//! Entry sizing: leverage bonuses, quantity, stop-loss and take-profit.
//!
//! Pure functions; the orchestrator feeds them the composite analysis and
//! submits the resulting proposal to the risk gate.

use perp_common::{floor_to_step, Side};

use crate::indicators::TechnicalIndicators;
use crate::kalman::KalmanPrediction;
use crate::reasoning::EntryVerdict;
use crate::venue::types::InstrumentInfo;

/// Base leverage before bonuses.
const BASE_LEVERAGE: f64 = 5.0;
/// Take-profit distance multiplier: 1.5 + 0.5·confidence times the SL gap.
const TP_BASE_MULT: f64 = 1.5;
const TP_CONFIDENCE_MULT: f64 = 0.5;

/// Compute entry leverage from signal strength, clipped to `cap`.
///
/// Bonuses: the model's suggested leverage scaled by its confidence band,
/// Kalman confidence, RSI extremes, MACD magnitude and elevated volume.
pub fn compute_leverage(
    verdict: &EntryVerdict,
    kalman: &KalmanPrediction,
    indicators: &TechnicalIndicators,
    price: f64,
    cap: u32,
) -> u32 {
    let mut leverage = BASE_LEVERAGE;

    // AI confidence bands: full suggestion at >= 0.8, half at >= 0.6.
    if verdict.confidence >= 0.8 {
        leverage += verdict.suggested_leverage as f64;
    } else if verdict.confidence >= 0.6 {
        leverage += verdict.suggested_leverage as f64 / 2.0;
    }

    // Kalman confidence bands.
    if kalman.confidence >= 0.8 {
        leverage += 5.0;
    } else if kalman.confidence >= 0.6 {
        leverage += 3.0;
    }

    // RSI extremes support conviction either way.
    if indicators.rsi < 25.0 || indicators.rsi > 75.0 {
        leverage += 3.0;
    }

    // MACD histogram magnitude relative to price.
    if price > 0.0 && (indicators.macd.histogram / price).abs() > 0.001 {
        leverage += 2.0;
    }

    // Elevated volume.
    if indicators.volume.ratio > 2.0 {
        leverage += 2.0;
    }

    (leverage.round() as u32).clamp(1, cap.max(1))
}

/// Compute order quantity from available balance and leverage.
///
/// `risk_pct = min(configured, leverage / 3)`; the notional is the risked
/// capital times leverage, floored to the instrument step and raised to the
/// minimum order quantity when it rounds below it.
pub fn compute_quantity(
    available_balance: f64,
    leverage: u32,
    price: f64,
    max_risk_pct: f64,
    instrument: &InstrumentInfo,
) -> f64 {
    if price <= 0.0 || available_balance <= 0.0 {
        return 0.0;
    }
    let risk_pct = (leverage as f64 / 3.0).min(max_risk_pct);
    let capital_at_risk = available_balance * risk_pct / 100.0;
    let notional = capital_at_risk * leverage as f64;
    let qty = floor_to_step(notional / price, instrument.qty_step);
    if qty < instrument.min_order_qty {
        instrument.min_order_qty
    } else {
        qty
    }
}

/// Entry-based stop-loss and confidence-scaled take-profit.
pub fn compute_sl_tp(side: Side, entry: f64, stop_loss_pct: f64, confidence: f64) -> (f64, f64) {
    let distance = entry * stop_loss_pct / 100.0;
    let tp_mult = TP_BASE_MULT + TP_CONFIDENCE_MULT * confidence;
    match side {
        Side::Buy => (entry - distance, entry + distance * tp_mult),
        Side::Sell => (entry + distance, entry - distance * tp_mult),
    }
}
