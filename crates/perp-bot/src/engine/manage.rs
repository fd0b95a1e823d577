//! Position-management policy pieces: trailing stop arithmetic and the
//! backup exit rules evaluated when the reasoning verdict says HOLD.
//!
//! Pure functions over the tick's analysis and the tracking record; the
//! orchestrator applies whatever they decide.

use perp_common::Side;

use crate::indicators::TechnicalIndicators;
use crate::reasoning::{Decision, EntryVerdict};

use super::tracking::TrackingRecord;

/// PnL% at which the trailing stop arms.
pub const TRAILING_ACTIVATION_PNL_PCT: f64 = 0.5;
/// Trailing distance off the best-seen price.
pub const TRAILING_DISTANCE: f64 = 0.003;
/// Staleness exit: older than this with PnL below the floor.
const STALE_HOURS: f64 = 2.0;
const STALE_PNL_PCT: f64 = 0.3;
/// Volume-ratio spike treated as a volatility event.
const VOLUME_SPIKE_RATIO: f64 = 5.0;
/// AI reversal requires at least this much confidence.
const REVERSAL_CONFIDENCE: f64 = 0.7;

/// A triggered backup exit with its close percentage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BackupExit {
    AiReversal { confidence: f64 },
    Staleness,
    VolatilitySpike,
    ProfitLadder { level: u32 },
    TechnicalReversal,
}

impl BackupExit {
    /// Percentage of the position this rule closes.
    pub fn close_pct(&self) -> u8 {
        match self {
            BackupExit::AiReversal { .. } => 100,
            BackupExit::Staleness => 100,
            BackupExit::VolatilitySpike => 50,
            BackupExit::ProfitLadder { level } => match level {
                30 => 25,
                60 => 50,
                _ => 100,
            },
            BackupExit::TechnicalReversal => 50,
        }
    }

    /// Priority score; the highest triggered rule wins.
    pub fn score(&self) -> f64 {
        match self {
            BackupExit::AiReversal { confidence } => *confidence,
            BackupExit::Staleness => 0.68,
            BackupExit::ProfitLadder { .. } => 0.65,
            BackupExit::VolatilitySpike => 0.60,
            BackupExit::TechnicalReversal => 0.55,
        }
    }

    /// Tag for TRADE_CLOSE `executedBy` and logs.
    pub fn tag(&self) -> String {
        match self {
            BackupExit::AiReversal { .. } => "AI_REVERSAL".to_string(),
            BackupExit::Staleness => "STALE_POSITION".to_string(),
            BackupExit::VolatilitySpike => "VOLATILITY_SPIKE".to_string(),
            BackupExit::ProfitLadder { level } => format!("PROFIT_LADDER_{level}"),
            BackupExit::TechnicalReversal => "TECHNICAL_REVERSAL".to_string(),
        }
    }
}

/// Evaluate the backup exit rules and return the highest-scoring trigger.
pub fn evaluate_backup_exits(
    tracking: &TrackingRecord,
    pnl_pct: f64,
    hours_open: f64,
    entry_verdict: &EntryVerdict,
    indicators: &TechnicalIndicators,
) -> Option<BackupExit> {
    let mut triggered: Vec<BackupExit> = Vec::new();

    // (a) AI reversal: confident entry signal against the open side.
    let opposite = match tracking.side {
        Side::Buy => Decision::Sell,
        Side::Sell => Decision::Buy,
    };
    if entry_verdict.decision == opposite && entry_verdict.confidence > REVERSAL_CONFIDENCE {
        triggered.push(BackupExit::AiReversal {
            confidence: entry_verdict.confidence,
        });
    }

    // (b) Staleness: capital parked without progress.
    if hours_open > STALE_HOURS && pnl_pct < STALE_PNL_PCT {
        triggered.push(BackupExit::Staleness);
    }

    // (c) Volatility spike.
    if indicators.volume.ratio > VOLUME_SPIKE_RATIO {
        triggered.push(BackupExit::VolatilitySpike);
    }

    // (d) Profit ladder, first crossing only.
    if let Some(level) = tracking.next_ladder_rung(pnl_pct) {
        triggered.push(BackupExit::ProfitLadder { level });
    }

    // (e) Technical reversal conditioned on the side.
    let technical = match tracking.side {
        Side::Buy => indicators.rsi > 70.0 && indicators.macd.histogram < 0.0,
        Side::Sell => indicators.rsi < 30.0 && indicators.macd.histogram > 0.0,
    };
    if technical {
        triggered.push(BackupExit::TechnicalReversal);
    }

    triggered
        .into_iter()
        .max_by(|a, b| a.score().total_cmp(&b.score()))
}

/// Candidate trailing stop from the best-seen price, or `None` while the
/// stop should not move.
///
/// The stop only ever ratchets: a candidate that does not strictly improve
/// on the currently resting stop (or moves against the position) is
/// discarded.
pub fn trailing_stop_candidate(tracking: &TrackingRecord, pnl_pct: f64) -> Option<f64> {
    if !tracking.trailing_active && pnl_pct < TRAILING_ACTIVATION_PNL_PCT {
        return None;
    }
    let candidate = match tracking.side {
        Side::Buy => tracking.max_price_seen * (1.0 - TRAILING_DISTANCE),
        Side::Sell => tracking.min_price_seen * (1.0 + TRAILING_DISTANCE),
    };
    match (tracking.side, tracking.current_stop) {
        (Side::Buy, Some(current)) if candidate <= current => None,
        (Side::Sell, Some(current)) if candidate >= current => None,
        _ => Some(candidate),
    }
}
