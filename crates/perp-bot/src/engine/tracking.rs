//! In-memory per-position bookkeeping for the management policy.
//!
//! Created on a confirmed open (or adopted when a position is found with no
//! record, e.g. after a restart), destroyed on full close. Owned by the
//! engine; no other task touches it.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use perp_common::Side;

use crate::venue::types::PositionSnapshot;

/// Profit-ladder rungs in tenths of a percent (0.3% / 0.6% / 1.0%).
pub const LADDER_LEVELS: [u32; 3] = [30, 60, 100];

/// Bookkeeping for one open position.
#[derive(Debug, Clone)]
pub struct TrackingRecord {
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
    /// Best price seen while long.
    pub max_price_seen: f64,
    /// Best price seen while short.
    pub min_price_seen: f64,
    pub trailing_active: bool,
    /// Ladder rungs already fired, to avoid re-firing.
    pub profit_ladder_fired: BTreeSet<u32>,
    /// Watermark for the TP/SL order-history scan (unix millis).
    pub last_order_check_time: i64,
    /// The stop currently resting at the venue (entry-based initially).
    pub current_stop: Option<f64>,
    /// History-store id of the open record.
    pub trade_id: String,
}

impl TrackingRecord {
    pub fn new(
        symbol: impl Into<String>,
        side: Side,
        entry_price: f64,
        initial_stop: Option<f64>,
        trade_id: impl Into<String>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            entry_price,
            entry_time: Utc::now(),
            max_price_seen: entry_price,
            min_price_seen: entry_price,
            trailing_active: false,
            profit_ladder_fired: BTreeSet::new(),
            last_order_check_time: Utc::now().timestamp_millis(),
            current_stop: initial_stop,
            trade_id: trade_id.into(),
        }
    }

    /// Adopt a position discovered at the venue without a local record.
    pub fn adopt(position: &PositionSnapshot, initial_stop: Option<f64>) -> Self {
        let mut record = Self::new(
            position.symbol.clone(),
            position.side,
            position.entry_price,
            initial_stop,
            String::new(),
        );
        record.max_price_seen = position.current_price.max(position.entry_price);
        record.min_price_seen = position.current_price.min(position.entry_price);
        record
    }

    /// Fold a fresh price into the extremes.
    pub fn observe_price(&mut self, price: f64) {
        if price > self.max_price_seen {
            self.max_price_seen = price;
        }
        if price < self.min_price_seen {
            self.min_price_seen = price;
        }
    }

    pub fn hours_open(&self, now: DateTime<Utc>) -> f64 {
        (now - self.entry_time).num_seconds() as f64 / 3_600.0
    }

    pub fn minutes_open(&self, now: DateTime<Utc>) -> f64 {
        (now - self.entry_time).num_seconds() as f64 / 60.0
    }

    /// Highest unfired ladder rung at or below `pnl_tenths_pct`.
    pub fn next_ladder_rung(&self, pnl_pct: f64) -> Option<u32> {
        let tenths = (pnl_pct * 100.0).round() as i64;
        LADDER_LEVELS
            .iter()
            .rev()
            .copied()
            .find(|level| tenths >= *level as i64 && !self.profit_ladder_fired.contains(level))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> TrackingRecord {
        TrackingRecord::new("BTCUSDT", Side::Buy, 50_000.0, Some(49_700.0), "t1")
    }

    #[test]
    fn extremes_are_monotonic() {
        let mut r = record();
        r.observe_price(50_400.0);
        r.observe_price(50_100.0);
        assert_eq!(r.max_price_seen, 50_400.0);
        r.observe_price(49_900.0);
        assert_eq!(r.min_price_seen, 49_900.0);
        assert_eq!(r.max_price_seen, 50_400.0);
    }

    #[test]
    fn ladder_rung_selection_and_no_refire() {
        let mut r = record();
        assert_eq!(r.next_ladder_rung(0.29), None);
        assert_eq!(r.next_ladder_rung(0.30), Some(30));
        r.profit_ladder_fired.insert(30);
        // Same PnL, already fired: nothing.
        assert_eq!(r.next_ladder_rung(0.30), None);
        // Jumping over 0.6 to 1.1 fires the highest rung first.
        assert_eq!(r.next_ladder_rung(1.1), Some(100));
        r.profit_ladder_fired.insert(100);
        assert_eq!(r.next_ladder_rung(1.1), Some(60));
    }

    #[test]
    fn adoption_uses_venue_prices() {
        let position = PositionSnapshot {
            symbol: "BTCUSDT".into(),
            side: Side::Sell,
            size: 0.1,
            entry_price: 50_000.0,
            current_price: 49_500.0,
            unrealised_pnl: 50.0,
            pnl_pct: 1.0,
            leverage: 10.0,
            timestamp: 0,
        };
        let r = TrackingRecord::adopt(&position, None);
        assert_eq!(r.min_price_seen, 49_500.0);
        assert_eq!(r.max_price_seen, 50_000.0);
        assert!(r.trade_id.is_empty());
    }
}
