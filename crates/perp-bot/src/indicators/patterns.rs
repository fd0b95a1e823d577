//! Short-window candle patterns, order-book pressure, and the
//! multi-timeframe trend comparison exposed through the tools server.

use perp_common::{Candle, Trend};
use serde::Serialize;

use crate::venue::types::OrderBook;

/// Body-to-range threshold below which a candle counts as a doji.
const DOJI_BODY_RATIO: f64 = 0.1;
/// Volume spike multiple over the trailing mean.
const VOLUME_SPIKE_MULT: f64 = 3.0;
/// Order-book wall multiple over the side average.
const WALL_MULT: f64 = 3.0;

/// Fixed-shape candle pattern report over a short window.
#[derive(Debug, Clone, Serialize, Default)]
pub struct CandlePatternReport {
    /// Three consecutive bullish bodies.
    pub three_green_soldiers: bool,
    /// Three consecutive bearish bodies.
    pub three_red_soldiers: bool,
    /// Monotonically decreasing body sizes over the last three candles.
    pub momentum_weakening: bool,
    /// Last volume > 3× trailing mean.
    pub volume_spike: bool,
    /// Last candle body/range < 0.1.
    pub doji: bool,
}

/// Detect the short-window patterns on the last candles of `candles`.
pub fn analyze_candle_patterns(candles: &[Candle]) -> CandlePatternReport {
    let mut report = CandlePatternReport::default();
    let n = candles.len();
    if n >= 3 {
        let last3 = &candles[n - 3..];
        report.three_green_soldiers = last3.iter().all(|c| c.body() > 0.0);
        report.three_red_soldiers = last3.iter().all(|c| c.body() < 0.0);
        let bodies: Vec<f64> = last3.iter().map(|c| c.body().abs()).collect();
        report.momentum_weakening = bodies[0] > bodies[1] && bodies[1] > bodies[2];
    }
    if n >= 2 {
        let trailing = &candles[..n - 1];
        let mean = trailing.iter().map(|c| c.volume).sum::<f64>() / trailing.len() as f64;
        let current = candles[n - 1].volume;
        report.volume_spike = mean > 0.0 && current > VOLUME_SPIKE_MULT * mean;
    }
    if let Some(last) = candles.last() {
        let range = last.range();
        report.doji = range > 0.0 && (last.body().abs() / range) < DOJI_BODY_RATIO;
    }
    report
}

/// Aggregate order-book pressure classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Pressure {
    Bullish,
    Bearish,
    Neutral,
}

/// Order-book pressure summary.
#[derive(Debug, Clone, Serialize)]
pub struct OrderBookPressure {
    pub spread: f64,
    pub spread_pct: f64,
    /// total bid qty / total ask qty; 1.0 when either side is empty.
    pub imbalance: f64,
    /// Bid levels whose quantity exceeds 3× the bid-side average.
    pub bid_walls: Vec<f64>,
    /// Ask levels whose quantity exceeds 3× the ask-side average.
    pub ask_walls: Vec<f64>,
    pub pressure: Pressure,
}

/// Compute spread, imbalance, walls and the pressure label from a book.
///
/// Imbalance > 1.5 ⇒ bullish, < 0.67 ⇒ bearish, otherwise neutral.
pub fn order_book_pressure(book: &OrderBook) -> OrderBookPressure {
    let best_bid = book.bids.first().map(|l| l.price).unwrap_or(0.0);
    let best_ask = book.asks.first().map(|l| l.price).unwrap_or(0.0);
    let spread = (best_ask - best_bid).max(0.0);
    let mid = (best_ask + best_bid) / 2.0;
    let spread_pct = if mid > 0.0 { spread / mid * 100.0 } else { 0.0 };

    let bid_total: f64 = book.bids.iter().map(|l| l.qty).sum();
    let ask_total: f64 = book.asks.iter().map(|l| l.qty).sum();
    let imbalance = if bid_total > 0.0 && ask_total > 0.0 {
        bid_total / ask_total
    } else {
        1.0
    };

    let bid_avg = if book.bids.is_empty() {
        0.0
    } else {
        bid_total / book.bids.len() as f64
    };
    let ask_avg = if book.asks.is_empty() {
        0.0
    } else {
        ask_total / book.asks.len() as f64
    };
    let bid_walls = book
        .bids
        .iter()
        .filter(|l| bid_avg > 0.0 && l.qty > WALL_MULT * bid_avg)
        .map(|l| l.price)
        .collect();
    let ask_walls = book
        .asks
        .iter()
        .filter(|l| ask_avg > 0.0 && l.qty > WALL_MULT * ask_avg)
        .map(|l| l.price)
        .collect();

    let pressure = if imbalance > 1.5 {
        Pressure::Bullish
    } else if imbalance < 0.67 {
        Pressure::Bearish
    } else {
        Pressure::Neutral
    };

    OrderBookPressure {
        spread,
        spread_pct,
        imbalance,
        bid_walls,
        ask_walls,
        pressure,
    }
}

/// Multi-timeframe trend comparison.
#[derive(Debug, Clone, Serialize)]
pub struct TrendComparison {
    pub macro_trend: Trend,
    pub micro_trend: Trend,
    /// True when macro and micro trends point in opposite directions.
    pub divergence: bool,
    /// Suggested action tag for the supervisor.
    pub suggestion: &'static str,
}

/// Compare the macro trend (last 20 coarse candles, ±0.2% dead zone) with
/// the micro trend (last 10 fine candles, ±0.1% dead zone).
pub fn micro_trend(coarse: &[Candle], fine: &[Candle]) -> TrendComparison {
    let macro_trend = fractional_trend(coarse, 20, 0.002);
    let micro = fractional_trend(fine, 10, 0.001);
    let divergence = matches!(
        (macro_trend, micro),
        (Trend::Bullish, Trend::Bearish) | (Trend::Bearish, Trend::Bullish)
    );
    let suggestion = match (macro_trend, micro) {
        (Trend::Bullish, Trend::Bullish) => "long_continuation",
        (Trend::Bearish, Trend::Bearish) => "short_continuation",
        _ if divergence => "scalp_reversal",
        _ => "wait",
    };
    TrendComparison {
        macro_trend,
        micro_trend: micro,
        divergence,
        suggestion,
    }
}

fn fractional_trend(candles: &[Candle], lookback: usize, threshold: f64) -> Trend {
    if candles.len() < 2 {
        return Trend::Neutral;
    }
    let window = &candles[candles.len().saturating_sub(lookback)..];
    let first = window.first().map(|c| c.close).unwrap_or(0.0);
    let last = window.last().map(|c| c.close).unwrap_or(0.0);
    if first <= 0.0 {
        return Trend::Neutral;
    }
    Trend::from_signed(last / first - 1.0, threshold)
}
