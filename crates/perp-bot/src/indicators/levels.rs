//! Support/resistance levels and volatility.

use perp_common::{Candle, Interval};
use serde::Serialize;

/// Support/resistance derived from a local-extremum scan.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SupportResistance {
    /// Strongest support below the last close (window low as fallback).
    pub support: f64,
    /// Strongest resistance above the last close (window high as fallback).
    pub resistance: f64,
    /// Proportional to the number of extrema found, capped at 1.
    pub strength: f64,
}

/// Scan for local extrema with a ±`window` neighbourhood.
///
/// A high is a resistance candidate when it is the maximum of its
/// neighbourhood; lows symmetrically for support. The returned levels are
/// the candidates closest to the last close on their respective sides.
pub fn support_resistance(candles: &[Candle], window: usize) -> SupportResistance {
    let last_close = candles.last().map(|c| c.close).unwrap_or(0.0);
    if candles.len() < 2 * window + 1 {
        let low = candles.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);
        let high = candles
            .iter()
            .map(|c| c.high)
            .fold(f64::NEG_INFINITY, f64::max);
        return SupportResistance {
            support: if low.is_finite() { low } else { last_close },
            resistance: if high.is_finite() { high } else { last_close },
            strength: 0.0,
        };
    }

    let mut supports = Vec::new();
    let mut resistances = Vec::new();
    for i in window..candles.len() - window {
        let high = candles[i].high;
        let low = candles[i].low;
        // Strict extremum: ties (flat stretches) are not levels.
        let others = (i - window..=i + window).filter(|&j| j != i);
        if others.clone().all(|j| candles[j].high < high) {
            resistances.push(high);
        }
        if others.into_iter().all(|j| candles[j].low > low) {
            supports.push(low);
        }
    }

    let extrema = supports.len() + resistances.len();
    let support = supports
        .iter()
        .copied()
        .filter(|&s| s <= last_close)
        .fold(f64::NEG_INFINITY, f64::max);
    let resistance = resistances
        .iter()
        .copied()
        .filter(|&r| r >= last_close)
        .fold(f64::INFINITY, f64::min);

    SupportResistance {
        support: if support.is_finite() {
            support
        } else {
            candles.iter().map(|c| c.low).fold(f64::INFINITY, f64::min)
        },
        resistance: if resistance.is_finite() {
            resistance
        } else {
            candles
                .iter()
                .map(|c| c.high)
                .fold(f64::NEG_INFINITY, f64::max)
        },
        strength: (extrema as f64 / 10.0).min(1.0),
    }
}

/// Volatility of simple returns over the last `period` candles, annualised
/// by the interval's periods-per-year.
pub fn annualized_volatility(candles: &[Candle], period: usize, interval: Interval) -> f64 {
    let returns = simple_returns(candles, period);
    if returns.is_empty() {
        return 0.0;
    }
    stddev(&returns) * interval.periods_per_year().sqrt()
}

/// Per-interval (non-annualised) volatility of simple returns.
pub fn raw_volatility(candles: &[Candle], period: usize) -> f64 {
    let returns = simple_returns(candles, period);
    if returns.is_empty() {
        return 0.0;
    }
    stddev(&returns)
}

fn simple_returns(candles: &[Candle], period: usize) -> Vec<f64> {
    if candles.len() < 2 {
        return Vec::new();
    }
    let start = candles.len().saturating_sub(period + 1);
    candles[start..]
        .windows(2)
        .filter_map(|pair| {
            if pair[0].close > 0.0 {
                let r = pair[1].close / pair[0].close - 1.0;
                r.is_finite().then_some(r)
            } else {
                None
            }
        })
        .collect()
}

pub(crate) fn stddev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::candles_from_closes;

    #[test]
    fn short_input_falls_back_to_window_extremes() {
        let candles = candles_from_closes(&[100.0, 101.0, 99.0]);
        let sr = support_resistance(&candles, 5);
        assert_eq!(sr.strength, 0.0);
        assert!(sr.support <= sr.resistance);
    }

    #[test]
    fn empty_input_does_not_panic() {
        let sr = support_resistance(&[], 5);
        assert_eq!(sr.support, 0.0);
        assert_eq!(sr.resistance, 0.0);
    }

    #[test]
    fn finds_the_obvious_peak_and_trough() {
        // A valley at 90 and a peak at 110 in the middle of a flat series.
        let mut closes = vec![100.0; 30];
        closes[10] = 90.0;
        closes[20] = 110.0;
        let mut candles = candles_from_closes(&closes);
        // Make highs/lows equal to closes so extrema are unambiguous.
        for c in &mut candles {
            c.high = c.close;
            c.low = c.close;
        }
        let sr = support_resistance(&candles, 5);
        assert_eq!(sr.support, 90.0);
        assert_eq!(sr.resistance, 110.0);
        assert!(sr.strength > 0.0);
    }

    #[test]
    fn strength_caps_at_one() {
        // A saw-tooth produces many extrema.
        let closes: Vec<f64> = (0..120)
            .map(|i| if i % 6 < 3 { 100.0 + (i % 3) as f64 } else { 100.0 - (i % 3) as f64 })
            .collect();
        let mut candles = candles_from_closes(&closes);
        for c in &mut candles {
            c.high = c.close;
            c.low = c.close;
        }
        let sr = support_resistance(&candles, 2);
        assert!(sr.strength <= 1.0);
    }

    #[test]
    fn volatility_of_flat_series_is_zero() {
        let candles = candles_from_closes(&[100.0; 30]);
        assert_eq!(
            annualized_volatility(&candles, 20, Interval::FiveMin),
            0.0
        );
    }

    #[test]
    fn volatility_scales_with_interval_annualisation() {
        let closes: Vec<f64> = (0..30)
            .map(|i| 100.0 * (1.0 + 0.01 * ((i % 2) as f64 * 2.0 - 1.0)))
            .collect();
        let candles = candles_from_closes(&closes);
        let five = annualized_volatility(&candles, 20, Interval::FiveMin);
        let hour = annualized_volatility(&candles, 20, Interval::OneHour);
        assert!(five > hour);
        assert!(five.is_finite());
    }
}
