//! Technical indicators.
//!
//! Pure functions over candle slices. Every function returns a fixed-shape
//! record even on short input, falling back to neutral sentinel values, and
//! never panics on numeric edge cases (empty slices, zero denominators,
//! NaN inputs are guarded).
//!
//! ## Modules
//!
//! - `levels`: support/resistance scan and annualised volatility
//! - `patterns`: short-window candle patterns, order-book pressure,
//!   multi-timeframe trend comparison

pub mod levels;
pub mod patterns;

use perp_common::Candle;
use serde::Serialize;

pub use levels::{annualized_volatility, support_resistance, SupportResistance};
pub use patterns::{
    analyze_candle_patterns, micro_trend, order_book_pressure, CandlePatternReport,
    OrderBookPressure, Pressure, TrendComparison,
};

/// RSI period used by the composite snapshot.
pub const RSI_PERIOD: usize = 14;
/// Bollinger period / band width used by the composite snapshot.
pub const BOLLINGER_PERIOD: usize = 20;
pub const BOLLINGER_K: f64 = 2.0;

/// MACD line/signal/histogram.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Macd {
    pub line: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// Bollinger bands.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Bollinger {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
}

/// EMA ladder over the scalping horizons.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct EmaLadder {
    pub e9: f64,
    pub e21: f64,
    pub e50: f64,
}

/// Volume profile over the window.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct VolumeProfile {
    pub average: f64,
    pub current: f64,
    /// current / average, 1.0 when the average is zero.
    pub ratio: f64,
}

/// The composite indicator snapshot computed once per tick.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct TechnicalIndicators {
    /// RSI in [0, 100]; 50 on short input.
    pub rsi: f64,
    pub macd: Macd,
    pub bollinger: Bollinger,
    pub ema: EmaLadder,
    pub volume: VolumeProfile,
}

impl Default for TechnicalIndicators {
    fn default() -> Self {
        Self {
            rsi: 50.0,
            macd: Macd::default(),
            bollinger: Bollinger::default(),
            ema: EmaLadder::default(),
            volume: VolumeProfile::default(),
        }
    }
}

/// Compute the composite snapshot from a candle window.
///
/// `macd_ema_signal` selects the EMA(9)-of-MACD signal line instead of the
/// default 0.9×line approximation (kept as default to reproduce recorded
/// decisions).
pub fn compute(candles: &[Candle], macd_ema_signal: bool) -> TechnicalIndicators {
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    TechnicalIndicators {
        rsi: rsi(&closes, RSI_PERIOD),
        macd: macd(&closes, macd_ema_signal),
        bollinger: bollinger(&closes, BOLLINGER_PERIOD, BOLLINGER_K),
        ema: ema_ladder(&closes),
        volume: volume_profile(candles),
    }
}

/// Relative Strength Index over close-to-close differences.
///
/// Requires `period + 1` closes; shorter input returns the neutral 50.
/// When losses average to zero the RSI clamps to 100.
pub fn rsi(closes: &[f64], period: usize) -> f64 {
    if period == 0 || closes.len() < period + 1 {
        return 50.0;
    }
    let window = &closes[closes.len() - (period + 1)..];
    let mut gain_sum = 0.0;
    let mut loss_sum = 0.0;
    for pair in window.windows(2) {
        let change = pair[1] - pair[0];
        if !change.is_finite() {
            continue;
        }
        if change > 0.0 {
            gain_sum += change;
        } else {
            loss_sum += -change;
        }
    }
    let avg_gain = gain_sum / period as f64;
    let avg_loss = loss_sum / period as f64;
    if avg_loss == 0.0 {
        return 100.0;
    }
    let rs = avg_gain / avg_loss;
    100.0 - 100.0 / (1.0 + rs)
}

/// Final EMA value with the recursion seeded at the first sample.
pub fn ema(values: &[f64], period: usize) -> f64 {
    let Some(&first) = values.first() else {
        return 0.0;
    };
    if period <= 1 {
        return *values.last().unwrap_or(&first);
    }
    let k = 2.0 / (period as f64 + 1.0);
    values
        .iter()
        .skip(1)
        .fold(first, |acc, &v| if v.is_finite() { v * k + acc * (1.0 - k) } else { acc })
}

/// Full EMA series (same seeding), used for the EMA-signal MACD variant.
fn ema_series(values: &[f64], period: usize) -> Vec<f64> {
    let Some(&first) = values.first() else {
        return Vec::new();
    };
    let k = 2.0 / (period as f64 + 1.0);
    let mut out = Vec::with_capacity(values.len());
    let mut acc = first;
    out.push(acc);
    for &v in &values[1..] {
        if v.is_finite() {
            acc = v * k + acc * (1.0 - k);
        }
        out.push(acc);
    }
    out
}

/// MACD = EMA(12) − EMA(26) on closes.
///
/// The default signal line is the 0.9×line approximation; pass
/// `ema_signal = true` for the textbook EMA(9)-of-MACD signal.
pub fn macd(closes: &[f64], ema_signal: bool) -> Macd {
    if closes.len() < 2 {
        return Macd::default();
    }
    let line = ema(closes, 12) - ema(closes, 26);
    let signal = if ema_signal {
        let e12 = ema_series(closes, 12);
        let e26 = ema_series(closes, 26);
        let macd_series: Vec<f64> = e12.iter().zip(&e26).map(|(a, b)| a - b).collect();
        ema(&macd_series, 9)
    } else {
        line * 0.9
    };
    Macd {
        line,
        signal,
        histogram: line - signal,
    }
}

/// Bollinger bands: SMA ± k·σ over the last `period` closes.
pub fn bollinger(closes: &[f64], period: usize, k: f64) -> Bollinger {
    if period == 0 || closes.is_empty() {
        return Bollinger::default();
    }
    if closes.len() < period {
        let last = *closes.last().unwrap_or(&0.0);
        return Bollinger {
            upper: last,
            middle: last,
            lower: last,
        };
    }
    let window = &closes[closes.len() - period..];
    let mean = window.iter().sum::<f64>() / period as f64;
    let variance = window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / period as f64;
    let sigma = variance.sqrt();
    Bollinger {
        upper: mean + k * sigma,
        middle: mean,
        lower: mean - k * sigma,
    }
}

/// EMA(9)/EMA(21)/EMA(50) ladder.
pub fn ema_ladder(closes: &[f64]) -> EmaLadder {
    EmaLadder {
        e9: ema(closes, 9),
        e21: ema(closes, 21),
        e50: ema(closes, 50),
    }
}

/// Average / current / ratio over the window's volumes.
pub fn volume_profile(candles: &[Candle]) -> VolumeProfile {
    if candles.is_empty() {
        return VolumeProfile {
            average: 0.0,
            current: 0.0,
            ratio: 1.0,
        };
    }
    let average = candles.iter().map(|c| c.volume).sum::<f64>() / candles.len() as f64;
    let current = candles.last().map(|c| c.volume).unwrap_or(0.0);
    let ratio = if average > 0.0 { current / average } else { 1.0 };
    VolumeProfile {
        average,
        current,
        ratio,
    }
}

#[cfg(test)]
pub(crate) fn candles_from_closes(closes: &[f64]) -> Vec<Candle> {
    closes
        .iter()
        .enumerate()
        .map(|(i, &close)| Candle {
            open_time: i as i64 * 300_000,
            close_time: (i as i64 + 1) * 300_000,
            open: close,
            high: close * 1.001,
            low: close * 0.999,
            close,
            volume: 100.0,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rsi_short_input_is_neutral() {
        assert_eq!(rsi(&[1.0; 10], 14), 50.0);
        assert_eq!(rsi(&[], 14), 50.0);
    }

    #[test]
    fn rsi_constant_series_clamps_to_100() {
        // No losses observed on a flat series: the clamp path returns 100.
        let closes = vec![100.0; 20];
        assert_eq!(rsi(&closes, 14), 100.0);
    }

    #[test]
    fn rsi_pure_downtrend_near_zero() {
        let closes: Vec<f64> = (0..20).map(|i| 100.0 - i as f64).collect();
        let value = rsi(&closes, 14);
        assert!(value < 1.0, "got {value}");
    }

    #[test]
    fn rsi_stays_in_bounds() {
        let closes: Vec<f64> = (0..40)
            .map(|i| 100.0 + (i as f64 * 0.7).sin() * 5.0)
            .collect();
        let value = rsi(&closes, 14);
        assert!((0.0..=100.0).contains(&value));
    }

    #[test]
    fn ema_seeds_at_first_sample() {
        assert_eq!(ema(&[42.0], 9), 42.0);
        assert_eq!(ema(&[], 9), 0.0);
        // EMA of a constant series is the constant.
        assert!((ema(&[7.0; 30], 9) - 7.0).abs() < 1e-12);
    }

    #[test]
    fn macd_default_signal_is_point_nine_line() {
        let closes: Vec<f64> = (0..60).map(|i| 100.0 + i as f64).collect();
        let m = macd(&closes, false);
        assert!((m.signal - m.line * 0.9).abs() < 1e-12);
        assert!((m.histogram - (m.line - m.signal)).abs() < 1e-12);
        // Uptrend: fast EMA above slow EMA.
        assert!(m.line > 0.0);
    }

    #[test]
    fn macd_ema_signal_variant_differs() {
        let closes: Vec<f64> = (0..60)
            .map(|i| 100.0 + (i as f64 * 0.3).sin() * 4.0)
            .collect();
        let approx = macd(&closes, false);
        let exact = macd(&closes, true);
        assert_eq!(approx.line, exact.line);
        assert_ne!(approx.signal, exact.signal);
    }

    #[test]
    fn bollinger_flat_series_collapses_bands() {
        let b = bollinger(&[50.0; 25], 20, 2.0);
        assert_eq!(b.upper, 50.0);
        assert_eq!(b.middle, 50.0);
        assert_eq!(b.lower, 50.0);
    }

    #[test]
    fn bollinger_short_input_uses_last_close() {
        let b = bollinger(&[10.0, 11.0], 20, 2.0);
        assert_eq!(b.middle, 11.0);
        assert_eq!(b.upper, b.lower);
    }

    #[test]
    fn bollinger_bands_are_ordered() {
        let closes: Vec<f64> = (0..25).map(|i| 100.0 + (i % 5) as f64).collect();
        let b = bollinger(&closes, 20, 2.0);
        assert!(b.upper > b.middle);
        assert!(b.middle > b.lower);
    }

    #[test]
    fn volume_profile_guards_zero_average() {
        let mut candles = candles_from_closes(&[1.0, 2.0]);
        for c in &mut candles {
            c.volume = 0.0;
        }
        let v = volume_profile(&candles);
        assert_eq!(v.ratio, 1.0);
    }

    #[test]
    fn compute_on_empty_window_is_all_neutral() {
        let snapshot = compute(&[], false);
        assert_eq!(snapshot.rsi, 50.0);
        assert_eq!(snapshot.macd.line, 0.0);
        assert_eq!(snapshot.volume.ratio, 1.0);
    }
}
