//! Scalar Kalman price predictor.
//!
//! Local-level model with Φ = H = 1 over close prices. Process and
//! measurement noise are re-derived from current volatility and volume
//! trend on every call, and the filter is reseeded from the first sample,
//! so `predict` is a pure function of its input series. `reset` and
//! `set_params` exist for tests and the tools server.

use perp_common::{Candle, Trend};
use serde::Serialize;

/// Minimum series length before the filter produces a real forecast.
const MIN_CANDLES: usize = 10;
/// OLS window for the extrapolation slope.
const EXTRAPOLATION_WINDOW: usize = 5;
/// Slope dead zone below which the trend label is neutral.
const TREND_EPSILON: f64 = 1e-3;

/// Point forecast plus quality measures.
#[derive(Debug, Clone, Serialize)]
pub struct KalmanPrediction {
    pub predicted_price: f64,
    /// 1 − √MSE/(max−min), clipped to [0, 1].
    pub confidence: f64,
    pub trend: Trend,
    /// Fraction of adjacent filtered deltas whose sign matches the input.
    pub accuracy: f64,
    /// Human-readable horizon, e.g. "5 candles".
    pub timeframe: String,
}

/// The predictor. Holds only optional test overrides for Q and R.
#[derive(Debug, Default)]
pub struct KalmanPredictor {
    params_override: Option<(f64, f64)>,
}

impl KalmanPredictor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin Q and R instead of deriving them from the series.
    pub fn set_params(&mut self, q: f64, r: f64) {
        self.params_override = Some((q, r));
    }

    /// Drop any pinned parameters.
    pub fn reset(&mut self) {
        self.params_override = None;
    }

    /// Filter the close series and extrapolate `look_ahead` candles out.
    ///
    /// Series shorter than 10 candles return the fallback prediction
    /// (last close, confidence 0.1, neutral, accuracy 0.1).
    pub fn predict(&self, candles: &[Candle], look_ahead: usize) -> KalmanPrediction {
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let timeframe = format!("{look_ahead} candles");
        if closes.len() < MIN_CANDLES {
            return KalmanPrediction {
                predicted_price: closes.last().copied().unwrap_or(0.0),
                confidence: 0.1,
                trend: Trend::Neutral,
                accuracy: 0.1,
                timeframe,
            };
        }

        let (q, r) = self
            .params_override
            .unwrap_or_else(|| adapt_noise(candles, &closes));

        // Local-level recursion, seeded at the first observation.
        let mut x = closes[0];
        let mut p = 1.0;
        let mut filtered = Vec::with_capacity(closes.len());
        for &z in &closes {
            let x_pred = x;
            let p_pred = p + q;
            let k = p_pred / (p_pred + r);
            x = x_pred + k * (z - x_pred);
            p = (1.0 - k) * p_pred;
            filtered.push(x);
        }

        // OLS slope over the last filtered values, extrapolated forward.
        let tail = &filtered[filtered.len() - EXTRAPOLATION_WINDOW.min(filtered.len())..];
        let slope = ols_slope(tail);
        let predicted_price = filtered.last().unwrap() + slope * look_ahead as f64;

        let confidence = confidence(&closes, &filtered);
        let trend_tail = &filtered[filtered.len() - 3.min(filtered.len())..];
        let trend = Trend::from_signed(ols_slope(trend_tail), TREND_EPSILON);
        let accuracy = direction_accuracy(&closes, &filtered);

        KalmanPrediction {
            predicted_price,
            confidence,
            trend,
            accuracy,
            timeframe,
        }
    }
}

/// Q from volatility, R from volume trend, both clipped to sane ranges.
fn adapt_noise(candles: &[Candle], closes: &[f64]) -> (f64, f64) {
    let returns: Vec<f64> = closes
        .windows(2)
        .filter_map(|w| (w[0] > 0.0).then(|| w[1] / w[0] - 1.0))
        .filter(|r| r.is_finite())
        .collect();
    let volatility = crate::indicators::levels::stddev(&returns);
    let q = (volatility * 0.1).clamp(0.001, 0.1);

    let volumes: Vec<f64> = candles.iter().map(|c| c.volume).collect();
    let mean_all = volumes.iter().sum::<f64>() / volumes.len() as f64;
    let tail = &volumes[volumes.len() - 5.min(volumes.len())..];
    let mean_tail = tail.iter().sum::<f64>() / tail.len() as f64;
    let volume_trend = if mean_all > 0.0 {
        (mean_tail - mean_all) / mean_all
    } else {
        0.0
    };
    let r = (0.1 * (1.0 + volume_trend)).clamp(0.01, 1.0);

    (q, r)
}

fn ols_slope(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let n_f = n as f64;
    let x_mean = (n_f - 1.0) / 2.0;
    let y_mean = values.iter().sum::<f64>() / n_f;
    let mut num = 0.0;
    let mut den = 0.0;
    for (i, &y) in values.iter().enumerate() {
        let dx = i as f64 - x_mean;
        num += dx * (y - y_mean);
        den += dx * dx;
    }
    if den == 0.0 {
        0.0
    } else {
        num / den
    }
}

fn confidence(observed: &[f64], filtered: &[f64]) -> f64 {
    let mse = observed
        .iter()
        .zip(filtered)
        .map(|(o, f)| (o - f).powi(2))
        .sum::<f64>()
        / observed.len() as f64;
    let max = observed.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));
    let min = observed.iter().fold(f64::INFINITY, |a, &b| a.min(b));
    let range = max - min;
    if range <= f64::EPSILON {
        // Constant series: the filter tracks it exactly.
        return if mse < 1e-12 { 1.0 } else { 0.5 };
    }
    (1.0 - mse.sqrt() / range).clamp(0.0, 1.0)
}

fn direction_accuracy(observed: &[f64], filtered: &[f64]) -> f64 {
    let pairs = observed.len().saturating_sub(1);
    if pairs == 0 {
        return 0.0;
    }
    let matching = (1..observed.len())
        .filter(|&i| {
            let obs_delta = observed[i] - observed[i - 1];
            let fil_delta = filtered[i] - filtered[i - 1];
            obs_delta.signum() == fil_delta.signum()
        })
        .count();
    matching as f64 / pairs as f64
}
