//! Shared types for the perp trading agent.
//!
//! Analytics (indicators, filters, PnL percentages) use `f64`; only order
//! quantities and prices that cross the venue boundary are quantised, via
//! the helpers in [`crate::num`].

use serde::{Deserialize, Serialize};

/// Order / position side on a perpetual contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Returns the opposite side.
    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// Venue wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "Buy",
            Side::Sell => "Sell",
        }
    }

    /// Parse from the venue wire representation (case-insensitive).
    pub fn from_str_opt(s: &str) -> Option<Side> {
        match s.to_ascii_lowercase().as_str() {
            "buy" | "long" => Some(Side::Buy),
            "sell" | "short" => Some(Side::Sell),
            _ => None,
        }
    }

    /// +1 for Buy, -1 for Sell. Used to fold long/short arithmetic.
    pub fn sign(&self) -> f64 {
        match self {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Candle interval supported by the venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Interval {
    /// 1-minute candles (fine timeframe for micro-trend tools).
    OneMin,
    /// 5-minute candles (the scalping default).
    #[default]
    FiveMin,
    FifteenMin,
    OneHour,
    FourHour,
    OneDay,
}

impl Interval {
    /// Venue wire code ("1", "5", "15", "60", "240", "D").
    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::OneMin => "1",
            Interval::FiveMin => "5",
            Interval::FifteenMin => "15",
            Interval::OneHour => "60",
            Interval::FourHour => "240",
            Interval::OneDay => "D",
        }
    }

    /// Returns the interval length in seconds.
    pub fn seconds(&self) -> u64 {
        match self {
            Interval::OneMin => 60,
            Interval::FiveMin => 300,
            Interval::FifteenMin => 900,
            Interval::OneHour => 3_600,
            Interval::FourHour => 14_400,
            Interval::OneDay => 86_400,
        }
    }

    /// Returns the interval as a std Duration.
    pub fn as_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.seconds())
    }

    /// Number of intervals in a (365-day) year. Used to annualise volatility.
    pub fn periods_per_year(&self) -> f64 {
        (365.0 * 86_400.0) / self.seconds() as f64
    }

    /// Parse a human-friendly interval ("5m", "1h", "5", "60", "D").
    pub fn parse(s: &str) -> Option<Interval> {
        match s.trim().to_ascii_lowercase().as_str() {
            "1" | "1m" | "1min" => Some(Interval::OneMin),
            "5" | "5m" | "5min" => Some(Interval::FiveMin),
            "15" | "15m" | "15min" => Some(Interval::FifteenMin),
            "60" | "1h" | "60min" => Some(Interval::OneHour),
            "240" | "4h" => Some(Interval::FourHour),
            "d" | "1d" | "day" => Some(Interval::OneDay),
            _ => None,
        }
    }
}

impl std::fmt::Display for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Directional trend label shared by the signal processors and the
/// reasoning verdicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Bullish,
    Bearish,
    #[default]
    Neutral,
}

impl Trend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trend::Bullish => "bullish",
            Trend::Bearish => "bearish",
            Trend::Neutral => "neutral",
        }
    }

    /// Classify a signed slope/change with a dead zone of `threshold`.
    pub fn from_signed(value: f64, threshold: f64) -> Trend {
        if value > threshold {
            Trend::Bullish
        } else if value < -threshold {
            Trend::Bearish
        } else {
            Trend::Neutral
        }
    }
}

impl std::fmt::Display for Trend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single OHLCV candle.
///
/// Identity is `open_time`; candles are never mutated after construction.
/// The venue may re-emit the currently forming candle with updated close and
/// volume, which the candle buffer resolves by keeping the newer record.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Bucket open time (unix millis).
    pub open_time: i64,
    /// Bucket close time (unix millis).
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// Signed body size (close − open).
    pub fn body(&self) -> f64 {
        self.close - self.open
    }

    /// Full high-low range.
    pub fn range(&self) -> f64 {
        self.high - self.low
    }

    /// True if close > open.
    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }
}
