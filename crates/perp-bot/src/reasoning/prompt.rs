//! Prompt assembly.
//!
//! Pure functions of their inputs; the same snapshot, indicators, Kalman
//! block and history context always produce the same prompt text. Entry
//! prompts keep BUY and SELL rules symmetric so the engine carries no long
//! bias.

use perp_common::{Side, Trend};

use crate::indicators::TechnicalIndicators;
use crate::kalman::KalmanPrediction;
use crate::venue::types::{MarketSnapshot, PositionSnapshot};

/// Annotate an RSI value with the threshold tag the model should weigh.
fn rsi_tag(rsi: f64) -> &'static str {
    if rsi < 30.0 {
        " [OVERSOLD]"
    } else if rsi > 70.0 {
        " [OVERBOUGHT]"
    } else {
        ""
    }
}

fn volume_tag(ratio: f64) -> &'static str {
    if ratio > 2.0 {
        " [ELEVATED]"
    } else if ratio < 0.5 {
        " [THIN]"
    } else {
        ""
    }
}

fn indicator_block(ind: &TechnicalIndicators) -> String {
    format!(
        "TECHNICAL INDICATORS\n\
         - RSI(14): {:.1}{}\n\
         - MACD: line {:.4}, signal {:.4}, histogram {:.4}\n\
         - Bollinger: upper {:.2}, middle {:.2}, lower {:.2}\n\
         - EMA ladder: EMA9 {:.2}, EMA21 {:.2}, EMA50 {:.2}\n\
         - Volume: current {:.2}, average {:.2}, ratio {:.2}{}",
        ind.rsi,
        rsi_tag(ind.rsi),
        ind.macd.line,
        ind.macd.signal,
        ind.macd.histogram,
        ind.bollinger.upper,
        ind.bollinger.middle,
        ind.bollinger.lower,
        ind.ema.e9,
        ind.ema.e21,
        ind.ema.e50,
        ind.volume.current,
        ind.volume.average,
        ind.volume.ratio,
        volume_tag(ind.volume.ratio),
    )
}

fn kalman_block(kalman: &KalmanPrediction) -> String {
    format!(
        "KALMAN FORECAST ({})\n\
         - predicted price: {:.2}\n\
         - trend: {}\n\
         - confidence: {:.2}\n\
         - direction accuracy: {:.2}",
        kalman.timeframe,
        kalman.predicted_price,
        kalman.trend,
        kalman.confidence,
        kalman.accuracy,
    )
}

/// Assemble the entry-analysis prompt.
pub fn build_entry_prompt(
    snapshot: &MarketSnapshot,
    indicators: &TechnicalIndicators,
    kalman: &KalmanPrediction,
    history_context: Option<&str>,
) -> String {
    let mut sections = vec![
        format!(
            "You are a disciplined crypto scalper analysing {} perpetuals.",
            snapshot.symbol
        ),
        format!(
            "MARKET SNAPSHOT\n\
             - price: {:.2} (bid {:.2} / ask {:.2})\n\
             - 24h change: {:.2}%\n\
             - 24h range: {:.2} .. {:.2}\n\
             - 24h volume: {:.0}",
            snapshot.price,
            snapshot.bid,
            snapshot.ask,
            snapshot.change_24h_pct,
            snapshot.low_24h,
            snapshot.high_24h,
            snapshot.volume_24h,
        ),
        indicator_block(indicators),
        kalman_block(kalman),
    ];

    if let Some(ctx) = history_context {
        if !ctx.is_empty() {
            sections.push(format!("HISTORICAL CONTEXT\n{ctx}"));
        }
    }

    sections.push(
        "DECISION RULES (apply symmetrically, no directional bias)\n\
         - BUY when oversold conditions, bullish Kalman trend and rising volume align.\n\
         - SELL when overbought conditions, bearish Kalman trend and rising volume align.\n\
         - HOLD when signals conflict, volume is thin, or conviction is low.\n\
         - Shorting a weak market is as valid as buying a strong one."
            .to_string(),
    );

    sections.push(
        "Respond with ONLY a JSON object:\n\
         {\n\
           \"decision\": \"BUY\" | \"SELL\" | \"HOLD\",\n\
           \"confidence\": 0.0-1.0,\n\
           \"reasoning\": \"one or two sentences\",\n\
           \"suggested_leverage\": 1-50,\n\
           \"risk_level\": \"low\" | \"medium\" | \"high\",\n\
           \"market_sentiment\": \"bullish\" | \"bearish\" | \"neutral\"\n\
         }"
        .to_string(),
    );

    sections.join("\n\n")
}

/// Reversal signals conditioned on the open side, listed for the model.
fn reversal_signals(
    side: Side,
    indicators: &TechnicalIndicators,
    kalman: &KalmanPrediction,
) -> String {
    let mut signals = Vec::new();
    match side {
        Side::Buy => {
            if indicators.rsi > 70.0 {
                signals.push("RSI overbought against the long".to_string());
            }
            if indicators.macd.histogram < 0.0 {
                signals.push("MACD histogram turned negative".to_string());
            }
            if kalman.trend == Trend::Bearish {
                signals.push("Kalman trend flipped bearish".to_string());
            }
        }
        Side::Sell => {
            if indicators.rsi < 30.0 {
                signals.push("RSI oversold against the short".to_string());
            }
            if indicators.macd.histogram > 0.0 {
                signals.push("MACD histogram turned positive".to_string());
            }
            if kalman.trend == Trend::Bullish {
                signals.push("Kalman trend flipped bullish".to_string());
            }
        }
    }
    if signals.is_empty() {
        "- none detected".to_string()
    } else {
        signals
            .iter()
            .map(|s| format!("- {s}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Assemble the position-management prompt.
pub fn build_position_prompt(
    position: &PositionSnapshot,
    snapshot: &MarketSnapshot,
    indicators: &TechnicalIndicators,
    kalman: &KalmanPrediction,
    hours_in_position: f64,
) -> String {
    let side_word = match position.side {
        Side::Buy => "LONG",
        Side::Sell => "SHORT",
    };
    format!(
        "You are managing an open {side_word} scalp position on {}.\n\n\
         POSITION\n\
         - side: {side_word}\n\
         - size: {} @ entry {:.2}\n\
         - current price: {:.2}\n\
         - unrealised PnL: {:.2} ({:+.2}%)\n\
         - leverage: {:.0}x\n\
         - time in position: {:.1} h\n\n\
         {}\n\n\
         {}\n\n\
         REVERSAL SIGNALS AGAINST THE {side_word}\n\
         {}\n\n\
         SCALPING EXIT RULES\n\
         - CLOSE_100 when a strong reversal is underway or PnL target is reached.\n\
         - CLOSE_50 when momentum is fading but the trend is intact.\n\
         - CLOSE_25 to bank profit above +0.3% while letting the rest run.\n\
         - HOLD only while the original thesis still holds.\n\n\
         Respond with ONLY a JSON object:\n\
         {{\n\
           \"action\": \"HOLD\" | \"CLOSE_25\" | \"CLOSE_50\" | \"CLOSE_100\",\n\
           \"confidence\": 0.0-1.0,\n\
           \"reasoning\": \"one or two sentences\",\n\
           \"risk_level\": \"low\" | \"medium\" | \"high\"\n\
         }}",
        position.symbol,
        position.size,
        position.entry_price,
        snapshot.price,
        position.unrealised_pnl,
        position.pnl_pct,
        position.leverage,
        hours_in_position,
        indicator_block(indicators),
        kalman_block(kalman),
        reversal_signals(position.side, indicators, kalman),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::TechnicalIndicators;
    use perp_common::Trend;

    fn snapshot() -> MarketSnapshot {
        MarketSnapshot {
            symbol: "BTCUSDT".into(),
            price: 50_000.0,
            bid: 49_999.5,
            ask: 50_000.5,
            volume_24h: 120_000.0,
            change_24h_pct: 1.2,
            high_24h: 50_500.0,
            low_24h: 49_000.0,
            timestamp: 1_700_000_000_000,
        }
    }

    fn kalman() -> KalmanPrediction {
        KalmanPrediction {
            predicted_price: 50_250.0,
            confidence: 0.82,
            trend: Trend::Bullish,
            accuracy: 0.7,
            timeframe: "5 candles".into(),
        }
    }

    #[test]
    fn entry_prompt_is_deterministic() {
        let ind = TechnicalIndicators::default();
        let a = build_entry_prompt(&snapshot(), &ind, &kalman(), Some("ctx"));
        let b = build_entry_prompt(&snapshot(), &ind, &kalman(), Some("ctx"));
        assert_eq!(a, b);
    }

    #[test]
    fn entry_prompt_contains_mandatory_sections() {
        let ind = TechnicalIndicators::default();
        let prompt = build_entry_prompt(&snapshot(), &ind, &kalman(), None);
        for section in [
            "MARKET SNAPSHOT",
            "TECHNICAL INDICATORS",
            "KALMAN FORECAST",
            "DECISION RULES",
            "\"decision\"",
        ] {
            assert!(prompt.contains(section), "missing {section}");
        }
        assert!(!prompt.contains("HISTORICAL CONTEXT"));
    }

    #[test]
    fn entry_prompt_mentions_both_directions() {
        let ind = TechnicalIndicators::default();
        let prompt = build_entry_prompt(&snapshot(), &ind, &kalman(), None);
        assert!(prompt.contains("- BUY when"));
        assert!(prompt.contains("- SELL when"));
    }

    #[test]
    fn oversold_rsi_is_tagged() {
        let mut ind = TechnicalIndicators::default();
        ind.rsi = 25.0;
        let prompt = build_entry_prompt(&snapshot(), &ind, &kalman(), None);
        assert!(prompt.contains("[OVERSOLD]"));
    }

    #[test]
    fn position_prompt_lists_side_conditional_reversals() {
        let mut ind = TechnicalIndicators::default();
        ind.rsi = 75.0;
        ind.macd.histogram = -0.5;
        let position = PositionSnapshot {
            symbol: "BTCUSDT".into(),
            side: Side::Buy,
            size: 0.25,
            entry_price: 50_000.0,
            current_price: 50_200.0,
            unrealised_pnl: 50.0,
            pnl_pct: 0.4,
            leverage: 20.0,
            timestamp: 0,
        };
        let prompt = build_position_prompt(&position, &snapshot(), &ind, &kalman(), 1.5);
        assert!(prompt.contains("RSI overbought against the long"));
        assert!(prompt.contains("MACD histogram turned negative"));
        assert!(prompt.contains("CLOSE_25"));
        assert!(prompt.contains("LONG"));
    }
}
