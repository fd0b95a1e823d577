//! Response handling for the reasoning engine.
//!
//! The model is asked for JSON but replies free-form often enough that
//! parsing is defensive end to end: extract the first balanced `{…}`
//! block, deserialise into loose optional fields, clip everything into
//! range, and fall back to a case-insensitive keyword scan when no JSON
//! survives.

use perp_common::Trend;
use serde::Deserialize;
use serde_json::Value;

use super::{Decision, EntryVerdict, PositionAction, PositionVerdict, RiskLevel};

/// Extract the first balanced `{…}` block, string-aware.
pub fn extract_json_block(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Loose wire shape for entry verdicts; everything optional.
#[derive(Debug, Deserialize)]
struct RawEntry {
    decision: Option<String>,
    confidence: Option<Value>,
    reasoning: Option<String>,
    suggested_leverage: Option<Value>,
    risk_level: Option<String>,
    market_sentiment: Option<String>,
}

/// Loose wire shape for position verdicts.
#[derive(Debug, Deserialize)]
struct RawPosition {
    action: Option<String>,
    confidence: Option<Value>,
    reasoning: Option<String>,
    risk_level: Option<String>,
}

fn value_f64(v: &Option<Value>) -> Option<f64> {
    match v {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    }
}

fn clip_confidence(v: &Option<Value>) -> f64 {
    match value_f64(v) {
        Some(c) if c.is_finite() => c.clamp(0.0, 1.0),
        _ => 0.5,
    }
}

fn clip_leverage(v: &Option<Value>) -> u32 {
    match value_f64(v) {
        Some(l) if l.is_finite() && l >= 1.0 => (l.round() as u32).clamp(1, 50),
        _ => 5,
    }
}

fn parse_risk(s: &Option<String>) -> RiskLevel {
    match s.as_deref().map(str::to_ascii_lowercase).as_deref() {
        Some("low") => RiskLevel::Low,
        Some("high") => RiskLevel::High,
        _ => RiskLevel::Medium,
    }
}

fn parse_sentiment(s: &Option<String>) -> Trend {
    match s.as_deref().map(str::to_ascii_lowercase).as_deref() {
        Some("bullish") => Trend::Bullish,
        Some("bearish") => Trend::Bearish,
        _ => Trend::Neutral,
    }
}

/// Parse an entry verdict out of a raw model reply.
pub fn parse_entry_verdict(raw: &str) -> EntryVerdict {
    let Some(block) = extract_json_block(raw) else {
        return fallback_entry(raw);
    };
    let Ok(parsed) = serde_json::from_str::<RawEntry>(block) else {
        return fallback_entry(raw);
    };

    let decision = match parsed
        .decision
        .as_deref()
        .map(str::to_ascii_uppercase)
        .as_deref()
    {
        Some("BUY") => Decision::Buy,
        Some("SELL") => Decision::Sell,
        Some("HOLD") => Decision::Hold,
        // Unknown decisions coerce to the conservative default.
        _ => Decision::Hold,
    };

    EntryVerdict {
        decision,
        confidence: clip_confidence(&parsed.confidence),
        reasoning: parsed
            .reasoning
            .unwrap_or_else(|| "no reasoning supplied".to_string()),
        suggested_leverage: clip_leverage(&parsed.suggested_leverage),
        risk_level: parse_risk(&parsed.risk_level),
        market_sentiment: parse_sentiment(&parsed.market_sentiment),
    }
}

/// Keyword fallback when no JSON block can be recovered.
fn fallback_entry(raw: &str) -> EntryVerdict {
    let lower = raw.to_ascii_lowercase();
    let has_buy = lower.contains("buy");
    let has_sell = lower.contains("sell");
    let decision = match (has_buy, has_sell) {
        (true, false) => Decision::Buy,
        (false, true) => Decision::Sell,
        _ => Decision::Hold,
    };
    EntryVerdict {
        decision,
        confidence: if decision == Decision::Hold { 0.1 } else { 0.3 },
        reasoning: "recovered from unstructured reply".to_string(),
        suggested_leverage: 5,
        risk_level: RiskLevel::High,
        market_sentiment: Trend::Neutral,
    }
}

/// Parse a position verdict out of a raw model reply.
pub fn parse_position_verdict(raw: &str) -> PositionVerdict {
    let parsed = extract_json_block(raw)
        .and_then(|block| serde_json::from_str::<RawPosition>(block).ok());
    let Some(parsed) = parsed else {
        return PositionVerdict::conservative("unstructured position reply");
    };

    let action = match parsed
        .action
        .as_deref()
        .map(|s| s.to_ascii_uppercase().replace(' ', "_"))
        .as_deref()
    {
        Some("CLOSE_25") => PositionAction::Close25,
        Some("CLOSE_50") => PositionAction::Close50,
        Some("CLOSE_100") | Some("CLOSE") => PositionAction::Close100,
        _ => PositionAction::Hold,
    };

    PositionVerdict {
        action,
        confidence: clip_confidence(&parsed.confidence),
        reasoning: parsed
            .reasoning
            .unwrap_or_else(|| "no reasoning supplied".to_string()),
        risk_level: parse_risk(&parsed.risk_level),
    }
}
