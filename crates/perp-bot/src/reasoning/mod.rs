//! Reasoning engine adapter.
//!
//! Sends a single text prompt to the language model and asks for JSON
//! back. The model's output is untrusted input: it is extracted, parsed,
//! validated and clipped before anything downstream sees it, and every
//! failure mode (transport, deadline, garbage output) collapses into a
//! conservative HOLD verdict so a tick can always complete.
//!
//! ## Modules
//!
//! - `prompt`: pure prompt assembly
//! - `parse`: JSON extraction, validation/clipping, keyword fallback

pub mod parse;
pub mod prompt;

use std::time::Duration;

use perp_common::Trend;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use crate::config::ReasoningConfig;
use crate::error::ReasoningError;

/// Entry decision emitted by the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Decision {
    Buy,
    Sell,
    Hold,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Buy => "BUY",
            Decision::Sell => "SELL",
            Decision::Hold => "HOLD",
        }
    }
}

/// Model-assessed risk band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    #[default]
    Medium,
    High,
}

/// Validated, clipped entry verdict.
#[derive(Debug, Clone, Serialize)]
pub struct EntryVerdict {
    pub decision: Decision,
    /// [0, 1]
    pub confidence: f64,
    pub reasoning: String,
    /// [1, 50]
    pub suggested_leverage: u32,
    pub risk_level: RiskLevel,
    pub market_sentiment: Trend,
}

impl EntryVerdict {
    /// The verdict returned when the engine cannot be trusted or reached.
    pub fn conservative(reason: &str) -> Self {
        Self {
            decision: Decision::Hold,
            confidence: 0.1,
            reasoning: reason.to_string(),
            suggested_leverage: 1,
            risk_level: RiskLevel::High,
            market_sentiment: Trend::Neutral,
        }
    }
}

/// Position-management action emitted by the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionAction {
    Hold,
    Close25,
    Close50,
    Close100,
}

impl PositionAction {
    /// Percentage to close; 0 for Hold.
    pub fn close_pct(&self) -> u8 {
        match self {
            PositionAction::Hold => 0,
            PositionAction::Close25 => 25,
            PositionAction::Close50 => 50,
            PositionAction::Close100 => 100,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PositionAction::Hold => "HOLD",
            PositionAction::Close25 => "CLOSE_25",
            PositionAction::Close50 => "CLOSE_50",
            PositionAction::Close100 => "CLOSE_100",
        }
    }
}

/// Validated, clipped position verdict.
#[derive(Debug, Clone, Serialize)]
pub struct PositionVerdict {
    pub action: PositionAction,
    pub confidence: f64,
    pub reasoning: String,
    pub risk_level: RiskLevel,
}

impl PositionVerdict {
    pub fn conservative(reason: &str) -> Self {
        Self {
            action: PositionAction::Hold,
            confidence: 0.1,
            reasoning: reason.to_string(),
            risk_level: RiskLevel::High,
        }
    }
}

/// Seam the engine and tools server talk through, so tests can script
/// verdicts without a live model.
#[async_trait::async_trait]
pub trait ReasoningApi: Send + Sync {
    async fn analyse_entry(&self, prompt: &str) -> EntryVerdict;
    async fn analyse_position(&self, prompt: &str) -> PositionVerdict;
    async fn health(&self) -> bool;
}

/// HTTP adapter to the reasoning engine.
pub struct ReasoningClient {
    http: Client,
    cfg: ReasoningConfig,
}

impl ReasoningClient {
    pub fn new(cfg: ReasoningConfig) -> Self {
        // The outer timeout is enforced per call; keep the transport layer
        // slightly looser so the deadline error is ours, not reqwest's.
        let http = Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms + 5_000))
            .build()
            .expect("reqwest client construction is infallible with these options");
        Self { http, cfg }
    }

    /// Raw completion with the configured per-call deadline.
    async fn complete(&self, prompt: &str) -> Result<String, ReasoningError> {
        let body = json!({
            "model": self.cfg.model,
            "prompt": prompt,
            "stream": false,
            "format": "json",
            "options": { "temperature": 0.2 },
        });
        let url = format!("{}/api/generate", self.cfg.host.trim_end_matches('/'));
        let request = async {
            let resp = self.http.post(&url).json(&body).send().await?;
            let payload: Value = resp.json().await?;
            Ok::<String, ReasoningError>(
                payload
                    .get("response")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            )
        };
        match tokio::time::timeout(Duration::from_millis(self.cfg.timeout_ms), request).await {
            Ok(result) => result,
            Err(_) => Err(ReasoningError::Deadline(self.cfg.timeout_ms)),
        }
    }

    /// Entry analysis. Never fails; every error path degrades to HOLD.
    pub async fn analyse_entry(&self, prompt: &str) -> EntryVerdict {
        match self.complete(prompt).await {
            Ok(raw) => parse::parse_entry_verdict(&raw),
            Err(e) => {
                warn!("entry analysis unavailable: {e}");
                EntryVerdict::conservative("reasoning engine unavailable")
            }
        }
    }

    /// Position analysis. Never fails; every error path degrades to HOLD.
    pub async fn analyse_position(&self, prompt: &str) -> PositionVerdict {
        match self.complete(prompt).await {
            Ok(raw) => parse::parse_position_verdict(&raw),
            Err(e) => {
                warn!("position analysis unavailable: {e}");
                PositionVerdict::conservative("reasoning engine unavailable")
            }
        }
    }

    /// Probe the model host.
    pub async fn health(&self) -> bool {
        let url = format!("{}/api/tags", self.cfg.host.trim_end_matches('/'));
        match self.http.get(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    pub fn model(&self) -> &str {
        &self.cfg.model
    }
}

#[async_trait::async_trait]
impl ReasoningApi for ReasoningClient {
    async fn analyse_entry(&self, prompt: &str) -> EntryVerdict {
        ReasoningClient::analyse_entry(self, prompt).await
    }

    async fn analyse_position(&self, prompt: &str) -> PositionVerdict {
        ReasoningClient::analyse_position(self, prompt).await
    }

    async fn health(&self) -> bool {
        ReasoningClient::health(self).await
    }
}
