//! Typed failure reasons per component.
//!
//! Each component exposes its own error enum; the orchestrator categorises
//! them into transient / validation / fatal and decides what a tick does
//! about it. Only `main` collapses everything into `anyhow`.

use thiserror::Error;

/// Venue adapter failures.
#[derive(Debug, Error)]
pub enum VenueError {
    /// Transport-level failure (connect, TLS, timeout, body read).
    #[error("venue transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The venue answered with a non-zero retCode outside the allow-list.
    #[error("venue api error {code}: {message}")]
    Api { code: i64, message: String },

    /// Response arrived but did not contain the expected fields.
    #[error("venue response missing {0}")]
    MissingData(&'static str),

    /// Order parameters failed local normalisation.
    #[error("invalid order: {0}")]
    InvalidOrder(String),

    /// Credentials absent while a signed endpoint was called.
    #[error("venue credentials not configured")]
    MissingCredentials,
}

impl VenueError {
    /// Transient failures are retried on the next tick; the rest are not.
    pub fn is_transient(&self) -> bool {
        matches!(self, VenueError::Transport(_))
    }
}

/// Reasoning engine failures.
///
/// Note the client itself converts these into conservative verdicts inside
/// the tick; they surface only from `health()` and the tools server.
#[derive(Debug, Error)]
pub enum ReasoningError {
    #[error("reasoning transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("reasoning call exceeded {0} ms deadline")]
    Deadline(u64),

    #[error("reasoning response unparseable: {0}")]
    Parse(String),
}

/// History store failures. All history access is best-effort.
#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history store unavailable: {0}")]
    Unavailable(String),

    #[error("history record malformed: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl From<redis::RedisError> for HistoryError {
    fn from(e: redis::RedisError) -> Self {
        HistoryError::Unavailable(e.to_string())
    }
}

/// Fatal engine-level failures (startup only; ticks degrade instead).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("startup health check failed: {0}")]
    Startup(String),

    #[error("candle backfill failed: {0}")]
    Backfill(String),

    #[error("candle buffer never reached {min} candles within {secs}s")]
    WarmupTimeout { min: usize, secs: u64 },
}
