//! AI-assisted perpetual-futures trading agent.
//!
//! Given one instrument and a candle interval, the engine keeps a sliding
//! window of candles, combines a scalar Kalman filter and classical
//! technical indicators with a language-model verdict, and opens and
//! manages leveraged positions against the venue's REST API under a risk
//! gate, persisting decision history as it goes.
//!
//! ## Modules
//!
//! - `config`: environment-driven configuration
//! - `candles`: bounded de-duplicated candle window (C1)
//! - `indicators`: pure technical indicators (C2)
//! - `kalman`: scalar Kalman predictor (C3)
//! - `reasoning`: language-model adapter (C4)
//! - `history`: trade history store adapter (C5)
//! - `risk`: pre-trade risk gate (C6)
//! - `venue`: typed exchange REST adapter (C7)
//! - `engine`: the per-symbol control loop (C8)
//! - `metrics`, `events`, `tools`: observability and the supervisor surface

pub mod candles;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod history;
pub mod indicators;
pub mod kalman;
pub mod metrics;
pub mod reasoning;
pub mod risk;
pub mod tools;
pub mod venue;

pub use candles::CandleBuffer;
pub use config::BotConfig;
pub use engine::Engine;
pub use history::HistoryStore;
pub use kalman::KalmanPredictor;
pub use metrics::Metrics;
pub use reasoning::{ReasoningApi, ReasoningClient};
pub use risk::RiskGate;
pub use venue::{PaperVenue, VenueApi, VenueClient};
