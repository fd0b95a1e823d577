//! Configuration for perp-bot.
//!
//! Everything is driven by environment variables (a `.env` file is honoured
//! when present), with CLI flags overriding the environment. Missing venue
//! credentials are fatal at startup when auto-trading is enabled and paper
//! trading is off.

use std::env;

use anyhow::{bail, Result};
use perp_common::Interval;

/// Top-level configuration.
#[derive(Debug, Clone)]
pub struct BotConfig {
    /// Instrument to trade, e.g. "BTCUSDT".
    pub symbol: String,

    /// Candle interval; also the tick period of the control loop.
    pub interval: Interval,

    /// Logging level passed to the EnvFilter default.
    pub log_level: String,

    /// Venue REST parameters.
    pub venue: VenueConfig,

    /// Reasoning engine parameters.
    pub reasoning: ReasoningConfig,

    /// History store parameters.
    pub history: HistoryConfig,

    /// Trading and risk parameters.
    pub trading: TradingConfig,

    /// Auxiliary server ports.
    pub servers: ServerConfig,
}

/// Venue REST parameters.
#[derive(Debug, Clone)]
pub struct VenueConfig {
    pub api_key: String,
    pub api_secret: String,
    /// Use the venue's testnet host.
    pub testnet: bool,
    /// Signature validity window in milliseconds.
    pub recv_window_ms: u64,
    /// Per-call deadline for venue requests.
    pub timeout_ms: u64,
}

impl VenueConfig {
    /// REST base URL for the configured network.
    pub fn base_url(&self) -> &'static str {
        if self.testnet {
            "https://api-testnet.bybit.com"
        } else {
            "https://api.bybit.com"
        }
    }

    pub fn has_credentials(&self) -> bool {
        !self.api_key.is_empty() && !self.api_secret.is_empty()
    }
}

/// Reasoning engine (text-in / JSON-out LLM) parameters.
#[derive(Debug, Clone)]
pub struct ReasoningConfig {
    /// Host URL, e.g. "http://localhost:11434".
    pub host: String,
    /// Model name, e.g. "qwen2.5:14b".
    pub model: String,
    /// Per-call deadline. Reasoning calls are slow; default 120 s.
    pub timeout_ms: u64,
}

/// History store (redis) parameters.
#[derive(Debug, Clone)]
pub struct HistoryConfig {
    pub host: String,
    pub port: u16,
    /// Per-operation deadline; history is best-effort and must not stall ticks.
    pub timeout_ms: u64,
}

impl HistoryConfig {
    pub fn url(&self) -> String {
        format!("redis://{}:{}/", self.host, self.port)
    }
}

/// Trading and risk parameters.
#[derive(Debug, Clone)]
pub struct TradingConfig {
    /// Master switch. When false the engine analyses but never submits.
    pub auto_trading: bool,

    /// Simulate order writes in-process; venue reads stay live.
    pub paper_trading: bool,

    /// Hard leverage cap enforced by the risk gate.
    pub max_leverage: u32,

    /// Leverage cap applied by the scalping entry sizer (≤ max_leverage).
    pub scalp_leverage_cap: u32,

    /// Maximum total notional exposure (quote currency).
    pub max_position_size: f64,

    /// Per-trade risk as % of available balance (upper bound; the sizer may
    /// choose less).
    pub risk_pct: f64,

    /// Stop-loss distance as % of entry price.
    pub stop_loss_pct: f64,

    /// Maximum confirmed opens per local-calendar day.
    pub max_daily_trades: u32,

    /// Use the EMA(9)-of-MACD signal line instead of the 0.9×line
    /// approximation. Off by default to reproduce recorded decisions.
    pub macd_ema_signal: bool,
}

/// Ports for the metrics endpoint and the optional tools server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub metrics_port: u16,
    /// 0 disables the tools server.
    pub tools_port: u16,
}

fn env_str(name: &str, default: &str) -> String {
    env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_u16(name: &str, default: u16) -> u16 {
    env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_u32(name: &str, default: u32) -> u32 {
    env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_f64(name: &str, default: f64) -> f64 {
    env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .ok()
        .map(|s| {
            matches!(
                s.trim().to_lowercase().as_str(),
                "1" | "true" | "yes" | "y" | "on"
            )
        })
        .unwrap_or(default)
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            symbol: "BTCUSDT".to_string(),
            interval: Interval::FiveMin,
            log_level: "info".to_string(),
            venue: VenueConfig {
                api_key: String::new(),
                api_secret: String::new(),
                testnet: true,
                recv_window_ms: 5_000,
                timeout_ms: 10_000,
            },
            reasoning: ReasoningConfig {
                host: "http://localhost:11434".to_string(),
                model: "qwen2.5:14b".to_string(),
                timeout_ms: 120_000,
            },
            history: HistoryConfig {
                host: "localhost".to_string(),
                port: 6379,
                timeout_ms: 2_000,
            },
            trading: TradingConfig {
                auto_trading: false,
                paper_trading: true,
                max_leverage: 50,
                scalp_leverage_cap: 20,
                max_position_size: 10_000.0,
                risk_pct: 10.0,
                stop_loss_pct: 0.6,
                max_daily_trades: 30,
                macd_ema_signal: false,
            },
            servers: ServerConfig {
                metrics_port: 9090,
                tools_port: 8765,
            },
        }
    }
}

impl BotConfig {
    /// Load configuration from environment variables over the defaults.
    pub fn from_env() -> Self {
        let defaults = BotConfig::default();

        let interval = Interval::parse(&env_str("PERP_INTERVAL", "5m"))
            .unwrap_or(defaults.interval);

        Self {
            symbol: env_str("PERP_SYMBOL", &defaults.symbol).to_uppercase(),
            interval,
            log_level: env_str("PERP_LOG_LEVEL", &defaults.log_level),
            venue: VenueConfig {
                api_key: env_str("PERP_API_KEY", ""),
                api_secret: env_str("PERP_API_SECRET", ""),
                testnet: env_bool("PERP_TESTNET", defaults.venue.testnet),
                recv_window_ms: env_u64("PERP_RECV_WINDOW_MS", defaults.venue.recv_window_ms),
                timeout_ms: env_u64("PERP_VENUE_TIMEOUT_MS", defaults.venue.timeout_ms),
            },
            reasoning: ReasoningConfig {
                host: env_str("PERP_REASONING_HOST", &defaults.reasoning.host),
                model: env_str("PERP_REASONING_MODEL", &defaults.reasoning.model),
                timeout_ms: env_u64("PERP_REASONING_TIMEOUT_MS", defaults.reasoning.timeout_ms),
            },
            history: HistoryConfig {
                host: env_str("PERP_HISTORY_HOST", &defaults.history.host),
                port: env_u16("PERP_HISTORY_PORT", defaults.history.port),
                timeout_ms: env_u64("PERP_HISTORY_TIMEOUT_MS", defaults.history.timeout_ms),
            },
            trading: TradingConfig {
                auto_trading: env_bool("PERP_AUTO_TRADING", defaults.trading.auto_trading),
                paper_trading: env_bool("PERP_PAPER_TRADING", defaults.trading.paper_trading),
                max_leverage: env_u32("PERP_MAX_LEVERAGE", defaults.trading.max_leverage),
                scalp_leverage_cap: env_u32(
                    "PERP_SCALP_LEVERAGE_CAP",
                    defaults.trading.scalp_leverage_cap,
                ),
                max_position_size: env_f64(
                    "PERP_MAX_POSITION_SIZE",
                    defaults.trading.max_position_size,
                ),
                risk_pct: env_f64("PERP_RISK_PCT", defaults.trading.risk_pct),
                stop_loss_pct: env_f64("PERP_STOP_LOSS_PCT", defaults.trading.stop_loss_pct),
                max_daily_trades: env_u32(
                    "PERP_MAX_DAILY_TRADES",
                    defaults.trading.max_daily_trades,
                ),
                macd_ema_signal: env_bool(
                    "PERP_MACD_EMA_SIGNAL",
                    defaults.trading.macd_ema_signal,
                ),
            },
            servers: ServerConfig {
                metrics_port: env_u16("PERP_METRICS_PORT", defaults.servers.metrics_port),
                tools_port: env_u16("PERP_TOOLS_PORT", defaults.servers.tools_port),
            },
        }
    }

    /// Apply CLI overrides on top of environment configuration.
    pub fn apply_cli_overrides(
        &mut self,
        symbol: Option<String>,
        interval: Option<Interval>,
        paper: bool,
        no_trade: bool,
    ) {
        if let Some(s) = symbol {
            self.symbol = s.to_uppercase();
        }
        if let Some(i) = interval {
            self.interval = i;
        }
        if paper {
            self.trading.paper_trading = true;
        }
        if no_trade {
            self.trading.auto_trading = false;
        }
    }

    /// Validate configuration. Fatal at startup on failure.
    pub fn validate(&self) -> Result<()> {
        if self.symbol.is_empty() {
            bail!("PERP_SYMBOL must not be empty");
        }
        if self.trading.auto_trading
            && !self.trading.paper_trading
            && !self.venue.has_credentials()
        {
            bail!("live auto-trading requires PERP_API_KEY and PERP_API_SECRET");
        }
        if self.trading.max_leverage == 0 || self.trading.max_leverage > 100 {
            bail!(
                "PERP_MAX_LEVERAGE must be in 1..=100, got {}",
                self.trading.max_leverage
            );
        }
        if self.trading.scalp_leverage_cap > self.trading.max_leverage {
            bail!(
                "PERP_SCALP_LEVERAGE_CAP ({}) exceeds PERP_MAX_LEVERAGE ({})",
                self.trading.scalp_leverage_cap,
                self.trading.max_leverage
            );
        }
        if !(self.trading.risk_pct > 0.0 && self.trading.risk_pct <= 100.0) {
            bail!("PERP_RISK_PCT must be in (0, 100]");
        }
        if !(self.trading.stop_loss_pct > 0.0 && self.trading.stop_loss_pct < 50.0) {
            bail!("PERP_STOP_LOSS_PCT must be in (0, 50)");
        }
        if self.trading.max_position_size <= 0.0 {
            bail!("PERP_MAX_POSITION_SIZE must be positive");
        }
        Ok(())
    }

    /// One-line startup summary with secrets redacted.
    pub fn summary(&self) -> String {
        format!(
            "symbol={} interval={} mode={} auto_trading={} venue={} reasoning={}@{} history={}:{}",
            self.symbol,
            self.interval,
            if self.trading.paper_trading { "paper" } else { "live" },
            self.trading.auto_trading,
            if self.venue.testnet { "testnet" } else { "mainnet" },
            self.reasoning.model,
            self.reasoning.host,
            self.history.host,
            self.history.port,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        let config = BotConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn live_auto_trading_without_credentials_fails() {
        let mut config = BotConfig::default();
        config.trading.auto_trading = true;
        config.trading.paper_trading = false;
        assert!(config.validate().is_err());

        config.venue.api_key = "key".into();
        config.venue.api_secret = "secret".into();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn scalp_cap_cannot_exceed_hard_cap() {
        let mut config = BotConfig::default();
        config.trading.max_leverage = 10;
        config.trading.scalp_leverage_cap = 20;
        assert!(config.validate().is_err());
    }

    #[test]
    fn cli_overrides_win() {
        let mut config = BotConfig::default();
        config.trading.auto_trading = true;
        config.apply_cli_overrides(
            Some("ethusdt".into()),
            Some(Interval::OneMin),
            false,
            true,
        );
        assert_eq!(config.symbol, "ETHUSDT");
        assert_eq!(config.interval, Interval::OneMin);
        assert!(!config.trading.auto_trading);
    }

    #[test]
    fn summary_redacts_secrets() {
        let mut config = BotConfig::default();
        config.venue.api_key = "verysecretkey".into();
        assert!(!config.summary().contains("verysecretkey"));
    }
}
