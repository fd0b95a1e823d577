//! Process-wide metric collector and HTTP exposition.
//!
//! Counters are lock-free atomics on the writer side; gauges sit behind a
//! single mutex written once per tick. `GET /metrics` renders a
//! Prometheus-compatible text exposition, `GET /health` a JSON liveness
//! probe.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::routing::get;
use axum::Router;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Fixed histogram buckets (seconds) for analysis/execution durations.
const DURATION_BUCKETS: [f64; 6] = [0.1, 0.5, 1.0, 5.0, 30.0, 120.0];

#[derive(Debug, Default)]
struct Histogram {
    buckets: [AtomicU64; 6],
    count: AtomicU64,
    /// Sum in microseconds to stay integral under atomics.
    sum_us: AtomicU64,
}

impl Histogram {
    fn observe(&self, seconds: f64) {
        for (i, bound) in DURATION_BUCKETS.iter().enumerate() {
            if seconds <= *bound {
                self.buckets[i].fetch_add(1, Ordering::Relaxed);
            }
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_us
            .fetch_add((seconds * 1e6) as u64, Ordering::Relaxed);
    }

    fn render(&self, name: &str, out: &mut String) {
        out.push_str(&format!("# TYPE {name} histogram\n"));
        for (i, bound) in DURATION_BUCKETS.iter().enumerate() {
            out.push_str(&format!(
                "{name}_bucket{{le=\"{bound}\"}} {}\n",
                self.buckets[i].load(Ordering::Relaxed)
            ));
        }
        let count = self.count.load(Ordering::Relaxed);
        out.push_str(&format!("{name}_bucket{{le=\"+Inf\"}} {count}\n"));
        out.push_str(&format!(
            "{name}_sum {}\n",
            self.sum_us.load(Ordering::Relaxed) as f64 / 1e6
        ));
        out.push_str(&format!("{name}_count {count}\n"));
    }
}

/// Per-tick gauge state written by the engine.
#[derive(Debug, Clone, Default)]
pub struct GaugeState {
    pub balance_total: f64,
    pub realised_pnl: f64,
    pub unrealised_pnl: f64,
    pub win_rate: f64,
    pub open_positions: u32,
    pub position_pnl_pct: f64,
    pub ai_confidence: f64,
    pub kalman_confidence: f64,
    pub rsi: f64,
    pub macd_line: f64,
    pub macd_signal: f64,
    pub macd_histogram: f64,
    pub venue_healthy: bool,
    pub reasoning_healthy: bool,
}

/// The collector shared by the engine, servers and tools.
#[derive(Debug, Default)]
pub struct Metrics {
    trades_total: AtomicU64,
    trades_won: AtomicU64,
    trades_lost: AtomicU64,
    errors_total: AtomicU64,
    gauges: Mutex<GaugeState>,
    analysis_duration: Histogram,
    execution_duration: Histogram,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_trade_open(&self) {
        self.trades_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_trade_result(&self, won: bool) {
        if won {
            self.trades_won.fetch_add(1, Ordering::Relaxed);
        } else {
            self.trades_lost.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_error(&self) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe_analysis(&self, seconds: f64) {
        self.analysis_duration.observe(seconds);
    }

    pub fn observe_execution(&self, seconds: f64) {
        self.execution_duration.observe(seconds);
    }

    /// Replace the gauge snapshot (called once per tick).
    pub fn set_gauges(&self, gauges: GaugeState) {
        *self.gauges.lock().expect("gauge state poisoned") = gauges;
    }

    /// Update only the health bits (startup and probes).
    pub fn set_health(&self, venue: bool, reasoning: bool) {
        let mut gauges = self.gauges.lock().expect("gauge state poisoned");
        gauges.venue_healthy = venue;
        gauges.reasoning_healthy = reasoning;
    }

    pub fn trades_total(&self) -> u64 {
        self.trades_total.load(Ordering::Relaxed)
    }

    /// Render the Prometheus text exposition.
    pub fn to_prometheus_text(&self) -> String {
        let gauges = self.gauges.lock().expect("gauge state poisoned").clone();
        let mut out = String::with_capacity(2_048);

        let mut counter = |name: &str, help: &str, value: u64| {
            out.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n"
            ));
        };
        counter(
            "perp_trades_total",
            "Trades opened since process start",
            self.trades_total.load(Ordering::Relaxed),
        );
        counter(
            "perp_trades_won_total",
            "Trades closed with positive PnL",
            self.trades_won.load(Ordering::Relaxed),
        );
        counter(
            "perp_trades_lost_total",
            "Trades closed with non-positive PnL",
            self.trades_lost.load(Ordering::Relaxed),
        );
        counter(
            "perp_errors_total",
            "Tick-level errors",
            self.errors_total.load(Ordering::Relaxed),
        );

        let mut gauge = |name: &str, help: &str, value: f64| {
            out.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} gauge\n{name} {value}\n"
            ));
        };
        gauge("perp_balance_total", "Wallet equity", gauges.balance_total);
        gauge("perp_realised_pnl", "Realised PnL", gauges.realised_pnl);
        gauge(
            "perp_unrealised_pnl",
            "Unrealised PnL of open positions",
            gauges.unrealised_pnl,
        );
        gauge("perp_win_rate", "Win rate percent", gauges.win_rate);
        gauge(
            "perp_open_positions",
            "Open positions on the symbol",
            gauges.open_positions as f64,
        );
        gauge(
            "perp_position_pnl_pct",
            "Open position PnL percent",
            gauges.position_pnl_pct,
        );
        gauge(
            "perp_ai_confidence",
            "Last entry verdict confidence",
            gauges.ai_confidence,
        );
        gauge(
            "perp_kalman_confidence",
            "Last Kalman confidence",
            gauges.kalman_confidence,
        );
        gauge("perp_rsi", "Last RSI", gauges.rsi);
        gauge("perp_macd_line", "Last MACD line", gauges.macd_line);
        gauge("perp_macd_signal", "Last MACD signal", gauges.macd_signal);
        gauge(
            "perp_macd_histogram",
            "Last MACD histogram",
            gauges.macd_histogram,
        );
        gauge(
            "perp_venue_up",
            "Venue reachable",
            if gauges.venue_healthy { 1.0 } else { 0.0 },
        );
        gauge(
            "perp_reasoning_up",
            "Reasoning engine reachable",
            if gauges.reasoning_healthy { 1.0 } else { 0.0 },
        );

        self.analysis_duration
            .render("perp_analysis_duration_seconds", &mut out);
        self.execution_duration
            .render("perp_execution_duration_seconds", &mut out);
        out
    }
}

async fn metrics_handler(State(metrics): State<Arc<Metrics>>) -> ([(&'static str, &'static str); 1], String) {
    (
        [("content-type", "text/plain; version=0.0.4")],
        metrics.to_prometheus_text(),
    )
}

async fn health_handler() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().timestamp_millis(),
    }))
}

/// Serve `/metrics` and `/health` on the given port.
pub fn spawn_metrics_server(metrics: Arc<Metrics>, port: u16) -> JoinHandle<()> {
    tokio::spawn(async move {
        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/health", get(health_handler))
            .with_state(metrics);
        let addr: SocketAddr = ([0, 0, 0, 0], port).into();
        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("metrics server failed to bind {addr}: {e}");
                return;
            }
        };
        info!("metrics server listening on http://{addr}");
        if let Err(e) = axum::serve(listener, app).await {
            error!("metrics server exited: {e}");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = Metrics::new();
        metrics.record_trade_open();
        metrics.record_trade_open();
        metrics.record_trade_result(true);
        metrics.record_error();
        let text = metrics.to_prometheus_text();
        assert!(text.contains("perp_trades_total 2"));
        assert!(text.contains("perp_trades_won_total 1"));
        assert!(text.contains("perp_errors_total 1"));
    }

    #[test]
    fn gauges_render_last_snapshot() {
        let metrics = Metrics::new();
        metrics.set_gauges(GaugeState {
            balance_total: 10_000.0,
            rsi: 61.5,
            venue_healthy: true,
            ..GaugeState::default()
        });
        let text = metrics.to_prometheus_text();
        assert!(text.contains("perp_balance_total 10000"));
        assert!(text.contains("perp_rsi 61.5"));
        assert!(text.contains("perp_venue_up 1"));
        assert!(text.contains("perp_reasoning_up 0"));
    }

    #[test]
    fn histogram_buckets_are_cumulative() {
        let metrics = Metrics::new();
        metrics.observe_analysis(0.05);
        metrics.observe_analysis(2.0);
        let text = metrics.to_prometheus_text();
        assert!(text.contains("perp_analysis_duration_seconds_bucket{le=\"0.1\"} 1"));
        assert!(text.contains("perp_analysis_duration_seconds_bucket{le=\"5\"} 2"));
        assert!(text.contains("perp_analysis_duration_seconds_count 2"));
    }

    #[test]
    fn exposition_has_help_and_type_lines() {
        let text = Metrics::new().to_prometheus_text();
        assert!(text.contains("# HELP perp_trades_total"));
        assert!(text.contains("# TYPE perp_win_rate gauge"));
    }
}
