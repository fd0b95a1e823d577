//! History store adapter.
//!
//! Persists a capped ring of recent trade records per symbol plus daily and
//! never-reset global aggregates, and formats the historical-context block
//! embedded in entry prompts. Backed by redis; degrades to an in-memory
//! stub when the store is unreachable. Every store operation runs under a
//! short deadline so history enrichment can never stall the control loop.
//!
//! Key schema:
//! - `trading:decisions:{symbol}`        capped list, newest first
//! - `trading:position:{symbol}:current` transient descriptor, TTL 24 h
//! - `trading:daily:{YYYY-MM-DD}`        hash
//! - `trading:global:stats`              hash, never reset

use std::collections::HashMap;
use std::time::Duration;

use chrono::{Local, Utc};
use perp_common::{Side, Trend};
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::HistoryConfig;
use crate::error::HistoryError;

/// Decisions kept per symbol.
const DECISIONS_CAP: usize = 20;
/// Closed trades surfaced into the prompt context.
const CONTEXT_RECENT: usize = 5;
/// TTL of the transient current-position descriptor.
const CURRENT_TTL_SECS: u64 = 24 * 3_600;

/// Terminal classification of a recorded trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeResult {
    Pending,
    Win,
    Loss,
    Liquidation,
}

/// How a position ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitType {
    TakeProfit,
    StopLoss,
    Liquidation,
    Manual,
}

/// Entry-side context captured at open time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryDetail {
    pub price: f64,
    pub rsi: f64,
    pub macd_hist: f64,
    pub kalman_trend: Trend,
    pub leverage: u32,
    pub qty: f64,
}

/// Exit-side context captured at close time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitDetail {
    #[serde(rename = "type")]
    pub exit_type: ExitType,
    pub price: f64,
    pub pnl: f64,
    pub pnl_pct: f64,
    pub duration_min: f64,
    /// Unix millis.
    pub time: i64,
}

/// A persisted trade envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: String,
    /// Unix millis.
    pub open_time: i64,
    pub side: Side,
    pub confidence: f64,
    pub entry: EntryDetail,
    pub exit: Option<ExitDetail>,
    pub result: TradeResult,
}

/// Counter hash stored per day and globally.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Aggregates {
    pub trades: u64,
    pub wins: u64,
    pub losses: u64,
    pub liquidations: u64,
    pub pnl: f64,
    pub pnl_wins: f64,
    pub pnl_losses: f64,
}

impl Aggregates {
    pub fn win_rate(&self) -> f64 {
        let settled = self.wins + self.losses;
        if settled == 0 {
            0.0
        } else {
            self.wins as f64 / settled as f64 * 100.0
        }
    }

    fn absorb(&mut self, exit: &ExitDetail, result: TradeResult) {
        self.trades += 1;
        self.pnl += exit.pnl;
        match result {
            TradeResult::Win => {
                self.wins += 1;
                self.pnl_wins += exit.pnl;
            }
            TradeResult::Loss => {
                self.losses += 1;
                self.pnl_losses += exit.pnl;
            }
            TradeResult::Liquidation => {
                self.losses += 1;
                self.liquidations += 1;
                self.pnl_losses += exit.pnl;
            }
            TradeResult::Pending => {}
        }
    }
}

/// Assembled context for the entry prompt.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryContext {
    pub recent: Vec<TradeRecord>,
    pub daily: Aggregates,
    pub global: Aggregates,
    pub patterns: Vec<String>,
}

#[derive(Default)]
struct MemStore {
    decisions: HashMap<String, Vec<TradeRecord>>,
    current: HashMap<String, String>,
    daily: HashMap<String, Aggregates>,
    global: Aggregates,
}

enum Backend {
    Redis(ConnectionManager),
    Memory(Mutex<MemStore>),
}

/// The adapter. Cheap to share behind an `Arc`.
pub struct HistoryStore {
    backend: Backend,
    timeout: Duration,
}

impl HistoryStore {
    /// Connect to redis, degrading to the in-memory stub on failure.
    pub async fn connect(cfg: &HistoryConfig) -> Self {
        let timeout = Duration::from_millis(cfg.timeout_ms);
        let attempt = async {
            let client = redis::Client::open(cfg.url())?;
            ConnectionManager::new(client).await
        };
        match tokio::time::timeout(timeout, attempt).await {
            Ok(Ok(conn)) => {
                info!(url = %cfg.url(), "history store connected");
                Self {
                    backend: Backend::Redis(conn),
                    timeout,
                }
            }
            Ok(Err(e)) => {
                warn!("history store unreachable ({e}), using in-memory stub");
                Self::in_memory()
            }
            Err(_) => {
                warn!("history store connect timed out, using in-memory stub");
                Self::in_memory()
            }
        }
    }

    /// Pure in-memory store (tests, degraded mode).
    pub fn in_memory() -> Self {
        Self {
            backend: Backend::Memory(Mutex::new(MemStore::default())),
            timeout: Duration::from_millis(1_000),
        }
    }

    fn decisions_key(symbol: &str) -> String {
        format!("trading:decisions:{symbol}")
    }

    fn current_key(symbol: &str) -> String {
        format!("trading:position:{symbol}:current")
    }

    fn daily_key() -> String {
        format!("trading:daily:{}", Local::now().format("%Y-%m-%d"))
    }

    /// Record an opened trade; returns the trade id.
    pub async fn record_open(
        &self,
        symbol: &str,
        mut record: TradeRecord,
    ) -> Result<String, HistoryError> {
        if record.id.is_empty() {
            record.id = Uuid::new_v4().to_string();
        }
        record.result = TradeResult::Pending;
        let id = record.id.clone();
        match &self.backend {
            Backend::Redis(conn) => {
                let mut conn = conn.clone();
                let payload = serde_json::to_string(&record)?;
                let current = serde_json::to_string(&serde_json::json!({
                    "trade_id": id,
                    "side": record.side,
                    "entry_price": record.entry.price,
                    "opened_at": record.open_time,
                }))?;
                let key = Self::decisions_key(symbol);
                let op = async {
                    redis::pipe()
                        .lpush(&key, payload)
                        .ltrim(&key, 0, DECISIONS_CAP as isize - 1)
                        .set_ex(Self::current_key(symbol), current, CURRENT_TTL_SECS)
                        .query_async::<()>(&mut conn)
                        .await
                };
                tokio::time::timeout(self.timeout, op)
                    .await
                    .map_err(|_| HistoryError::Unavailable("record_open deadline".into()))??;
            }
            Backend::Memory(mem) => {
                let mut mem = mem.lock().await;
                mem.current.insert(symbol.to_string(), id.clone());
                let list = mem.decisions.entry(symbol.to_string()).or_default();
                list.insert(0, record);
                list.truncate(DECISIONS_CAP);
            }
        }
        Ok(id)
    }

    /// Record a close for a previously opened trade and update aggregates.
    ///
    /// WIN iff pnl > 0, LOSS iff pnl ≤ 0, LIQUIDATION iff the exit says so.
    pub async fn record_close(
        &self,
        symbol: &str,
        trade_id: &str,
        exit: ExitDetail,
    ) -> Result<(), HistoryError> {
        let result = if exit.exit_type == ExitType::Liquidation {
            TradeResult::Liquidation
        } else if exit.pnl > 0.0 {
            TradeResult::Win
        } else {
            TradeResult::Loss
        };

        match &self.backend {
            Backend::Redis(conn) => {
                let mut conn = conn.clone();
                let key = Self::decisions_key(symbol);
                let op = async {
                    let rows: Vec<String> =
                        redis::cmd("LRANGE")
                            .arg(&key)
                            .arg(0)
                            .arg(-1)
                            .query_async(&mut conn)
                            .await?;
                    for (index, row) in rows.iter().enumerate() {
                        let Ok(mut record) = serde_json::from_str::<TradeRecord>(row) else {
                            continue;
                        };
                        if record.id != trade_id {
                            continue;
                        }
                        record.exit = Some(exit.clone());
                        record.result = result;
                        let updated = serde_json::to_string(&record)
                            .map_err(|e| redis::RedisError::from((
                                redis::ErrorKind::TypeError,
                                "serialize",
                                e.to_string(),
                            )))?;
                        redis::cmd("LSET")
                            .arg(&key)
                            .arg(index)
                            .arg(updated)
                            .query_async::<()>(&mut conn)
                            .await?;
                        break;
                    }
                    let mut pipe = redis::pipe();
                    for hash in [Self::daily_key(), "trading:global:stats".to_string()] {
                        pipe.hincr(&hash, "trades", 1).ignore();
                        match result {
                            TradeResult::Win => {
                                pipe.hincr(&hash, "wins", 1).ignore();
                                pipe.cmd("HINCRBYFLOAT")
                                    .arg(&hash)
                                    .arg("pnl_wins")
                                    .arg(exit.pnl)
                                    .ignore();
                            }
                            TradeResult::Loss | TradeResult::Liquidation => {
                                pipe.hincr(&hash, "losses", 1).ignore();
                                pipe.cmd("HINCRBYFLOAT")
                                    .arg(&hash)
                                    .arg("pnl_losses")
                                    .arg(exit.pnl)
                                    .ignore();
                                if result == TradeResult::Liquidation {
                                    pipe.hincr(&hash, "liquidations", 1).ignore();
                                }
                            }
                            TradeResult::Pending => {}
                        }
                        pipe.cmd("HINCRBYFLOAT")
                            .arg(&hash)
                            .arg("pnl")
                            .arg(exit.pnl)
                            .ignore();
                    }
                    pipe.del(Self::current_key(symbol)).ignore();
                    pipe.query_async::<()>(&mut conn).await
                };
                tokio::time::timeout(self.timeout, op)
                    .await
                    .map_err(|_| HistoryError::Unavailable("record_close deadline".into()))??;
            }
            Backend::Memory(mem) => {
                let mut mem = mem.lock().await;
                if let Some(list) = mem.decisions.get_mut(symbol) {
                    if let Some(record) = list.iter_mut().find(|r| r.id == trade_id) {
                        record.exit = Some(exit.clone());
                        record.result = result;
                    }
                }
                mem.daily
                    .entry(Local::now().format("%Y-%m-%d").to_string())
                    .or_default()
                    .absorb(&exit, result);
                mem.global.absorb(&exit, result);
                mem.current.remove(symbol);
            }
        }
        Ok(())
    }

    /// Assemble the context block inputs for the entry prompt.
    pub async fn context(&self, symbol: &str) -> Result<HistoryContext, HistoryError> {
        let (records, daily, global) = match &self.backend {
            Backend::Redis(conn) => {
                let mut conn = conn.clone();
                let key = Self::decisions_key(symbol);
                let op = async {
                    let rows: Vec<String> = redis::cmd("LRANGE")
                        .arg(&key)
                        .arg(0)
                        .arg(-1)
                        .query_async(&mut conn)
                        .await?;
                    let daily: HashMap<String, String> = redis::cmd("HGETALL")
                        .arg(Self::daily_key())
                        .query_async(&mut conn)
                        .await?;
                    let global: HashMap<String, String> = redis::cmd("HGETALL")
                        .arg("trading:global:stats")
                        .query_async(&mut conn)
                        .await?;
                    Ok::<_, redis::RedisError>((rows, daily, global))
                };
                let (rows, daily, global) = tokio::time::timeout(self.timeout, op)
                    .await
                    .map_err(|_| HistoryError::Unavailable("context deadline".into()))??;
                let records: Vec<TradeRecord> = rows
                    .iter()
                    .filter_map(|row| serde_json::from_str(row).ok())
                    .collect();
                (records, hash_aggregates(&daily), hash_aggregates(&global))
            }
            Backend::Memory(mem) => {
                let mem = mem.lock().await;
                let records = mem.decisions.get(symbol).cloned().unwrap_or_default();
                let daily = mem
                    .daily
                    .get(&Local::now().format("%Y-%m-%d").to_string())
                    .copied()
                    .unwrap_or_default();
                (records, daily, mem.global)
            }
        };

        let recent: Vec<TradeRecord> = records
            .iter()
            .filter(|r| r.exit.is_some())
            .take(CONTEXT_RECENT)
            .cloned()
            .collect();
        let patterns = derive_patterns(&records, &global);

        Ok(HistoryContext {
            recent,
            daily,
            global,
            patterns,
        })
    }

    /// Render the context block embedded into entry prompts.
    ///
    /// Deterministic prose: same context in, same text out.
    pub fn format_context(ctx: &HistoryContext) -> String {
        let mut lines = vec![format!(
            "Today: {} trades, win rate {:.0}%, net PnL {:.2}. All-time: {} trades, win rate {:.0}%, net PnL {:.2}.",
            ctx.daily.trades,
            ctx.daily.win_rate(),
            ctx.daily.pnl,
            ctx.global.trades,
            ctx.global.win_rate(),
            ctx.global.pnl,
        )];
        for record in &ctx.recent {
            if let Some(exit) = &record.exit {
                lines.push(format!(
                    "- {} {:?} @ {:.2}: {:?} {:+.2} ({:+.2}%) after {:.0} min",
                    record.side,
                    record.result,
                    record.entry.price,
                    exit.exit_type,
                    exit.pnl,
                    exit.pnl_pct,
                    exit.duration_min,
                ));
            }
        }
        for pattern in &ctx.patterns {
            lines.push(format!("! {pattern}"));
        }
        lines.join("\n")
    }

    /// Flush/close the backend. The redis manager has no explicit close;
    /// this exists so shutdown ordering is observable in logs.
    pub async fn close(&self) {
        info!("history store closed");
    }
}

fn hash_aggregates(hash: &HashMap<String, String>) -> Aggregates {
    let int = |k: &str| hash.get(k).and_then(|v| v.parse().ok()).unwrap_or(0);
    let float = |k: &str| hash.get(k).and_then(|v| v.parse().ok()).unwrap_or(0.0);
    Aggregates {
        trades: int("trades"),
        wins: int("wins"),
        losses: int("losses"),
        liquidations: int("liquidations"),
        pnl: float("pnl"),
        pnl_wins: float("pnl_wins"),
        pnl_losses: float("pnl_losses"),
    }
}

/// Small derived-pattern summary: entry-RSI split across outcomes, plus a
/// leverage warning whenever liquidations exist.
fn derive_patterns(records: &[TradeRecord], global: &Aggregates) -> Vec<String> {
    let mut patterns = Vec::new();
    let rsi_of = |want: TradeResult| -> Option<f64> {
        let values: Vec<f64> = records
            .iter()
            .filter(|r| r.result == want)
            .map(|r| r.entry.rsi)
            .collect();
        (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
    };
    if let (Some(win_rsi), Some(loss_rsi)) = (rsi_of(TradeResult::Win), rsi_of(TradeResult::Loss))
    {
        patterns.push(format!(
            "average entry RSI on wins {win_rsi:.0} vs losses {loss_rsi:.0}"
        ));
    }
    if global.liquidations > 0 {
        patterns.push(format!(
            "{} liquidation(s) recorded: prefer lower leverage",
            global.liquidations
        ));
    }
    patterns
}

/// Convenience constructor used by the engine when it opens a trade.
pub fn open_record(
    side: Side,
    confidence: f64,
    entry: EntryDetail,
) -> TradeRecord {
    TradeRecord {
        id: Uuid::new_v4().to_string(),
        open_time: Utc::now().timestamp_millis(),
        side,
        confidence,
        entry,
        exit: None,
        result: TradeResult::Pending,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(price: f64, rsi: f64) -> EntryDetail {
        EntryDetail {
            price,
            rsi,
            macd_hist: 0.1,
            kalman_trend: Trend::Bullish,
            leverage: 10,
            qty: 0.1,
        }
    }

    fn exit(pnl: f64, exit_type: ExitType) -> ExitDetail {
        ExitDetail {
            exit_type,
            price: 50_500.0,
            pnl,
            pnl_pct: pnl / 100.0,
            duration_min: 42.0,
            time: 1_700_000_000_000,
        }
    }

    #[tokio::test]
    async fn open_then_close_sets_terminal_result() {
        let store = HistoryStore::in_memory();
        let id = store
            .record_open("BTCUSDT", open_record(Side::Buy, 0.8, entry(50_000.0, 28.0)))
            .await
            .unwrap();

        store
            .record_close("BTCUSDT", &id, exit(120.0, ExitType::TakeProfit))
            .await
            .unwrap();

        let ctx = store.context("BTCUSDT").await.unwrap();
        assert_eq!(ctx.recent.len(), 1);
        assert_eq!(ctx.recent[0].result, TradeResult::Win);
        assert_eq!(ctx.daily.trades, 1);
        assert_eq!(ctx.daily.wins, 1);
        assert_eq!(ctx.global.trades, 1);
        assert_eq!(ctx.daily.win_rate(), 100.0);
    }

    #[tokio::test]
    async fn negative_pnl_is_a_loss_and_liquidation_is_tracked() {
        let store = HistoryStore::in_memory();
        let id1 = store
            .record_open("BTCUSDT", open_record(Side::Sell, 0.6, entry(50_000.0, 72.0)))
            .await
            .unwrap();
        store
            .record_close("BTCUSDT", &id1, exit(-50.0, ExitType::StopLoss))
            .await
            .unwrap();

        let id2 = store
            .record_open("BTCUSDT", open_record(Side::Buy, 0.6, entry(50_000.0, 40.0)))
            .await
            .unwrap();
        store
            .record_close("BTCUSDT", &id2, exit(-500.0, ExitType::Liquidation))
            .await
            .unwrap();

        let ctx = store.context("BTCUSDT").await.unwrap();
        assert_eq!(ctx.global.losses, 2);
        assert_eq!(ctx.global.liquidations, 1);
        assert!(ctx
            .patterns
            .iter()
            .any(|p| p.contains("liquidation")));
    }

    #[tokio::test]
    async fn zero_pnl_counts_as_loss() {
        let store = HistoryStore::in_memory();
        let id = store
            .record_open("BTCUSDT", open_record(Side::Buy, 0.5, entry(50_000.0, 50.0)))
            .await
            .unwrap();
        store
            .record_close("BTCUSDT", &id, exit(0.0, ExitType::Manual))
            .await
            .unwrap();
        let ctx = store.context("BTCUSDT").await.unwrap();
        assert_eq!(ctx.recent[0].result, TradeResult::Loss);
    }

    #[tokio::test]
    async fn decision_list_is_capped() {
        let store = HistoryStore::in_memory();
        for _ in 0..25 {
            store
                .record_open("BTCUSDT", open_record(Side::Buy, 0.5, entry(1.0, 50.0)))
                .await
                .unwrap();
        }
        let ctx = store.context("BTCUSDT").await.unwrap();
        // Open (pending) records are not in `recent`, but the cap holds
        // internally: closing an evicted id is a no-op.
        assert!(ctx.recent.is_empty());
    }

    #[tokio::test]
    async fn rsi_pattern_splits_wins_and_losses() {
        let store = HistoryStore::in_memory();
        let win = store
            .record_open("BTCUSDT", open_record(Side::Buy, 0.8, entry(50_000.0, 30.0)))
            .await
            .unwrap();
        store
            .record_close("BTCUSDT", &win, exit(100.0, ExitType::TakeProfit))
            .await
            .unwrap();
        let loss = store
            .record_open("BTCUSDT", open_record(Side::Buy, 0.8, entry(50_000.0, 68.0)))
            .await
            .unwrap();
        store
            .record_close("BTCUSDT", &loss, exit(-60.0, ExitType::StopLoss))
            .await
            .unwrap();

        let ctx = store.context("BTCUSDT").await.unwrap();
        let rsi_line = ctx
            .patterns
            .iter()
            .find(|p| p.contains("entry RSI"))
            .expect("rsi pattern");
        assert!(rsi_line.contains("30"));
        assert!(rsi_line.contains("68"));
    }

    #[tokio::test]
    async fn format_context_is_deterministic() {
        let store = HistoryStore::in_memory();
        let id = store
            .record_open("BTCUSDT", open_record(Side::Buy, 0.8, entry(50_000.0, 28.0)))
            .await
            .unwrap();
        store
            .record_close("BTCUSDT", &id, exit(120.0, ExitType::TakeProfit))
            .await
            .unwrap();
        let ctx = store.context("BTCUSDT").await.unwrap();
        let a = HistoryStore::format_context(&ctx);
        let b = HistoryStore::format_context(&ctx);
        assert_eq!(a, b);
        assert!(a.contains("Today: 1 trades"));
        assert!(a.contains("TakeProfit"));
    }
}
