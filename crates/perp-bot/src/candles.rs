//! Candle buffer: bounded, de-duplicated sliding window per instrument.
//!
//! Seeded by one historical backfill, then refreshed by a timer task that
//! fetches the last few candles and merges them in. The venue re-emits the
//! currently forming candle with updated close/volume; the merge keeps the
//! newer record. Window access is a short mutex-guarded critical section
//! shared between the refresh task and the tick loop.

use std::sync::{Arc, Mutex};

use perp_common::{Candle, Interval};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::venue::VenueApi;

/// Nominal window capacity.
pub const DEFAULT_CAP: usize = 200;
/// Candles fetched per refresh.
const REFRESH_FETCH: usize = 5;

/// Summary of the window for logs and the tools server.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct BufferStats {
    pub count: usize,
    pub first_open_time: i64,
    pub last_open_time: i64,
    pub first_close: f64,
    pub last_close: f64,
}

/// The sliding window plus its refresh task.
pub struct CandleBuffer {
    symbol: String,
    interval: Interval,
    cap: usize,
    window: Arc<Mutex<Vec<Candle>>>,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
    shutdown: broadcast::Sender<()>,
}

impl CandleBuffer {
    pub fn new(symbol: impl Into<String>, interval: Interval, cap: usize) -> Self {
        let (shutdown, _) = broadcast::channel(4);
        Self {
            symbol: symbol.into(),
            interval,
            cap,
            window: Arc::new(Mutex::new(Vec::new())),
            refresh_task: Mutex::new(None),
            shutdown,
        }
    }

    /// Backfill the window and start the periodic refresh task.
    ///
    /// Backfill failure is fatal; refresh failures later are transient and
    /// leave the current window intact.
    pub async fn start(&self, venue: Arc<dyn VenueApi>) -> Result<(), EngineError> {
        let seed = venue
            .candles(&self.symbol, self.interval, self.cap)
            .await
            .map_err(|e| EngineError::Backfill(e.to_string()))?;
        if seed.is_empty() {
            return Err(EngineError::Backfill("venue returned no candles".into()));
        }
        {
            let mut window = self.window.lock().expect("candle window poisoned");
            merge_and_trim(&mut window, seed, self.cap);
        }
        info!(
            symbol = %self.symbol,
            interval = %self.interval,
            count = self.len(),
            "candle buffer seeded"
        );

        let window = Arc::clone(&self.window);
        let symbol = self.symbol.clone();
        let interval = self.interval;
        let cap = self.cap;
        let mut shutdown_rx = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.as_duration());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it, the seed is fresh.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        debug!(symbol = %symbol, "candle refresh task stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        match venue.candles(&symbol, interval, REFRESH_FETCH).await {
                            Ok(batch) => {
                                let mut window = window.lock().expect("candle window poisoned");
                                merge_and_trim(&mut window, batch, cap);
                            }
                            Err(e) => {
                                warn!(symbol = %symbol, "candle refresh failed, retrying next tick: {e}");
                            }
                        }
                    }
                }
            }
        });
        *self.refresh_task.lock().expect("refresh handle poisoned") = Some(handle);
        Ok(())
    }

    /// Stop the refresh task. Safe to call more than once.
    pub fn stop(&self) {
        let _ = self.shutdown.send(());
        if let Some(handle) = self.refresh_task.lock().expect("refresh handle poisoned").take()
        {
            handle.abort();
        }
    }

    /// Last `n` candles, oldest first.
    pub fn get(&self, n: usize) -> Vec<Candle> {
        let window = self.window.lock().expect("candle window poisoned");
        let start = window.len().saturating_sub(n);
        window[start..].to_vec()
    }

    pub fn has_enough(&self, min: usize) -> bool {
        self.len() >= min
    }

    pub fn len(&self) -> usize {
        self.window.lock().expect("candle window poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> BufferStats {
        let window = self.window.lock().expect("candle window poisoned");
        BufferStats {
            count: window.len(),
            first_open_time: window.first().map(|c| c.open_time).unwrap_or(0),
            last_open_time: window.last().map(|c| c.open_time).unwrap_or(0),
            first_close: window.first().map(|c| c.close).unwrap_or(0.0),
            last_close: window.last().map(|c| c.close).unwrap_or(0.0),
        }
    }

    /// Test seam: merge a batch directly without the refresh task.
    #[cfg(test)]
    pub fn apply(&self, batch: Vec<Candle>) {
        let mut window = self.window.lock().expect("candle window poisoned");
        merge_and_trim(&mut window, batch, self.cap);
    }
}

/// Merge `batch` into `window`, de-duplicating by `open_time` (newer record
/// wins), keeping the window strictly increasing and at most `cap` long.
fn merge_and_trim(window: &mut Vec<Candle>, batch: Vec<Candle>, cap: usize) {
    for candle in batch {
        match window.binary_search_by_key(&candle.open_time, |c| c.open_time) {
            Ok(i) => window[i] = candle,
            Err(i) => window.insert(i, candle),
        }
    }
    if window.len() > cap {
        let excess = window.len() - cap;
        window.drain(..excess);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(open_time: i64, close: f64) -> Candle {
        Candle {
            open_time,
            close_time: open_time + 300_000,
            open: close,
            high: close,
            low: close,
            close,
            volume: 10.0,
        }
    }

    fn buffer() -> CandleBuffer {
        CandleBuffer::new("BTCUSDT", Interval::FiveMin, 5)
    }

    #[test]
    fn merge_keeps_strictly_increasing_order() {
        let buf = buffer();
        buf.apply(vec![candle(300, 3.0), candle(100, 1.0), candle(200, 2.0)]);
        let window = buf.get(10);
        let times: Vec<i64> = window.iter().map(|c| c.open_time).collect();
        assert_eq!(times, vec![100, 200, 300]);
    }

    #[test]
    fn duplicate_open_time_keeps_newer_record() {
        let buf = buffer();
        buf.apply(vec![candle(100, 1.0)]);
        // The venue re-emits the forming candle with an updated close.
        buf.apply(vec![candle(100, 1.5)]);
        let window = buf.get(10);
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].close, 1.5);
    }

    #[test]
    fn window_trims_to_cap_fifo() {
        let buf = buffer();
        buf.apply((0..8).map(|i| candle(i * 100, i as f64)).collect());
        assert_eq!(buf.len(), 5);
        let window = buf.get(10);
        assert_eq!(window[0].open_time, 300); // oldest three evicted
    }

    #[test]
    fn merge_is_idempotent() {
        let buf = buffer();
        let batch: Vec<Candle> = (0..8).map(|i| candle(i * 100, i as f64)).collect();
        buf.apply(batch.clone());
        let first = buf.get(10);
        buf.apply(batch);
        assert_eq!(buf.get(10), first);
    }

    #[test]
    fn get_returns_last_n_oldest_first() {
        let buf = buffer();
        buf.apply((0..5).map(|i| candle(i * 100, i as f64)).collect());
        let last2 = buf.get(2);
        assert_eq!(last2.len(), 2);
        assert_eq!(last2[0].open_time, 300);
        assert_eq!(last2[1].open_time, 400);
    }

    #[test]
    fn stats_report_window_edges() {
        let buf = buffer();
        assert_eq!(buf.stats().count, 0);
        buf.apply(vec![candle(100, 1.0), candle(200, 2.0)]);
        let stats = buf.stats();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.first_open_time, 100);
        assert_eq!(stats.last_close, 2.0);
        assert!(buf.has_enough(2));
        assert!(!buf.has_enough(3));
    }
}
