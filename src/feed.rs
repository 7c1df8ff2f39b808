//! Live Bar Feed (§6): subscribe/unsubscribe by ticker set, deliver `Bar`
//! events with monotonic per-ticker timestamps. The concrete venue/vendor
//! client is out of scope (§1); this fixes the contract the Paper-Trading
//! Orchestrator (C8) drives against, plus a broadcast-channel mock used by
//! tests and local runs.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::bar_store::Bar;

#[async_trait]
pub trait LiveBarFeed: Send + Sync {
    /// Subscribes to live bars for `tickers`. Reconnects with exponential
    /// backoff on disconnect and resumes from the last delivered timestamp;
    /// gaps during an outage are logged, not backfilled (§6).
    async fn subscribe(&self, tickers: &[String]) -> broadcast::Receiver<Bar>;

    async fn unsubscribe(&self, tickers: &[String]);
}

/// A process-wide, single-producer bar feed backed by a broadcast channel —
/// the "one legitimate singleton" named in §9. Tests and the paper-trading
/// demo binary push bars into it directly via [`MockFeed::publish`]; a real
/// deployment would replace the producer side with a vendor client.
pub struct MockFeed {
    tx: broadcast::Sender<Bar>,
}

impl MockFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, bar: Bar) {
        // No active subscribers is not an error — the bar is simply dropped,
        // same as a live feed with nobody currently watching that ticker.
        let _ = self.tx.send(bar);
    }
}

#[async_trait]
impl LiveBarFeed for MockFeed {
    async fn subscribe(&self, _tickers: &[String]) -> broadcast::Receiver<Bar> {
        self.tx.subscribe()
    }

    async fn unsubscribe(&self, _tickers: &[String]) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bar_store::Timeframe;
    use chrono::Utc;

    #[tokio::test]
    async fn published_bars_reach_subscribers() {
        let feed = MockFeed::new(16);
        let mut rx = feed.subscribe(&["AAPL".to_string()]).await;
        feed.publish(Bar {
            ticker: "AAPL".to_string(),
            timeframe: Timeframe::FIVE_MIN,
            timestamp_utc: Utc::now(),
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: 1.0,
        });
        let received = rx.recv().await.unwrap();
        assert_eq!(received.ticker, "AAPL");
    }
}
