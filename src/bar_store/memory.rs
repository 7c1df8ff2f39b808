use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::{Bar, BarStoreError, Timeframe, TimeRange};
use crate::bar_store::BarStore;

/// Pure in-memory implementation, `BTreeMap`-backed for stable ascending
/// iteration. Used as the Scanner Worker's prefix-only sandbox view (§4.2,
/// §4.3, §4.8) — small, cheap to rebuild per day, and trivially seeded with
/// exactly the bars the worker is allowed to see.
#[derive(Default)]
pub struct InMemoryBarStore {
    // keyed by (ticker, timeframe) -> timestamp -> bar
    bars: RwLock<BTreeMap<(String, Timeframe), BTreeMap<DateTime<Utc>, Bar>>>,
}

impl InMemoryBarStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a store pre-seeded with `bars`, skipping the future-timestamp
    /// check (used internally to construct per-day prefix views where "now"
    /// is simulation time, not wall-clock time).
    pub fn seeded(bars: impl IntoIterator<Item = Bar>) -> Self {
        let store = Self::new();
        for bar in bars {
            store.insert_unchecked(bar);
        }
        store
    }

    fn insert_unchecked(&self, bar: Bar) {
        let key = (bar.ticker.clone(), bar.timeframe);
        self.bars
            .write()
            .entry(key)
            .or_default()
            .insert(bar.timestamp_utc, bar);
    }
}

impl BarStore for InMemoryBarStore {
    fn write_bars(&self, bars: &[Bar]) -> Result<(), BarStoreError> {
        for bar in bars {
            if bar.timestamp_utc > Utc::now() {
                return Err(BarStoreError::WriteRejected(format!(
                    "bar for {} at {} is in the future",
                    bar.ticker, bar.timestamp_utc
                )));
            }
        }
        for bar in bars {
            self.insert_unchecked(bar.clone());
        }
        Ok(())
    }

    fn get_bars(
        &self,
        ticker: &str,
        timeframe: Timeframe,
        range: TimeRange,
    ) -> Result<Vec<Bar>, BarStoreError> {
        let guard = self.bars.read();
        let Some(series) = guard.get(&(ticker.to_string(), timeframe)) else {
            return Ok(Vec::new());
        };
        Ok(series
            .range(range.from..range.to)
            .map(|(_, bar)| bar.clone())
            .collect())
    }

    fn available_range(
        &self,
        ticker: &str,
        timeframe: Timeframe,
    ) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>, BarStoreError> {
        let guard = self.bars.read();
        let Some(series) = guard.get(&(ticker.to_string(), timeframe)) else {
            return Ok(None);
        };
        let min = series.keys().next().copied();
        let max = series.keys().next_back().copied();
        Ok(min.zip(max))
    }
}
