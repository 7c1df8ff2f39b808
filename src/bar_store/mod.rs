//! Bar Store (C1, §4.1).
//!
//! An ordered sequence of [`Bar`]s per (ticker, timeframe), keyed by
//! timestamp. Specified as a trait (§4.1.1) so the worker's restricted
//! prefix-only view (§4.2, §4.3) and the durable database share one
//! interface — only the backing medium differs.

mod memory;
mod sqlite;
mod types;

pub use memory::InMemoryBarStore;
pub use sqlite::SqliteBarStore;
pub use types::{Bar, Timeframe};

use chrono::{DateTime, Utc};

/// Inclusive-exclusive timestamp range: `[from, to)`.
#[derive(Debug, Clone, Copy)]
pub struct TimeRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self { from, to }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BarStoreError {
    #[error("no bars found in requested range")]
    NotFound,
    #[error("write rejected: {0}")]
    WriteRejected(String),
    #[error(transparent)]
    Storage(#[from] rusqlite::Error),
}

/// The Bar Store contract (§4.1). Implementations must guarantee: stable
/// ascending ordering on read, per-bar-atomic writes (no partial bars), and
/// that reads observe all writes that completed before the read began.
pub trait BarStore: Send + Sync {
    /// Idempotent upsert; duplicates by (ticker, timeframe, timestamp) are
    /// replaced. Rejects bars whose `timestamp_utc` is in the future.
    fn write_bars(&self, bars: &[Bar]) -> Result<(), BarStoreError>;

    /// Bars sorted ascending by timestamp within `[from, to)`.
    fn get_bars(
        &self,
        ticker: &str,
        timeframe: Timeframe,
        range: TimeRange,
    ) -> Result<Vec<Bar>, BarStoreError>;

    /// True iff at least one bar exists in the range.
    fn has_data(
        &self,
        ticker: &str,
        timeframe: Timeframe,
        range: TimeRange,
    ) -> Result<bool, BarStoreError> {
        Ok(!self.get_bars(ticker, timeframe, range)?.is_empty())
    }

    /// Min/max timestamps available for (ticker, timeframe), if any.
    fn available_range(
        &self,
        ticker: &str,
        timeframe: Timeframe,
    ) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>, BarStoreError>;
}

/// Rejects a backfill request whose `to` timestamp is in the future (§4.1).
pub fn validate_backfill_range(range: &TimeRange, now: DateTime<Utc>) -> Result<(), BarStoreError> {
    if range.to > now {
        return Err(BarStoreError::WriteRejected(
            "backfill range extends into the future".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample_bar(ticker: &str, minute: i64) -> Bar {
        Bar {
            ticker: ticker.to_string(),
            timeframe: Timeframe::FIVE_MIN,
            timestamp_utc: Utc::now() - Duration::days(1) + Duration::minutes(minute),
            open: 10.0,
            high: 10.5,
            low: 9.5,
            close: 10.1,
            volume: 1000.0,
        }
    }

    fn exercise_store_contract(store: &dyn BarStore) {
        let bars: Vec<Bar> = (0..5).map(|i| sample_bar("AAA", i * 5)).collect();
        store.write_bars(&bars).unwrap();

        // Duplicate write replaces, doesn't double the row.
        store.write_bars(&bars[0..1]).unwrap();

        let all = store
            .get_bars(
                "AAA",
                Timeframe::FIVE_MIN,
                TimeRange::new(bars[0].timestamp_utc, bars[4].timestamp_utc + Duration::minutes(1)),
            )
            .unwrap();
        assert_eq!(all.len(), 5);
        // Ascending order.
        for w in all.windows(2) {
            assert!(w[0].timestamp_utc < w[1].timestamp_utc);
        }

        assert!(store
            .has_data(
                "AAA",
                Timeframe::FIVE_MIN,
                TimeRange::new(bars[0].timestamp_utc, bars[1].timestamp_utc)
            )
            .unwrap());
        assert!(!store
            .has_data(
                "ZZZ",
                Timeframe::FIVE_MIN,
                TimeRange::new(bars[0].timestamp_utc, bars[1].timestamp_utc)
            )
            .unwrap());

        let (min, max) = store.available_range("AAA", Timeframe::FIVE_MIN).unwrap().unwrap();
        assert_eq!(min, bars[0].timestamp_utc);
        assert_eq!(max, bars[4].timestamp_utc);
    }

    #[test]
    fn memory_store_satisfies_contract() {
        exercise_store_contract(&InMemoryBarStore::new());
    }

    #[test]
    fn sqlite_store_satisfies_contract() {
        let store = SqliteBarStore::open_in_memory().unwrap();
        exercise_store_contract(&store);
    }

    #[test]
    fn future_backfill_is_rejected() {
        let range = TimeRange::new(Utc::now(), Utc::now() + Duration::days(1));
        assert!(validate_backfill_range(&range, Utc::now()).is_err());
    }
}
