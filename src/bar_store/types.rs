use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single OHLCV observation, keyed uniquely by (ticker, timeframe, timestamp_utc).
/// Immutable once written (§3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub ticker: String,
    pub timeframe: Timeframe,
    pub timestamp_utc: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    pub fn key(&self) -> (String, Timeframe, DateTime<Utc>) {
        (self.ticker.clone(), self.timeframe, self.timestamp_utc)
    }
}

/// Bar timeframe in minutes. The engine default is 5 minutes (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timeframe(pub i64);

impl Timeframe {
    pub const ONE_MIN: Timeframe = Timeframe(1);
    pub const FIVE_MIN: Timeframe = Timeframe(5);

    pub fn minutes(self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}m", self.0)
    }
}
