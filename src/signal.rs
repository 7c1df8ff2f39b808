//! The `Signal` entity (§3), shared by the scanner worker protocol (C2), the
//! real-time backtest engine (C3), the execution template engine (C4), and
//! the paper-trading orchestrator (C8).

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Long,
    Short,
}

/// A time-stamped intent to trade for a ticker, produced by a scanner.
/// One signal per (agent, ticker, day) in real-time mode unless the agent
/// opts out (§9 Open Question).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub ticker: String,
    pub signal_date: chrono::NaiveDate,
    pub signal_time: NaiveTime,
    pub direction: Direction,
    /// Pattern strength in [0, 100].
    pub pattern_strength: f64,
    pub metrics: BTreeMap<String, f64>,
}

impl Signal {
    /// The UTC instant at which this signal fired, given the ET wall-clock
    /// `signal_time` on `signal_date`.
    pub fn fired_at_utc(&self, reference: &DateTime<Utc>) -> DateTime<Utc> {
        crate::market_hours::eastern_time_on(reference, self.signal_time)
    }
}
