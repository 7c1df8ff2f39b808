//! Trade entity (§3): the realized outcome of an exit policy applied to a
//! `Signal` by the Execution Template Engine (C4).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::signal::Direction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    TrailingStop,
    TimeExit,
    EndOfDay,
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub ticker: String,
    pub entry_time: DateTime<Utc>,
    pub entry_price: f64,
    pub exit_time: DateTime<Utc>,
    pub exit_price: f64,
    pub quantity: f64,
    pub side: Direction,
    pub pnl: f64,
    pub pnl_pct: f64,
    pub exit_reason: ExitReason,
}

impl Trade {
    pub fn is_win(&self) -> bool {
        self.pnl > 0.0
    }

    /// Builds a trade from entry/exit prices and quantity, computing
    /// signed P&L for the given direction.
    pub fn new(
        ticker: String,
        entry_time: DateTime<Utc>,
        entry_price: f64,
        exit_time: DateTime<Utc>,
        exit_price: f64,
        quantity: f64,
        side: Direction,
        exit_reason: ExitReason,
    ) -> Self {
        let raw_pct = (exit_price - entry_price) / entry_price;
        let signed_pct = match side {
            Direction::Long => raw_pct,
            Direction::Short => -raw_pct,
        };
        let pnl = signed_pct * entry_price * quantity;
        Self {
            ticker,
            entry_time,
            entry_price,
            exit_time,
            exit_price,
            quantity,
            side,
            pnl,
            pnl_pct: signed_pct,
            exit_reason,
        }
    }
}
