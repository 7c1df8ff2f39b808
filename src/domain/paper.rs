//! Paper Account / Position / Order entities (§3), consumed by the Virtual
//! Executor (C9, §4.9).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::amount::Amount;
use crate::signal::Direction;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountMetrics {
    pub realized_pnl: Amount,
    pub peak_equity: Amount,
    pub max_drawdown_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperAccount {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub initial_balance: Amount,
    pub cash: Amount,
    pub equity: Amount,
    pub buying_power: Amount,
    pub metrics: AccountMetrics,
}

impl PaperAccount {
    pub fn new(agent_id: Uuid, initial_balance: Amount) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_id,
            initial_balance,
            cash: initial_balance,
            equity: initial_balance,
            buying_power: initial_balance,
            metrics: AccountMetrics {
                realized_pnl: Amount::ZERO,
                peak_equity: initial_balance,
                max_drawdown_pct: 0.0,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperPosition {
    pub account_id: Uuid,
    pub ticker: String,
    /// Signed: positive = long, negative = short.
    pub quantity: f64,
    pub avg_entry_price: f64,
    pub current_price: f64,
    pub unrealized_pnl: Amount,
    /// Timestamp of the fill that opened (or most recently averaged into)
    /// this position; carried so a later closing fill can build a `Trade`.
    pub entry_time: DateTime<Utc>,
}

impl PaperPosition {
    pub fn flat(account_id: Uuid, ticker: String) -> Self {
        Self {
            account_id,
            ticker,
            quantity: 0.0,
            avg_entry_price: 0.0,
            current_price: 0.0,
            unrealized_pnl: Amount::ZERO,
            entry_time: Utc::now(),
        }
    }

    pub fn is_flat(&self) -> bool {
        self.quantity.abs() < 1e-9
    }

    pub fn mark_to_market(&mut self, price: f64) {
        self.current_price = price;
        let direction = if self.quantity >= 0.0 { 1.0 } else { -1.0 };
        self.unrealized_pnl = Amount::from_f64(
            direction * (price - self.avg_entry_price) * self.quantity.abs(),
        );
    }

    pub fn notional(&self) -> Amount {
        Amount::from_f64(self.quantity.abs() * self.current_price)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    StopLimit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    Pending,
    Filled,
    Partial,
    Cancelled,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperOrder {
    pub id: Uuid,
    pub account_id: Uuid,
    pub ticker: String,
    pub side: Direction,
    pub order_type: OrderType,
    pub quantity: f64,
    pub limit_price: Option<f64>,
    pub stop_price: Option<f64>,
    pub status: OrderStatus,
    pub rejection_reason: Option<String>,
    /// Set once a STOP_LIMIT order's stop price has been touched; from then
    /// on it fills like a plain LIMIT order on subsequent bars (§4.9).
    pub triggered: bool,
    pub created_at: DateTime<Utc>,
}

impl PaperOrder {
    pub fn new(
        account_id: Uuid,
        ticker: String,
        side: Direction,
        order_type: OrderType,
        quantity: f64,
        limit_price: Option<f64>,
        stop_price: Option<f64>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            account_id,
            ticker,
            side,
            order_type,
            quantity,
            limit_price,
            stop_price,
            status: OrderStatus::Pending,
            rejection_reason: None,
            triggered: false,
            created_at: Utc::now(),
        }
    }

    pub fn reject(&mut self, reason: impl Into<String>) {
        self.status = OrderStatus::Rejected;
        self.rejection_reason = Some(reason.into());
    }
}
