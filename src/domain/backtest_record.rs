//! Backtest entity (§3): the immutable record of one run of the Real-Time
//! Backtest Engine (C3) plus Execution Template Engine (C4) scoring.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::trade::Trade;
use crate::execution::engine::ScoreCard;
use crate::signal::Signal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BacktestStatus {
    Running,
    Completed,
    Failed,
}

/// Per-ticker bookkeeping of how a backtest run handled data problems
/// (§7 "each backtest includes per-ticker {days_processed,
/// days_skipped_data_gap, days_failed_worker}").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TickerRunStats {
    pub days_processed: u32,
    pub days_skipped_data_gap: u32,
    pub days_failed_worker: u32,
    pub duplicate_signals_dropped: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backtest {
    pub id: Uuid,
    pub scanner_version_id: Uuid,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub tickers: Vec<String>,
    pub execution_template_id: Uuid,
    pub signals: Vec<Signal>,
    pub trades: Vec<Trade>,
    pub metrics: BacktestMetrics,
    pub status: BacktestStatus,
    pub per_ticker_stats: std::collections::BTreeMap<String, TickerRunStats>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BacktestMetrics {
    pub trade_count: usize,
    pub win_rate: f64,
    pub total_return: f64,
    pub profit_factor: f64,
    pub sharpe_ratio: f64,
}

impl From<&ScoreCard> for BacktestMetrics {
    fn from(card: &ScoreCard) -> Self {
        Self {
            trade_count: card.trade_count,
            win_rate: card.win_rate,
            total_return: card.total_return,
            profit_factor: card.profit_factor,
            sharpe_ratio: card.sharpe_ratio,
        }
    }
}
