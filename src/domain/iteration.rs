//! Iteration entity (§3): one closed round of the Learning Iteration
//! Pipeline (C6).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::knowledge::ExpertAnalysis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationStatus {
    Completed,
    Failed,
    Approved,
    Rejected,
}

/// Proposed parameter changes carried forward on approval (§4.6 step 10).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Refinements {
    pub changes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Iteration {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub iteration_number: u32,
    pub scanner_version_id: Option<Uuid>,
    pub backtest_id: Option<Uuid>,
    pub analysis: Option<ExpertAnalysis>,
    pub refinements: Refinements,
    pub status: IterationStatus,
    pub trades_executed: usize,
    pub signals_found: usize,
    pub failure_reasons: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Iteration {
    pub fn new(agent_id: Uuid, iteration_number: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_id,
            iteration_number,
            scanner_version_id: None,
            backtest_id: None,
            analysis: None,
            refinements: Refinements::default(),
            status: IterationStatus::Failed,
            trades_executed: 0,
            signals_found: 0,
            failure_reasons: Vec::new(),
            created_at: Utc::now(),
        }
    }
}

/// Auto-approval thresholds (§4.6 step 10). `improved_metrics` counts how
/// many of {win_rate, sharpe, total_return} improved over the agent's
/// current strategy-of-record; approval additionally requires improvement
/// in at least 2 of the 3.
#[derive(Debug, Clone, Copy)]
pub struct ApprovalThresholds {
    pub min_win_rate: f64,
    pub min_sharpe: f64,
    pub min_total_return: f64,
    pub min_trades: usize,
    pub min_improved_metrics: u32,
}

impl Default for ApprovalThresholds {
    fn default() -> Self {
        Self {
            min_win_rate: 0.55,
            min_sharpe: 1.5,
            min_total_return: 0.02,
            min_trades: 10,
            min_improved_metrics: 2,
        }
    }
}

/// Evaluates whether an iteration's backtest metrics clear the
/// auto-approval bar (§4.6 step 10).
pub fn meets_approval_thresholds(
    win_rate: f64,
    sharpe: f64,
    total_return: f64,
    trade_count: usize,
    improved_metrics: u32,
    thresholds: &ApprovalThresholds,
) -> bool {
    win_rate >= thresholds.min_win_rate
        && sharpe >= thresholds.min_sharpe
        && total_return >= thresholds.min_total_return
        && trade_count >= thresholds.min_trades
        && improved_metrics >= thresholds.min_improved_metrics
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approval_requires_all_minimums_and_two_improvements() {
        let t = ApprovalThresholds::default();
        assert!(meets_approval_thresholds(0.60, 1.6, 0.03, 12, 2, &t));
        assert!(!meets_approval_thresholds(0.60, 1.6, 0.03, 12, 1, &t));
        assert!(!meets_approval_thresholds(0.50, 1.6, 0.03, 12, 2, &t));
        assert!(!meets_approval_thresholds(0.60, 1.6, 0.03, 5, 2, &t));
    }
}
