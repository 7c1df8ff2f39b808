//! Agent Lifecycle Manager (C10, §4.10): promotes and demotes agents across
//! `learning -> paper_trading -> live_trading`, evaluating an agent's
//! iteration history against the graduation thresholds in `Config`.

use tracing::info;
use uuid::Uuid;

use crate::amount::Amount;
use crate::config::{Config, GraduationThresholds};
use crate::domain::agent::AgentStatus;
use crate::domain::iteration::Iteration;
use crate::domain::paper::PaperAccount;
use crate::error::EngineError;
use crate::store::Store;

/// One threshold's pass/fail, surfaced so a rejected graduation can explain
/// itself instead of a bare boolean (§4.10).
#[derive(Debug, Clone)]
pub struct GraduationCheck {
    pub eligible: bool,
    pub iterations: usize,
    pub mean_win_rate: f64,
    pub mean_sharpe: f64,
    pub mean_return: f64,
    pub total_signals: usize,
    pub recent_min_win_rate: f64,
    pub failures: Vec<String>,
}

pub struct LifecycleManager<'a> {
    store: &'a Store,
}

impl<'a> LifecycleManager<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    /// Evaluates `agent_id`'s completed/approved iteration history against
    /// `thresholds` (§4.10). Iterations with no backtest (failed before a
    /// backtest ran) contribute zero trades/signals but still count toward
    /// the iteration count.
    pub fn evaluate_graduation(
        &self,
        agent_id: Uuid,
        thresholds: &GraduationThresholds,
    ) -> Result<GraduationCheck, EngineError> {
        let iterations = self.store.list_iterations(agent_id)?;
        let backtested: Vec<&Iteration> = iterations
            .iter()
            .filter(|it| it.backtest_id.is_some())
            .collect();

        let mut failures = Vec::new();

        let total = iterations.len();
        if total < thresholds.min_iterations {
            failures.push(format!(
                "{total} iterations, need >= {}",
                thresholds.min_iterations
            ));
        }

        let win_rates: Vec<f64> = self.per_iteration_win_rates(&iterations);
        let mean_win_rate = mean(&win_rates);
        if mean_win_rate < thresholds.min_mean_win_rate {
            failures.push(format!(
                "mean win rate {mean_win_rate:.3}, need >= {:.3}",
                thresholds.min_mean_win_rate
            ));
        }

        let sharpes: Vec<f64> = self.per_iteration_sharpes(&iterations);
        let mean_sharpe = mean(&sharpes);
        if mean_sharpe < thresholds.min_mean_sharpe {
            failures.push(format!(
                "mean sharpe {mean_sharpe:.3}, need >= {:.3}",
                thresholds.min_mean_sharpe
            ));
        }

        let returns: Vec<f64> = self.per_iteration_returns(&iterations);
        let mean_return = mean(&returns);
        if mean_return < thresholds.min_mean_return {
            failures.push(format!(
                "mean return {mean_return:.3}, need >= {:.3}",
                thresholds.min_mean_return
            ));
        }

        let total_signals: usize = iterations.iter().map(|it| it.signals_found).sum();
        if total_signals < thresholds.min_total_signals {
            failures.push(format!(
                "{total_signals} total signals, need >= {}",
                thresholds.min_total_signals
            ));
        }

        let recent: Vec<f64> = win_rates
            .iter()
            .rev()
            .take(thresholds.recent_window)
            .copied()
            .collect();
        let recent_min_win_rate = recent.iter().cloned().fold(f64::INFINITY, f64::min);
        if recent.len() < thresholds.recent_window
            || !recent
                .iter()
                .all(|wr| *wr > thresholds.recent_min_win_rate)
        {
            failures.push(format!(
                "last {} iterations don't all clear win rate > {:.3}",
                thresholds.recent_window, thresholds.recent_min_win_rate
            ));
        }

        let _ = backtested; // kept for clarity at call sites inspecting the filter

        Ok(GraduationCheck {
            eligible: failures.is_empty(),
            iterations: total,
            mean_win_rate,
            mean_sharpe,
            mean_return,
            total_signals,
            recent_min_win_rate: if recent_min_win_rate.is_finite() {
                recent_min_win_rate
            } else {
                0.0
            },
            failures,
        })
    }

    fn per_iteration_win_rates(&self, iterations: &[Iteration]) -> Vec<f64> {
        self.iteration_backtest_metrics(iterations, |m| m.win_rate)
    }

    fn per_iteration_sharpes(&self, iterations: &[Iteration]) -> Vec<f64> {
        self.iteration_backtest_metrics(iterations, |m| m.sharpe_ratio)
    }

    fn per_iteration_returns(&self, iterations: &[Iteration]) -> Vec<f64> {
        self.iteration_backtest_metrics(iterations, |m| m.total_return)
    }

    fn iteration_backtest_metrics(
        &self,
        iterations: &[Iteration],
        pick: impl Fn(&crate::domain::backtest_record::BacktestMetrics) -> f64,
    ) -> Vec<f64> {
        iterations
            .iter()
            .filter_map(|it| it.backtest_id)
            .filter_map(|id| self.store.get_backtest(id).ok().flatten())
            .map(|bt| pick(&bt.metrics))
            .collect()
    }

    /// Promotes `agent_id` to `target` (§4.10). Promotion to `paper_trading`
    /// atomically funds a new Paper Account (§4.10 "atomically creates").
    /// Skips the threshold check when `force` is set (§6 `agents graduate
    /// --force`); downgrades always go through [`downgrade`], never here.
    pub fn graduate(
        &self,
        agent_id: Uuid,
        target: AgentStatus,
        force: bool,
        config: &Config,
    ) -> Result<GraduationCheck, EngineError> {
        let agent = self
            .store
            .get_agent(agent_id)?
            .ok_or_else(|| EngineError::Internal(format!("unknown agent {agent_id}")))?;

        if !is_promotion(agent.status, target) {
            return Err(EngineError::Internal(format!(
                "{} -> {} is not a promotion; use downgrade for demotions",
                agent.status.as_str(),
                target.as_str()
            )));
        }

        let thresholds = match target {
            AgentStatus::PaperTrading => &config.paper_trading_thresholds,
            AgentStatus::LiveTrading => &config.live_trading_thresholds,
            AgentStatus::Learning => {
                return Err(EngineError::Internal("cannot graduate into learning".to_string()))
            }
        };

        let check = self.evaluate_graduation(agent_id, thresholds)?;
        if !check.eligible && !force {
            return Err(EngineError::ValidationFailure(format!(
                "agent {agent_id} does not meet {} thresholds: {}",
                target.as_str(),
                check.failures.join("; ")
            )));
        }

        if target == AgentStatus::PaperTrading && self.store.get_paper_account_by_agent(agent_id)?.is_none() {
            let account = PaperAccount::new(agent_id, Amount::from_f64(config.default_paper_balance));
            self.store.create_paper_account(&account)?;
            info!(%agent_id, balance = config.default_paper_balance, "funded new paper account");
        }

        self.store.update_agent_status(agent_id, target)?;
        info!(%agent_id, forced = force && !check.eligible, to = target.as_str(), "agent graduated");
        Ok(check)
    }

    /// Manual downgrade (§4.10.1): always permitted, never automatic. The
    /// agent's Paper Account, if any, is retained across the transition.
    pub fn downgrade(&self, agent_id: Uuid, target: AgentStatus) -> Result<(), EngineError> {
        let agent = self
            .store
            .get_agent(agent_id)?
            .ok_or_else(|| EngineError::Internal(format!("unknown agent {agent_id}")))?;

        if !is_demotion(agent.status, target) {
            return Err(EngineError::Internal(format!(
                "{} -> {} is not a demotion",
                agent.status.as_str(),
                target.as_str()
            )));
        }

        self.store.update_agent_status(agent_id, target)?;
        info!(%agent_id, to = target.as_str(), "agent downgraded; paper account retained");
        Ok(())
    }
}

fn is_promotion(from: AgentStatus, to: AgentStatus) -> bool {
    matches!(
        (from, to),
        (AgentStatus::Learning, AgentStatus::PaperTrading)
            | (AgentStatus::PaperTrading, AgentStatus::LiveTrading)
    )
}

fn is_demotion(from: AgentStatus, to: AgentStatus) -> bool {
    matches!(
        (from, to),
        (AgentStatus::PaperTrading, AgentStatus::Learning)
            | (AgentStatus::LiveTrading, AgentStatus::PaperTrading)
    )
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::agent::{Agent, Personality};
    use crate::domain::backtest_record::{Backtest, BacktestMetrics, BacktestStatus};
    use chrono::{NaiveDate, Utc};

    fn make_agent(store: &Store) -> Uuid {
        let agent = Agent::new("Test".to_string(), "buy dips".to_string(), Personality::default());
        store.insert_agent(&agent).unwrap();
        agent.id
    }

    fn completed_iteration_with_metrics(
        store: &Store,
        agent_id: Uuid,
        win_rate: f64,
        sharpe: f64,
        total_return: f64,
        signals: usize,
    ) -> Iteration {
        let template = store
            .get_or_create_execution_template(crate::domain::execution_template::ExecutionTemplate::new(
                "Conservative Scalper".to_string(),
                "stop_loss=0.01\n".to_string(),
            ))
            .unwrap();
        let backtest = Backtest {
            id: Uuid::new_v4(),
            scanner_version_id: Uuid::new_v4(),
            start_date: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2025, 1, 31).unwrap(),
            tickers: vec!["AAPL".to_string()],
            execution_template_id: template.id,
            signals: Vec::new(),
            trades: Vec::new(),
            metrics: BacktestMetrics {
                trade_count: 20,
                win_rate,
                total_return,
                profit_factor: 1.5,
                sharpe_ratio: sharpe,
            },
            status: BacktestStatus::Completed,
            per_ticker_stats: Default::default(),
            error: None,
            created_at: Utc::now(),
        };
        store.insert_backtest(&backtest).unwrap();

        let mut iteration = Iteration::new(agent_id, 0);
        iteration.backtest_id = Some(backtest.id);
        iteration.signals_found = signals;
        iteration.status = crate::domain::iteration::IterationStatus::Completed;
        store.insert_iteration(iteration).unwrap()
    }

    #[test]
    fn graduation_fails_with_a_clear_reason_list_below_thresholds() {
        let store = Store::open_in_memory().unwrap();
        let agent_id = make_agent(&store);
        completed_iteration_with_metrics(&store, agent_id, 0.5, 1.0, 0.01, 5);

        let manager = LifecycleManager::new(&store);
        let thresholds = Config::default().paper_trading_thresholds;
        let check = manager.evaluate_graduation(agent_id, &thresholds).unwrap();
        assert!(!check.eligible);
        assert!(!check.failures.is_empty());
    }

    #[test]
    fn graduation_succeeds_and_funds_a_paper_account() {
        let store = Store::open_in_memory().unwrap();
        let agent_id = make_agent(&store);
        for _ in 0..20 {
            completed_iteration_with_metrics(&store, agent_id, 0.65, 2.2, 0.06, 5);
        }

        let manager = LifecycleManager::new(&store);
        let config = Config::default();
        let check = manager.graduate(agent_id, AgentStatus::PaperTrading, false, &config).unwrap();
        assert!(check.eligible);

        let agent = store.get_agent(agent_id).unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::PaperTrading);
        let account = store.get_paper_account_by_agent(agent_id).unwrap().unwrap();
        assert_eq!(account.initial_balance.to_f64(), config.default_paper_balance);
    }

    #[test]
    fn forced_graduation_bypasses_thresholds() {
        let store = Store::open_in_memory().unwrap();
        let agent_id = make_agent(&store);
        completed_iteration_with_metrics(&store, agent_id, 0.3, 0.5, -0.05, 1);

        let manager = LifecycleManager::new(&store);
        let config = Config::default();
        let check = manager.graduate(agent_id, AgentStatus::PaperTrading, true, &config).unwrap();
        assert!(!check.eligible);
        let agent = store.get_agent(agent_id).unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::PaperTrading);
    }

    #[test]
    fn downgrade_is_always_allowed_and_keeps_paper_account() {
        let store = Store::open_in_memory().unwrap();
        let agent_id = make_agent(&store);
        let account = PaperAccount::new(agent_id, Amount::from_f64(100_000.0));
        store.create_paper_account(&account).unwrap();
        store.update_agent_status(agent_id, AgentStatus::PaperTrading).unwrap();

        let manager = LifecycleManager::new(&store);
        manager.downgrade(agent_id, AgentStatus::Learning).unwrap();

        let agent = store.get_agent(agent_id).unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Learning);
        assert!(store.get_paper_account_by_agent(agent_id).unwrap().is_some());
    }
}
