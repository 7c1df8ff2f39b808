//! Walk-Forward Coordinator (C7, §4.7): partitions a date range into
//! train/test periods, generates exactly one scanner from the first
//! period's training data (hybrid walk-forward), and aggregates
//! out-of-sample performance across every period's test window.

use std::sync::Arc;

use chrono::{Months, NaiveDate, Utc};
use statrs::distribution::{ContinuousCDF, StudentsT};
use tracing::info;
use uuid::Uuid;

use crate::backtest::{self, BacktestRunConfig};
use crate::bar_store::BarStore;
use crate::collaborator::LlmCollaborator;
use crate::config::Config;
use crate::domain::backtest_record::{Backtest, BacktestMetrics, BacktestStatus};
use crate::domain::execution_template::ExecutionTemplate;
use crate::domain::iteration::{Iteration, IterationStatus, Refinements};
use crate::domain::scanner::{derive_name, ScannerVersion};
use crate::error::EngineError;
use crate::execution::engine;
use crate::execution::templates::TemplateKind;
use crate::pipeline::{generate_and_validate, write_scanner_code_file};
use crate::store::Store;

#[derive(Debug, Clone, Copy)]
pub struct WalkForwardConfig {
    pub train_months: u32,
    pub test_months: u32,
    /// 0 selects an expanding window (train grows, test slides); any other
    /// value selects a rolling, fixed-length train window whose start
    /// advances by `test_months - overlap_months` each period (§4.7).
    pub overlap_months: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct Period {
    pub index: usize,
    pub train_start: NaiveDate,
    pub train_end: NaiveDate,
    pub test_start: NaiveDate,
    pub test_end: NaiveDate,
}

/// Partitions `[start, end)` into periods per `config` (§4.7). Every period
/// satisfies `testRange ∩ trainRange = ∅` and `min(testRange) > max(trainRange)`
/// (§8 property 7) by construction: `test_start == train_end`.
pub fn partition_periods(start: NaiveDate, end: NaiveDate, config: &WalkForwardConfig) -> Vec<Period> {
    let mut periods = Vec::new();

    if config.overlap_months == 0 {
        // Expanding window: train always starts at `start` and grows by
        // `test_months` each period; test slides forward in lockstep.
        let mut index = 0;
        loop {
            let test_start = add_months(start, config.train_months + index as u32 * config.test_months);
            let test_end = add_months(test_start, config.test_months);
            if test_end > end {
                break;
            }
            periods.push(Period {
                index,
                train_start: start,
                train_end: test_start,
                test_start,
                test_end,
            });
            index += 1;
        }
    } else {
        // Rolling window: fixed-length train, stepping forward by
        // `test_months - overlap_months` (floored at 1 month) each period.
        let step = config.test_months.saturating_sub(config.overlap_months).max(1);
        let mut index = 0;
        loop {
            let train_start = add_months(start, index as u32 * step);
            let train_end = add_months(train_start, config.train_months);
            let test_start = train_end;
            let test_end = add_months(test_start, config.test_months);
            if test_end > end {
                break;
            }
            periods.push(Period {
                index,
                train_start,
                train_end,
                test_start,
                test_end,
            });
            index += 1;
        }
    }

    periods
}

fn add_months(date: NaiveDate, months: u32) -> NaiveDate {
    date.checked_add_months(Months::new(months))
        .unwrap_or(date)
}

#[derive(Debug, Clone)]
pub struct PeriodResult {
    pub period: Period,
    pub iteration_id: Uuid,
    pub backtest_id: Uuid,
    pub trade_count: usize,
    pub total_return: f64,
}

#[derive(Debug, Clone)]
pub struct WalkForwardResult {
    pub scanner_version_id: Uuid,
    pub periods: Vec<PeriodResult>,
    pub mean_return: f64,
    pub std_dev: f64,
    pub t_statistic: f64,
    pub p_value: f64,
    pub confidence_interval_95: (f64, f64),
    /// Fraction of test periods with a positive total return (§4.7 step 3).
    pub consistency: f64,
}

pub struct WalkForwardCoordinator<'a> {
    store: &'a Store,
    bars: Arc<dyn BarStore>,
    collaborator: Arc<dyn LlmCollaborator>,
    config: &'a Config,
}

impl<'a> WalkForwardCoordinator<'a> {
    pub fn new(
        store: &'a Store,
        bars: Arc<dyn BarStore>,
        collaborator: Arc<dyn LlmCollaborator>,
        config: &'a Config,
    ) -> Self {
        Self {
            store,
            bars,
            collaborator,
            config,
        }
    }

    /// Runs the full walk-forward procedure for `agent_id` over `tickers`
    /// across `[start, end)` (§4.7). Fails only if the first period's
    /// scanner never clears validation or the date range produces zero
    /// periods; individual test-period backtest failures degrade that
    /// period's contribution to zero trades rather than aborting the run.
    pub async fn run(
        &self,
        agent_id: Uuid,
        tickers: &[String],
        start: NaiveDate,
        end: NaiveDate,
        wf_config: &WalkForwardConfig,
    ) -> Result<WalkForwardResult, EngineError> {
        let agent = self
            .store
            .get_agent(agent_id)?
            .ok_or_else(|| EngineError::Internal(format!("unknown agent {agent_id}")))?;

        let periods = partition_periods(start, end, wf_config);
        if periods.is_empty() {
            return Err(EngineError::Internal(
                "date range too short to produce any walk-forward period".to_string(),
            ));
        }

        // Step 1: generate ONE scanner from P_1's training data. The training
        // range itself only bounds what the agent's instructions claim to
        // have been developed against; the generator has no access to bars
        // directly (§1 Non-goals — generation is out of scope for this crate).
        let knowledge = self.store.list_knowledge(agent_id)?;
        let knowledge_summary = if knowledge.is_empty() {
            "No accumulated knowledge yet.".to_string()
        } else {
            format!("{} prior knowledge rows available.", knowledge.len())
        };

        let first = periods[0];
        let guidance = format!(
            "Train on data from {} through {} only; this scanner will be reused unchanged across every subsequent out-of-sample test period.",
            first.train_start, first.train_end
        );

        let code = generate_and_validate(self.collaborator.as_ref(), &agent.instructions, &knowledge_summary, Some(guidance))
            .await
            .map_err(|violations| {
                EngineError::ValidationFailure(format!(
                    "walk-forward scanner failed validation: {}",
                    violations.join("; ")
                ))
            })?;

        let version = self.store.insert_scanner_version(ScannerVersion {
            id: Uuid::new_v4(),
            agent_id,
            version_number: 0,
            name: format!("{} (walk-forward)", derive_name(&agent.instructions, 0)),
            code,
            model_tag: "collaborator".to_string(),
            generation_prompt: agent.instructions.clone(),
            created_at: Utc::now(),
        })?;

        let template = self
            .store
            .get_or_create_execution_template(ExecutionTemplate::new(
                TemplateKind::ConservativeScalper.name().to_string(),
                TemplateKind::ConservativeScalper.canonical_code(),
            ))?;

        // Step 2: run every test period through C3/C4 against that same scanner.
        let mut results = Vec::with_capacity(periods.len());
        for period in &periods {
            let result = self
                .run_period(agent_id, &version, &template, tickers, *period)
                .await?;
            info!(
                %agent_id,
                period = period.index,
                total_return = result.total_return,
                "walk-forward period complete"
            );
            results.push(result);
        }

        // Step 3: aggregate.
        let returns: Vec<f64> = results.iter().map(|r| r.total_return).collect();
        let aggregate = aggregate_returns(&returns);

        Ok(WalkForwardResult {
            scanner_version_id: version.id,
            periods: results,
            mean_return: aggregate.mean,
            std_dev: aggregate.std_dev,
            t_statistic: aggregate.t_statistic,
            p_value: aggregate.p_value,
            confidence_interval_95: aggregate.confidence_interval_95,
            consistency: aggregate.consistency,
        })
    }

    async fn run_period(
        &self,
        agent_id: Uuid,
        version: &ScannerVersion,
        template: &ExecutionTemplate,
        tickers: &[String],
        period: Period,
    ) -> Result<PeriodResult, EngineError> {
        let code_path = write_scanner_code_file(&version.code)?;
        let mut run_config = BacktestRunConfig::from_config(self.config);
        run_config.worker_cmd.push("--scanner-code-file".to_string());
        run_config.worker_cmd.push(code_path.to_string_lossy().to_string());

        let outcome = backtest::run_backtest(self.bars.clone(), &run_config, tickers, period.test_start, period.test_end).await;
        let _ = std::fs::remove_file(&code_path);

        let result = engine::run_templates(self.bars.as_ref(), run_config.timeframe, &outcome.signals);
        let winner_card = result
            .winner
            .and_then(|kind| result.scorecards.into_iter().find(|s| s.template == kind))
            .unwrap_or_else(|| engine::run_single_template(self.bars.as_ref(), run_config.timeframe, &[], TemplateKind::ConservativeScalper));

        let metrics = BacktestMetrics::from(&winner_card);

        let backtest = Backtest {
            id: Uuid::new_v4(),
            scanner_version_id: version.id,
            start_date: period.test_start,
            end_date: period.test_end,
            tickers: tickers.to_vec(),
            execution_template_id: template.id,
            signals: outcome.signals.clone(),
            trades: winner_card.trades.clone(),
            metrics: metrics.clone(),
            status: BacktestStatus::Completed,
            per_ticker_stats: outcome.per_ticker_stats,
            error: None,
            created_at: Utc::now(),
        };
        self.store.insert_backtest(&backtest)?;

        let mut iteration = Iteration::new(agent_id, 0);
        iteration.scanner_version_id = Some(version.id);
        iteration.backtest_id = Some(backtest.id);
        iteration.refinements = Refinements::default();
        iteration.trades_executed = winner_card.trade_count;
        iteration.signals_found = outcome.signals.len();
        iteration.status = IterationStatus::Completed;
        let iteration = self.store.insert_iteration(iteration)?;

        Ok(PeriodResult {
            period,
            iteration_id: iteration.id,
            backtest_id: backtest.id,
            trade_count: winner_card.trade_count,
            total_return: metrics.total_return,
        })
    }
}

struct Aggregate {
    mean: f64,
    std_dev: f64,
    t_statistic: f64,
    p_value: f64,
    confidence_interval_95: (f64, f64),
    consistency: f64,
}

/// Aggregates per-period test returns (§4.7 step 3, §8 scenario S6): mean,
/// sample standard deviation, one-sample t-test against zero, 95%
/// confidence interval, and consistency (share of periods with positive
/// return).
fn aggregate_returns(returns: &[f64]) -> Aggregate {
    let n = returns.len();
    if n == 0 {
        return Aggregate {
            mean: 0.0,
            std_dev: 0.0,
            t_statistic: 0.0,
            p_value: 1.0,
            confidence_interval_95: (0.0, 0.0),
            consistency: 0.0,
        };
    }

    let mean = returns.iter().sum::<f64>() / n as f64;
    let consistency = returns.iter().filter(|r| **r > 0.0).count() as f64 / n as f64;

    if n < 2 {
        return Aggregate {
            mean,
            std_dev: 0.0,
            t_statistic: 0.0,
            p_value: 1.0,
            confidence_interval_95: (mean, mean),
            consistency,
        };
    }

    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
    let std_dev = variance.sqrt();
    let standard_error = std_dev / (n as f64).sqrt();

    if standard_error == 0.0 {
        return Aggregate {
            mean,
            std_dev,
            t_statistic: 0.0,
            p_value: 1.0,
            confidence_interval_95: (mean, mean),
            consistency,
        };
    }

    let t_statistic = mean / standard_error;
    let degrees_of_freedom = (n - 1) as f64;
    let dist = StudentsT::new(0.0, 1.0, degrees_of_freedom).expect("valid Student's t parameters");

    let p_value = 2.0 * (1.0 - dist.cdf(t_statistic.abs()));
    let t_crit = dist.inverse_cdf(0.975);
    let margin = t_crit * standard_error;

    Aggregate {
        mean,
        std_dev,
        t_statistic,
        p_value,
        confidence_interval_95: (mean - margin, mean + margin),
        consistency,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expanding_window_produces_disjoint_non_overlapping_periods() {
        let start = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        let config = WalkForwardConfig {
            train_months: 3,
            test_months: 3,
            overlap_months: 0,
        };
        let periods = partition_periods(start, end, &config);
        assert_eq!(periods.len(), 3);
        for period in &periods {
            assert_eq!(period.test_start, period.train_end);
            assert!(period.test_start > period.train_end.pred_opt().unwrap());
        }
        assert_eq!(periods[0].train_start, start);
        assert_eq!(periods[1].train_start, start);
        assert_eq!(periods[2].train_start, start);
        assert_eq!(periods[2].test_end, end);
    }

    #[test]
    fn rolling_window_advances_train_start_by_the_step() {
        let start = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        let config = WalkForwardConfig {
            train_months: 6,
            test_months: 3,
            overlap_months: 2,
        };
        let periods = partition_periods(start, end, &config);
        assert!(periods.len() >= 2);
        assert_eq!(periods[1].train_start, add_months(start, 1));
        for period in &periods {
            assert_eq!(period.test_start, period.train_end);
        }
    }

    #[test]
    fn aggregate_matches_the_literal_walk_forward_scenario() {
        let aggregate = aggregate_returns(&[0.01, -0.02, 0.03]);
        assert!((aggregate.mean - 0.0067).abs() < 0.0001);
        assert!((aggregate.consistency - (2.0 / 3.0)).abs() < 1e-9);
        assert!(aggregate.std_dev > 0.0);
        assert!(aggregate.p_value >= 0.0 && aggregate.p_value <= 1.0);
    }

    #[test]
    fn zero_periods_is_an_error() {
        let start = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2025, 2, 1).unwrap();
        let config = WalkForwardConfig {
            train_months: 3,
            test_months: 3,
            overlap_months: 0,
        };
        assert!(partition_periods(start, end, &config).is_empty());
    }
}
