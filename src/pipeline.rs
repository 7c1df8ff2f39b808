//! Learning Iteration Pipeline (C6, §4.6): one closed round of scanner
//! generation, validation, backtesting, template scoring, expert analysis,
//! and knowledge accumulation for a single agent.

use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::bar_store::BarStore;
use crate::backtest::{self, BacktestRunConfig};
use crate::collaborator::LlmCollaborator;
use crate::config::Config;
use crate::domain::agent::Agent;
use crate::domain::backtest_record::{Backtest, BacktestMetrics, BacktestStatus};
use crate::domain::execution_template::ExecutionTemplate;
use crate::domain::iteration::{meets_approval_thresholds, ApprovalThresholds, Iteration, IterationStatus, Refinements};
use crate::domain::knowledge::{extract_knowledge, AgentKnowledge};
use crate::domain::scanner::{derive_name, ScannerVersion};
use crate::error::EngineError;
use crate::execution::engine::{self, ScoreCard};
use crate::execution::templates::TemplateKind;
use crate::store::Store;
use crate::validator;

const MAX_GENERATION_ATTEMPTS: u32 = 3;

/// Which execution code a caller wants resolved for an iteration (§4.6 step
/// 4): a named catalogue entry, or custom LLM-generated exit code.
#[derive(Debug, Clone)]
pub enum ExecutionChoice {
    Template(TemplateKind),
    Custom(String),
}

#[derive(Debug, Clone)]
pub struct IterationRequest {
    pub tickers: Vec<String>,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub execution: ExecutionChoice,
    pub manual_guidance: Option<String>,
    /// "Zero-signal explanation requested" (§4.6): when the backtest
    /// produces no trades, analysis normally is skipped; this flag forces
    /// a constrained "why zero?" analysis pass instead.
    pub explain_zero_signal: bool,
}

pub struct LearningPipeline<'a> {
    store: &'a Store,
    bars: Arc<dyn BarStore>,
    collaborator: Arc<dyn LlmCollaborator>,
    config: &'a Config,
}

impl<'a> LearningPipeline<'a> {
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

    /// Runs one full iteration for `agent_id` (§4.6 steps 1-10). Always
    /// returns an `Iteration`, even on validation/backtest failure — failure
    /// is carried in `Iteration.status`/`failure_reasons`, not propagated as
    /// an `Err`, matching §7's "iteration-level failures surface as status,
    /// never as unhandled crashes".
    pub async fn run_iteration(&self, agent_id: Uuid, request: IterationRequest) -> Result<Iteration, EngineError> {
        let agent = self
            .store
            .get_agent(agent_id)?
            .ok_or_else(|| EngineError::Internal(format!("unknown agent {agent_id}")))?;

        let knowledge_before = self.store.list_knowledge(agent_id)?;
        let knowledge_summary = summarize_knowledge(&knowledge_before);

        // Step 1-2: generate and validate, retrying up to MAX_GENERATION_ATTEMPTS.
        let code = match generate_and_validate(
            self.collaborator.as_ref(),
            &agent.instructions,
            &knowledge_summary,
            request.manual_guidance.clone(),
        )
        .await
        {
            Ok(code) => code,
            Err(violations) => {
                let mut iteration = Iteration::new(agent_id, 0);
                iteration.status = IterationStatus::Failed;
                iteration.failure_reasons = violations;
                return self.store.insert_iteration(iteration).map_err(EngineError::from);
            }
        };

        // Step 3: persist scanner version.
        let version = self.store.insert_scanner_version(ScannerVersion {
            id: Uuid::new_v4(),
            agent_id,
            version_number: 0, // server-assigned
            name: derive_name(&agent.instructions, 0),
            code,
            model_tag: "collaborator".to_string(),
            generation_prompt: agent.instructions.clone(),
            created_at: Utc::now(),
        })?;

        // Step 4: resolve and persist the requested execution code for
        // provenance. Actual trade simulation (step 6) always runs the full
        // fixed catalogue (§4.4) since there is no runtime for arbitrary
        // generated exit code (a Non-goal, §1); see DESIGN.md.
        let requested_template = self.persist_requested_execution(&request.execution)?;

        // Step 5: backtest. The worker command is the configured reference
        // host plus a pointer to this iteration's freshly generated scanner
        // code — the protocol itself (§4.2) carries only bar state and a
        // database path, so the code has to reach the worker through argv.
        let code_path = write_scanner_code_file(&version.code)?;
        let mut run_config = BacktestRunConfig::from_config(self.config);
        run_config.worker_cmd.push("--scanner-code-file".to_string());
        run_config.worker_cmd.push(code_path.to_string_lossy().to_string());

        let outcome = backtest::run_backtest(
            self.bars.clone(),
            &run_config,
            &request.tickers,
            request.start,
            request.end,
        )
        .await;
        let _ = std::fs::remove_file(&code_path);

        // Step 6: score templates.
        let (winner_card, execution_template_id) = if agent.discovery_mode {
            let card = engine::run_single_template(
                self.bars.as_ref(),
                run_config.timeframe,
                &outcome.signals,
                TemplateKind::ConservativeScalper,
            );
            let row = self.catalogue_row(TemplateKind::ConservativeScalper)?;
            (card, row.id)
        } else {
            let result = engine::run_templates(self.bars.as_ref(), run_config.timeframe, &outcome.signals);
            let winner = result.winner;
            let card = winner
                .and_then(|kind| result.scorecards.iter().find(|s| s.template == kind).cloned())
                .unwrap_or_else(|| empty_card_for(TemplateKind::ConservativeScalper));
            let row_id = match winner {
                Some(kind) => self.catalogue_row(kind)?.id,
                None => requested_template.id,
            };
            (card, row_id)
        };

        let metrics = BacktestMetrics::from(&winner_card);

        let backtest = Backtest {
            id: Uuid::new_v4(),
            scanner_version_id: version.id,
            start_date: request.start,
            end_date: request.end,
            tickers: request.tickers.clone(),
            execution_template_id,
            signals: outcome.signals.clone(),
            trades: winner_card.trades.clone(),
            metrics: metrics.clone(),
            status: BacktestStatus::Completed,
            per_ticker_stats: outcome.per_ticker_stats.clone(),
            error: None,
            created_at: Utc::now(),
        };
        self.store.insert_backtest(&backtest)?;

        // Step 7-8: analyze and extract knowledge, unless discovery mode or
        // a silent zero-trade result (§4.6 "Discovery mode" / "Zero-signal case").
        let zero_trades = winner_card.trade_count == 0;
        let skip_analysis = agent.discovery_mode || (zero_trades && !request.explain_zero_signal);

        let mut analysis = None;
        let mut extracted = Vec::new();
        let mut refinements = Refinements::default();

        if !skip_analysis {
            let expert = self
                .collaborator
                .analyze_results(&winner_card.trades, &agent.personality)
                .await
                .map_err(|e| EngineError::Internal(format!("result analysis failed: {e}")))?;

            let iteration_id_placeholder = Uuid::new_v4();
            extracted = extract_knowledge(agent_id, iteration_id_placeholder, &expert);
            refinements.changes = expert
                .parameter_recommendations
                .iter()
                .map(|r| format!("{}: {}", r.parameter, r.recommendation))
                .collect();
            analysis = Some(expert);

            for row in &extracted {
                self.store.upsert_knowledge(row.clone())?;
            }
        }

        // §4.6.1: decay knowledge recorded before this iteration whose
        // projected performance under-delivered relative to this iteration's
        // realized win rate. Newly extracted rows above are never decayed
        // in the same pass.
        let under_delivering: Vec<Uuid> = knowledge_before
            .iter()
            .filter(|k| {
                k.projected_metric
                    .map(|projected| projected > 0.0 && metrics.win_rate < projected * 0.8)
                    .unwrap_or(false)
            })
            .map(|k| k.id)
            .collect();
        if !under_delivering.is_empty() {
            let deleted = self
                .store
                .decay_knowledge(agent_id, &under_delivering, self.config.knowledge_decay_step)?;
            info!(%agent_id, decayed = under_delivering.len(), deleted, "applied knowledge decay");
        }

        // Step 9-10: persist iteration, evaluating auto-approval.
        let mut iteration = Iteration::new(agent_id, 0);
        iteration.scanner_version_id = Some(version.id);
        iteration.backtest_id = Some(backtest.id);
        iteration.analysis = analysis;
        iteration.refinements = refinements;
        iteration.trades_executed = winner_card.trade_count;
        iteration.signals_found = outcome.signals.len();
        iteration.status = IterationStatus::Completed;

        let improved = self.count_improved_metrics(&agent, &metrics)?;
        let thresholds = ApprovalThresholds::default();
        if meets_approval_thresholds(
            metrics.win_rate,
            metrics.sharpe_ratio,
            metrics.total_return,
            metrics.trade_count,
            improved,
            &thresholds,
        ) {
            iteration.status = IterationStatus::Approved;
        }

        let iteration = self.store.insert_iteration(iteration)?;

        // Re-point the freshly extracted knowledge at the real iteration id
        // now that it exists (avoids a chicken-and-egg insert order).
        for mut row in extracted {
            row.learned_from_iteration = iteration.id;
            self.store.upsert_knowledge(row)?;
        }

        info!(%agent_id, iteration = iteration.iteration_number, status = ?iteration.status, "iteration complete");
        Ok(iteration)
    }

    fn persist_requested_execution(&self, choice: &ExecutionChoice) -> Result<ExecutionTemplate, EngineError> {
        let template = match choice {
            ExecutionChoice::Template(kind) => {
                ExecutionTemplate::new(kind.name().to_string(), kind.canonical_code())
            }
            ExecutionChoice::Custom(code) => ExecutionTemplate::new("Custom Execution".to_string(), code.clone()),
        };
        self.store.get_or_create_execution_template(template).map_err(EngineError::from)
    }

    fn catalogue_row(&self, kind: TemplateKind) -> Result<ExecutionTemplate, EngineError> {
        self.store
            .get_or_create_execution_template(ExecutionTemplate::new(kind.name().to_string(), kind.canonical_code()))
            .map_err(EngineError::from)
    }

    /// Counts how many of {win_rate, sharpe, total_return} improved versus
    /// the agent's most recent prior completed/approved backtest (§4.6 step
    /// 10 "improvement in >= 2 of 3 metrics over current strategy"). With no
    /// prior backtest, nothing has a baseline to beat, so the count is 0.
    fn count_improved_metrics(&self, agent: &Agent, metrics: &BacktestMetrics) -> Result<u32, EngineError> {
        let iterations = self.store.list_iterations(agent.id)?;
        let Some(previous) = iterations
            .iter()
            .rev()
            .filter_map(|it| it.backtest_id)
            .filter_map(|id| self.store.get_backtest(id).ok().flatten())
            .next()
        else {
            return Ok(0);
        };

        let mut improved = 0;
        if metrics.win_rate > previous.metrics.win_rate {
            improved += 1;
        }
        if metrics.sharpe_ratio > previous.metrics.sharpe_ratio {
            improved += 1;
        }
        if metrics.total_return > previous.metrics.total_return {
            improved += 1;
        }
        Ok(improved)
    }
}

/// Generates a scanner against the validator, retrying with the prior
/// violations folded into the guidance up to `MAX_GENERATION_ATTEMPTS` times
/// (§4.6 steps 1-2). Shared by the per-iteration pipeline and the
/// Walk-Forward Coordinator's one-shot `P_1` generation (§4.7).
pub(crate) async fn generate_and_validate(
    collaborator: &dyn LlmCollaborator,
    instructions: &str,
    knowledge_summary: &str,
    manual_guidance: Option<String>,
) -> Result<String, Vec<String>> {
    let mut guidance = manual_guidance;
    let mut last_violations: Vec<String> = Vec::new();

    for attempt in 1..=MAX_GENERATION_ATTEMPTS {
        let code = match collaborator
            .generate_scanner(instructions, knowledge_summary, guidance.as_deref())
            .await
        {
            Ok(code) => code,
            Err(e) => {
                last_violations = vec![format!("generation failed: {e}")];
                continue;
            }
        };

        let result = validator::validate(&code);
        if result.is_valid {
            return Ok(code);
        }

        last_violations = result.violations.iter().map(|v| v.to_string()).collect();
        warn!(attempt, violations = ?last_violations, "scanner failed validation");
        guidance = Some(format!(
            "{}\nPrevious attempt was rejected: {}",
            guidance.clone().unwrap_or_default(),
            last_violations.join("; ")
        ));
    }

    Err(last_violations)
}

pub(crate) fn write_scanner_code_file(code: &str) -> Result<std::path::PathBuf, EngineError> {
    let mut path = std::env::temp_dir();
    path.push(format!("intraday-lab-scanner-{}.js", Uuid::new_v4()));
    std::fs::write(&path, code)
        .map_err(|e| EngineError::Internal(format!("writing scanner code file: {e}")))?;
    Ok(path)
}

fn empty_card_for(kind: TemplateKind) -> ScoreCard {
    // `ScoreCard::empty` is private to `execution::engine`; round-trip
    // through a zero-trade run to get the same shape without duplicating it.
    engine::run_single_template(&crate::bar_store::InMemoryBarStore::new(), crate::bar_store::Timeframe::FIVE_MIN, &[], kind)
}

fn summarize_knowledge(rows: &[AgentKnowledge]) -> String {
    if rows.is_empty() {
        return "No accumulated knowledge yet.".to_string();
    }
    rows.iter()
        .map(|k| format!("[{}] {} (confidence {:.2})", k.knowledge_type.as_str(), k.insight_text, k.confidence))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bar_store::{Bar, InMemoryBarStore, Timeframe};
    use crate::collaborator::FixedCollaborator;
    use crate::domain::agent::{Agent, Personality};
    use crate::domain::knowledge::{ExpertAnalysis, ParameterRecommendation, ProjectedPerformance, ScoredElement};
    use crate::market_hours;
    use chrono::NaiveTime;

    fn seed_bars(store: &dyn BarStore, ticker: &str, day: NaiveDate) {
        let mut bars = Vec::new();
        let mut t = NaiveTime::from_hms_opt(9, 30, 0).unwrap();
        let mut price = 10.0;
        for _ in 0..40 {
            bars.push(Bar {
                ticker: ticker.to_string(),
                timeframe: Timeframe::FIVE_MIN,
                timestamp_utc: market_hours::eastern_date_time_to_utc(day, t),
                open: price,
                high: price + 0.3,
                low: price - 0.1,
                close: price + 0.2,
                volume: 1_000.0,
            });
            price += 0.2;
            t += chrono::Duration::minutes(5);
        }
        store.write_bars(&bars).unwrap();
    }

    fn fixed_analysis() -> ExpertAnalysis {
        ExpertAnalysis {
            summary: "performs well on breakouts".to_string(),
            working_elements: vec![ScoredElement {
                description: "entries after volume spikes".to_string(),
                confidence: 0.8,
            }],
            failure_points: vec!["no filter for chop".to_string()],
            missing_context: vec!["sector context missing".to_string()],
            parameter_recommendations: vec![ParameterRecommendation {
                parameter: "stop_loss_pct".to_string(),
                recommendation: "tighten to 1.5%".to_string(),
            }],
            projected_performance: ProjectedPerformance {
                metric: "win_rate".to_string(),
                projected_value: 0.9,
                confidence: 0.8,
            },
        }
    }

    #[tokio::test]
    async fn runs_a_full_iteration_and_extracts_knowledge() {
        let store = Store::open_in_memory().unwrap();
        let bars = Arc::new(InMemoryBarStore::new());
        let day = NaiveDate::from_ymd_opt(2025, 10, 15).unwrap();
        seed_bars(bars.as_ref(), "AAA", day);

        let agent = Agent::new("Momentum".to_string(), "buy breakouts".to_string(), Personality::default());
        store.insert_agent(&agent).unwrap();

        let collaborator = Arc::new(FixedCollaborator {
            scanner_code: "function scan(bars) {\n  const i = bars.length - 1;\n  const last = bars[i];\n  if (last.close > last.open) { return emitSignal(last.time, \"LONG\"); }\n  return null;\n}".to_string(),
            analysis: fixed_analysis(),
            custom_execution_code: "stop_loss=0.02\n".to_string(),
        });

        let config = Config::default();
        let pipeline = LearningPipeline::new(&store, bars, collaborator, &config);

        // `explain_zero_signal: true` forces the analysis/knowledge-extraction
        // steps regardless of whether the backtest produced trades, so this
        // assertion holds whether or not a `scanner_host` binary is reachable
        // in the test environment's PATH.
        let request = IterationRequest {
            tickers: vec!["AAA".to_string()],
            start: day,
            end: day,
            execution: ExecutionChoice::Template(TemplateKind::ConservativeScalper),
            manual_guidance: None,
            explain_zero_signal: true,
        };

        let iteration = pipeline.run_iteration(agent.id, request).await.unwrap();
        assert_eq!(iteration.iteration_number, 1);
        assert!(iteration.scanner_version_id.is_some());
        assert!(iteration.backtest_id.is_some());

        let knowledge = store.list_knowledge(agent.id).unwrap();
        assert!(!knowledge.is_empty());
    }

    #[tokio::test]
    async fn rejects_a_look_ahead_scanner_after_retries() {
        let store = Store::open_in_memory().unwrap();
        let bars = Arc::new(InMemoryBarStore::new());
        let day = NaiveDate::from_ymd_opt(2025, 10, 15).unwrap();
        seed_bars(bars.as_ref(), "AAA", day);

        let agent = Agent::new("Bad".to_string(), "sort and signal".to_string(), Personality::default());
        store.insert_agent(&agent).unwrap();

        let collaborator = Arc::new(FixedCollaborator {
            scanner_code: r#"
                function scan(bars) {
                    const sorted = [...bars].sort((a, b) => b.high - a.high);
                    const top = sorted[0];
                    return emitSignal(top.time, "LONG");
                }
            "#
            .to_string(),
            analysis: fixed_analysis(),
            custom_execution_code: "stop_loss=0.02\n".to_string(),
        });

        let config = Config::default();
        let pipeline = LearningPipeline::new(&store, bars, collaborator, &config);
        let request = IterationRequest {
            tickers: vec!["AAA".to_string()],
            start: day,
            end: day,
            execution: ExecutionChoice::Template(TemplateKind::ConservativeScalper),
            manual_guidance: None,
            explain_zero_signal: false,
        };

        let iteration = pipeline.run_iteration(agent.id, request).await.unwrap();
        assert_eq!(iteration.status, IterationStatus::Failed);
        assert!(!iteration.failure_reasons.is_empty());
        assert!(iteration.scanner_version_id.is_none());
    }
}
