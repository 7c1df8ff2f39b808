//! LLM Collaborator (§6): the thin, out-of-scope interface to the
//! natural-language-to-code and analysis capabilities the Learning Iteration
//! Pipeline depends on. Concrete implementations (an HTTP client to a model
//! provider, a scripted fixture for tests) live outside this crate; this
//! module only fixes the contract.

use async_trait::async_trait;

use crate::domain::knowledge::ExpertAnalysis;
use crate::domain::trade::Trade;

#[async_trait]
pub trait LlmCollaborator: Send + Sync {
    /// `generateScanner(instructions, knowledge_summary, manual_guidance) -> code` (§6).
    async fn generate_scanner(
        &self,
        instructions: &str,
        knowledge_summary: &str,
        manual_guidance: Option<&str>,
    ) -> anyhow::Result<String>;

    /// `analyzeResults(trades, personality) -> ExpertAnalysis` (§6).
    async fn analyze_results(
        &self,
        trades: &[Trade],
        personality: &crate::domain::agent::Personality,
    ) -> anyhow::Result<ExpertAnalysis>;

    /// `extractDates(prompt, ticker, today) -> [date]` (§6, optional helper).
    async fn extract_dates(
        &self,
        prompt: &str,
        ticker: &str,
        today: chrono::NaiveDate,
    ) -> anyhow::Result<Vec<chrono::NaiveDate>>;

    /// `generateCustomExecution(signals_sample, personality) -> code` (§6, optional).
    async fn generate_custom_execution(
        &self,
        signals_sample: &[crate::signal::Signal],
        personality: &crate::domain::agent::Personality,
    ) -> anyhow::Result<String>;
}

/// A scripted collaborator for tests and offline runs: returns fixed
/// responses instead of calling out to a model provider. Mirrors the
/// teacher's fixture-backed test doubles for external services.
pub struct FixedCollaborator {
    pub scanner_code: String,
    pub analysis: ExpertAnalysis,
    pub custom_execution_code: String,
}

/// The `lab` binary's default collaborator when no external model provider
/// is configured: emits a fixed conservative-breakout `RuleSet` (§4.2.1) so
/// `scanner_host` has something executable to run, rather than silently
/// producing signal-free iterations. Picks `Short` when the agent's
/// instructions mention "short"/"fade"/"down", `Long` otherwise — a coarse
/// reading of intent, not a stand-in for the out-of-scope LLM call.
pub struct StaticRuleCollaborator;

#[async_trait]
impl LlmCollaborator for StaticRuleCollaborator {
    async fn generate_scanner(
        &self,
        instructions: &str,
        _knowledge_summary: &str,
        _manual_guidance: Option<&str>,
    ) -> anyhow::Result<String> {
        let lower = instructions.to_lowercase();
        let direction = if ["short", "fade", "down"].iter().any(|w| lower.contains(w)) {
            crate::signal::Direction::Short
        } else {
            crate::signal::Direction::Long
        };
        let rule_set = crate::worker::rule::RuleSet {
            rules: vec![crate::worker::rule::Rule {
                direction,
                pattern_strength: 65.0,
                conditions: vec![match direction {
                    crate::signal::Direction::Long => crate::worker::rule::Condition::CloseAboveOpen,
                    crate::signal::Direction::Short => crate::worker::rule::Condition::CloseBelowOpen,
                }],
            }],
        };
        Ok(serde_json::to_string_pretty(&rule_set)?)
    }

    async fn analyze_results(
        &self,
        trades: &[Trade],
        _personality: &crate::domain::agent::Personality,
    ) -> anyhow::Result<ExpertAnalysis> {
        use crate::domain::knowledge::{ParameterRecommendation, ProjectedPerformance, ScoredElement};

        let win_rate = if trades.is_empty() {
            0.0
        } else {
            trades.iter().filter(|t| t.is_win()).count() as f64 / trades.len() as f64
        };
        Ok(ExpertAnalysis {
            summary: format!("{} trades simulated, {:.0}% win rate", trades.len(), win_rate * 100.0),
            working_elements: vec![ScoredElement {
                description: "directional bias matched the realized bar moves".to_string(),
                confidence: win_rate,
            }],
            failure_points: if win_rate < 0.5 {
                vec!["entry condition alone does not filter enough chop".to_string()]
            } else {
                Vec::new()
            },
            missing_context: vec!["no external model provider configured".to_string()],
            parameter_recommendations: vec![ParameterRecommendation {
                parameter: "pattern_strength".to_string(),
                recommendation: "raise threshold if win rate stays below 0.5".to_string(),
            }],
            projected_performance: ProjectedPerformance {
                metric: "win_rate".to_string(),
                projected_value: win_rate,
                confidence: 0.4,
            },
        })
    }

    async fn extract_dates(
        &self,
        _prompt: &str,
        _ticker: &str,
        today: chrono::NaiveDate,
    ) -> anyhow::Result<Vec<chrono::NaiveDate>> {
        Ok(vec![today])
    }

    async fn generate_custom_execution(
        &self,
        _signals_sample: &[crate::signal::Signal],
        _personality: &crate::domain::agent::Personality,
    ) -> anyhow::Result<String> {
        Ok(crate::execution::templates::TemplateKind::ConservativeScalper.canonical_code())
    }
}

#[async_trait]
impl LlmCollaborator for FixedCollaborator {
    async fn generate_scanner(
        &self,
        _instructions: &str,
        _knowledge_summary: &str,
        _manual_guidance: Option<&str>,
    ) -> anyhow::Result<String> {
        Ok(self.scanner_code.clone())
    }

    async fn analyze_results(
        &self,
        _trades: &[Trade],
        _personality: &crate::domain::agent::Personality,
    ) -> anyhow::Result<ExpertAnalysis> {
        Ok(self.analysis.clone())
    }

    async fn extract_dates(
        &self,
        _prompt: &str,
        _ticker: &str,
        today: chrono::NaiveDate,
    ) -> anyhow::Result<Vec<chrono::NaiveDate>> {
        Ok(vec![today])
    }

    async fn generate_custom_execution(
        &self,
        _signals_sample: &[crate::signal::Signal],
        _personality: &crate::domain::agent::Personality,
    ) -> anyhow::Result<String> {
        Ok(self.custom_execution_code.clone())
    }
}
