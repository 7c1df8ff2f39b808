//! Agent Knowledge entity (§3), extraction (§4.6 step 8), and decay (§4.6.1).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KnowledgeType {
    Insight,
    ParameterPref,
    PatternRule,
}

impl KnowledgeType {
    pub fn as_str(self) -> &'static str {
        match self {
            KnowledgeType::Insight => "INSIGHT",
            KnowledgeType::ParameterPref => "PARAMETER_PREF",
            KnowledgeType::PatternRule => "PATTERN_RULE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "INSIGHT" => Some(KnowledgeType::Insight),
            "PARAMETER_PREF" => Some(KnowledgeType::ParameterPref),
            "PATTERN_RULE" => Some(KnowledgeType::PatternRule),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentKnowledge {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub knowledge_type: KnowledgeType,
    pub pattern_type: Option<String>,
    pub insight_text: String,
    pub supporting_data: serde_json::Value,
    pub confidence: f64,
    pub learned_from_iteration: Uuid,
    pub times_validated: u32,
    pub last_validated: DateTime<Utc>,
    /// The projected performance metric recorded at learning time, used by
    /// the decay pass (§4.6.1) to detect under-delivery in later iterations.
    pub projected_metric: Option<f64>,
}

impl AgentKnowledge {
    /// Identity key for upsert-by-identity (§4.6 step 8, §9 "Knowledge
    /// deduplication"): (agent, type, pattern_type, normalized text).
    pub fn identity_key(&self) -> (Uuid, KnowledgeType, Option<String>, String) {
        (
            self.agent_id,
            self.knowledge_type,
            self.pattern_type.clone(),
            normalize_text(&self.insight_text),
        )
    }
}

/// Canonicalizes free text for identity comparisons: lowercase, collapsed
/// whitespace, trimmed.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Structured output of the LLM expert-analysis collaborator (§4.6 step 7,
/// §6 `analyzeResults`). The collaborator itself is out of scope (§1); this
/// is the shape the pipeline consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpertAnalysis {
    pub summary: String,
    pub working_elements: Vec<ScoredElement>,
    pub failure_points: Vec<String>,
    pub missing_context: Vec<String>,
    pub parameter_recommendations: Vec<ParameterRecommendation>,
    pub projected_performance: ProjectedPerformance,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredElement {
    pub description: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterRecommendation {
    pub parameter: String,
    pub recommendation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectedPerformance {
    pub metric: String,
    pub projected_value: f64,
    pub confidence: f64,
}

/// Maps one `ExpertAnalysis` into the knowledge rows it implies (§4.6 step
/// 8). Does not deduplicate against existing rows; that happens at the
/// store layer via `identity_key`.
pub fn extract_knowledge(
    agent_id: Uuid,
    iteration_id: Uuid,
    analysis: &ExpertAnalysis,
) -> Vec<AgentKnowledge> {
    let now = Utc::now();
    let mut rows = Vec::new();

    for rec in &analysis.parameter_recommendations {
        rows.push(AgentKnowledge {
            id: Uuid::new_v4(),
            agent_id,
            knowledge_type: KnowledgeType::ParameterPref,
            pattern_type: Some(rec.parameter.clone()),
            insight_text: rec.recommendation.clone(),
            supporting_data: serde_json::json!({ "parameter": rec.parameter }),
            confidence: analysis.projected_performance.confidence,
            learned_from_iteration: iteration_id,
            times_validated: 1,
            last_validated: now,
            projected_metric: Some(analysis.projected_performance.projected_value),
        });
    }

    for elem in &analysis.working_elements {
        rows.push(AgentKnowledge {
            id: Uuid::new_v4(),
            agent_id,
            knowledge_type: KnowledgeType::PatternRule,
            pattern_type: Some("positive".to_string()),
            insight_text: elem.description.clone(),
            supporting_data: serde_json::Value::Null,
            confidence: elem.confidence,
            learned_from_iteration: iteration_id,
            times_validated: 1,
            last_validated: now,
            projected_metric: None,
        });
    }

    for failure in &analysis.failure_points {
        rows.push(AgentKnowledge {
            id: Uuid::new_v4(),
            agent_id,
            knowledge_type: KnowledgeType::PatternRule,
            pattern_type: Some("negative".to_string()),
            insight_text: failure.clone(),
            supporting_data: serde_json::Value::Null,
            confidence: 0.8,
            learned_from_iteration: iteration_id,
            times_validated: 1,
            last_validated: now,
            projected_metric: None,
        });
    }

    for missing in &analysis.missing_context {
        rows.push(AgentKnowledge {
            id: Uuid::new_v4(),
            agent_id,
            knowledge_type: KnowledgeType::Insight,
            pattern_type: None,
            insight_text: missing.clone(),
            supporting_data: serde_json::Value::Null,
            confidence: 0.7,
            learned_from_iteration: iteration_id,
            times_validated: 1,
            last_validated: now,
            projected_metric: None,
        });
    }

    rows
}

/// Merges a freshly-extracted row into an existing one on re-encounter
/// (§4.6 step 8, §9): bumps `times_validated`, refreshes `last_validated`,
/// keeps the existing `id`/`learned_from_iteration` (history points at the
/// original learning event).
pub fn merge_reencounter(existing: &mut AgentKnowledge, fresh: &AgentKnowledge) {
    existing.times_validated += 1;
    existing.last_validated = fresh.last_validated;
    existing.confidence = existing.confidence.max(fresh.confidence);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_analysis() -> ExpertAnalysis {
        ExpertAnalysis {
            summary: "ok".to_string(),
            working_elements: vec![ScoredElement {
                description: "breakout entries worked well".to_string(),
                confidence: 0.9,
            }],
            failure_points: vec!["exits too early on pullbacks".to_string()],
            missing_context: vec!["no volume filter".to_string()],
            parameter_recommendations: vec![ParameterRecommendation {
                parameter: "stop_loss_pct".to_string(),
                recommendation: "widen to 2%".to_string(),
            }],
            projected_performance: ProjectedPerformance {
                metric: "win_rate".to_string(),
                projected_value: 0.6,
                confidence: 0.75,
            },
        }
    }

    #[test]
    fn extracts_one_row_per_bucket() {
        let agent_id = Uuid::new_v4();
        let iter_id = Uuid::new_v4();
        let rows = extract_knowledge(agent_id, iter_id, &sample_analysis());
        assert_eq!(rows.len(), 4);
        assert!(rows
            .iter()
            .any(|r| r.knowledge_type == KnowledgeType::ParameterPref && r.confidence == 0.75));
        assert!(rows.iter().any(|r| r.knowledge_type == KnowledgeType::Insight
            && r.confidence == 0.7));
        assert!(rows
            .iter()
            .filter(|r| r.knowledge_type == KnowledgeType::PatternRule)
            .count()
            == 2);
    }

    #[test]
    fn identity_key_normalizes_whitespace_and_case() {
        let a = AgentKnowledge {
            id: Uuid::new_v4(),
            agent_id: Uuid::nil(),
            knowledge_type: KnowledgeType::Insight,
            pattern_type: None,
            insight_text: "  No  Volume Filter ".to_string(),
            supporting_data: serde_json::Value::Null,
            confidence: 0.7,
            learned_from_iteration: Uuid::nil(),
            times_validated: 1,
            last_validated: Utc::now(),
            projected_metric: None,
        };
        let b_text = "no volume filter";
        assert_eq!(a.identity_key().3, normalize_text(b_text));
    }
}
