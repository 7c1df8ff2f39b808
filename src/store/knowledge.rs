//! Agent Knowledge persistence: upsert-by-identity (§4.6 step 8, §9) and the
//! confidence decay pass (§4.6.1).

use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use crate::bar_store::BarStoreError;
use crate::domain::knowledge::{merge_reencounter, normalize_text, AgentKnowledge, KnowledgeType};

use super::Store;

impl Store {
    /// Inserts `knowledge`, or — if a row already exists with the same
    /// identity key (agent, type, pattern_type, normalized text) — merges
    /// into it via [`merge_reencounter`] instead of creating a duplicate.
    pub fn upsert_knowledge(&self, knowledge: AgentKnowledge) -> Result<AgentKnowledge, BarStoreError> {
        let conn = self.conn.lock();
        let normalized = normalize_text(&knowledge.insight_text);
        let existing = conn
            .query_row(
                "SELECT id, agent_id, knowledge_type, pattern_type, insight_text, supporting_data_json,
                    confidence, learned_from_iteration, times_validated, last_validated, projected_metric
                 FROM agent_knowledge
                 WHERE agent_id = ?1 AND knowledge_type = ?2
                   AND pattern_type IS ?3 AND normalized_text = ?4",
                params![
                    knowledge.agent_id.to_string(),
                    knowledge.knowledge_type.as_str(),
                    knowledge.pattern_type,
                    normalized,
                ],
                row_to_knowledge,
            )
            .optional()?;

        if let Some(mut existing) = existing {
            merge_reencounter(&mut existing, &knowledge);
            conn.execute(
                "UPDATE agent_knowledge SET confidence = ?1, times_validated = ?2, last_validated = ?3
                 WHERE id = ?4",
                params![
                    existing.confidence,
                    existing.times_validated,
                    existing.last_validated.to_rfc3339(),
                    existing.id.to_string(),
                ],
            )?;
            return Ok(existing);
        }

        let supporting_data_json = serde_json::to_string(&knowledge.supporting_data).unwrap_or_default();
        conn.execute(
            "INSERT INTO agent_knowledge (id, agent_id, knowledge_type, pattern_type, insight_text,
                normalized_text, supporting_data_json, confidence, learned_from_iteration,
                times_validated, last_validated, projected_metric)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                knowledge.id.to_string(),
                knowledge.agent_id.to_string(),
                knowledge.knowledge_type.as_str(),
                knowledge.pattern_type,
                knowledge.insight_text,
                normalized,
                supporting_data_json,
                knowledge.confidence,
                knowledge.learned_from_iteration.to_string(),
                knowledge.times_validated,
                knowledge.last_validated.to_rfc3339(),
                knowledge.projected_metric,
            ],
        )?;
        Ok(knowledge)
    }

    pub fn list_knowledge(&self, agent_id: Uuid) -> Result<Vec<AgentKnowledge>, BarStoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, agent_id, knowledge_type, pattern_type, insight_text, supporting_data_json,
                confidence, learned_from_iteration, times_validated, last_validated, projected_metric
             FROM agent_knowledge WHERE agent_id = ?1 ORDER BY confidence DESC",
        )?;
        let rows = stmt.query_map(params![agent_id.to_string()], row_to_knowledge)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Applies the decay pass (§4.6.1): every knowledge row whose
    /// `projected_metric` was not matched by the iteration's actual result
    /// loses `step` confidence; rows that drop below 0.1 are deleted
    /// outright rather than kept at a near-zero confidence. Returns the
    /// number of rows deleted.
    pub fn decay_knowledge(
        &self,
        agent_id: Uuid,
        under_delivering: &[Uuid],
        step: f64,
    ) -> Result<usize, BarStoreError> {
        let conn = self.conn.lock();
        for id in under_delivering {
            conn.execute(
                "UPDATE agent_knowledge SET confidence = confidence - ?1
                 WHERE id = ?2 AND agent_id = ?3",
                params![step, id.to_string(), agent_id.to_string()],
            )?;
        }
        let deleted = conn.execute(
            "DELETE FROM agent_knowledge WHERE agent_id = ?1 AND confidence < 0.1",
            params![agent_id.to_string()],
        )?;
        Ok(deleted)
    }
}

fn row_to_knowledge(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentKnowledge> {
    let id: String = row.get(0)?;
    let agent_id: String = row.get(1)?;
    let knowledge_type: String = row.get(2)?;
    let supporting_data_json: String = row.get(5)?;
    let learned_from_iteration: String = row.get(7)?;
    let last_validated: String = row.get(9)?;

    Ok(AgentKnowledge {
        id: parse_uuid(&id)?,
        agent_id: parse_uuid(&agent_id)?,
        knowledge_type: KnowledgeType::parse(&knowledge_type).unwrap_or(KnowledgeType::Insight),
        pattern_type: row.get(3)?,
        insight_text: row.get(4)?,
        supporting_data: serde_json::from_str(&supporting_data_json).unwrap_or(serde_json::Value::Null),
        confidence: row.get(6)?,
        learned_from_iteration: parse_uuid(&learned_from_iteration)?,
        times_validated: row.get(8)?,
        last_validated: chrono::DateTime::parse_from_rfc3339(&last_validated)
            .map(|dt| dt.with_timezone(&chrono::Utc))
            .unwrap_or_else(|_| chrono::Utc::now()),
        projected_metric: row.get(10)?,
    })
}

fn parse_uuid(s: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(s)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample(agent_id: Uuid, text: &str) -> AgentKnowledge {
        AgentKnowledge {
            id: Uuid::new_v4(),
            agent_id,
            knowledge_type: KnowledgeType::Insight,
            pattern_type: None,
            insight_text: text.to_string(),
            supporting_data: serde_json::Value::Null,
            confidence: 0.7,
            learned_from_iteration: Uuid::new_v4(),
            times_validated: 1,
            last_validated: Utc::now(),
            projected_metric: Some(0.5),
        }
    }

    #[test]
    fn reencountered_insight_merges_instead_of_duplicating() {
        let store = Store::open_in_memory().unwrap();
        let agent_id = Uuid::new_v4();
        let first = store.upsert_knowledge(sample(agent_id, "No volume filter")).unwrap();
        assert_eq!(first.times_validated, 1);

        let mut second = sample(agent_id, "  no   volume filter ");
        second.confidence = 0.9;
        let merged = store.upsert_knowledge(second).unwrap();

        assert_eq!(merged.id, first.id);
        assert_eq!(merged.times_validated, 2);
        assert_eq!(merged.confidence, 0.9);
        assert_eq!(store.list_knowledge(agent_id).unwrap().len(), 1);
    }

    #[test]
    fn decay_deletes_rows_below_the_floor() {
        let store = Store::open_in_memory().unwrap();
        let agent_id = Uuid::new_v4();
        let mut low = sample(agent_id, "marginal edge");
        low.confidence = 0.15;
        let low = store.upsert_knowledge(low).unwrap();

        let deleted = store.decay_knowledge(agent_id, &[low.id], 0.1).unwrap();
        assert_eq!(deleted, 1);
        assert!(store.list_knowledge(agent_id).unwrap().is_empty());
    }
}
