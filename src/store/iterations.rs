//! Iteration persistence (§3, §4.6).

use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use crate::bar_store::BarStoreError;
use crate::domain::iteration::{Iteration, IterationStatus, Refinements};
use crate::domain::knowledge::ExpertAnalysis;

use super::Store;

impl Store {
    /// Inserts `iteration` with `iteration_number` set to one past the
    /// agent's current max (starts at 1), mirroring scanner version
    /// numbering (§8.4).
    pub fn insert_iteration(&self, mut iteration: Iteration) -> Result<Iteration, BarStoreError> {
        let conn = self.conn.lock();
        let next: u32 = conn
            .query_row(
                "SELECT COALESCE(MAX(iteration_number), 0) + 1 FROM iterations WHERE agent_id = ?1",
                params![iteration.agent_id.to_string()],
                |row| row.get(0),
            )?;
        iteration.iteration_number = next;

        let analysis_json = iteration
            .analysis
            .as_ref()
            .map(|a| serde_json::to_string(a).unwrap_or_default());
        let refinements_json = serde_json::to_string(&iteration.refinements).unwrap_or_default();
        let failure_reasons_json = serde_json::to_string(&iteration.failure_reasons).unwrap_or_default();

        conn.execute(
            "INSERT INTO iterations (id, agent_id, iteration_number, scanner_version_id, backtest_id,
                analysis_json, refinements_json, status, trades_executed, signals_found,
                failure_reasons_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                iteration.id.to_string(),
                iteration.agent_id.to_string(),
                iteration.iteration_number,
                iteration.scanner_version_id.map(|id| id.to_string()),
                iteration.backtest_id.map(|id| id.to_string()),
                analysis_json,
                refinements_json,
                status_str(iteration.status),
                iteration.trades_executed as i64,
                iteration.signals_found as i64,
                failure_reasons_json,
                iteration.created_at.to_rfc3339(),
            ],
        )?;
        Ok(iteration)
    }

    pub fn get_iteration(&self, id: Uuid) -> Result<Option<Iteration>, BarStoreError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, agent_id, iteration_number, scanner_version_id, backtest_id, analysis_json,
                refinements_json, status, trades_executed, signals_found, failure_reasons_json, created_at
             FROM iterations WHERE id = ?1",
            params![id.to_string()],
            row_to_iteration,
        )
        .optional()
        .map_err(BarStoreError::from)
    }

    /// All iterations for `agent_id`, ascending by number — the sequence the
    /// Walk-Forward Coordinator and Agent Lifecycle Manager both fold over.
    pub fn list_iterations(&self, agent_id: Uuid) -> Result<Vec<Iteration>, BarStoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, agent_id, iteration_number, scanner_version_id, backtest_id, analysis_json,
                refinements_json, status, trades_executed, signals_found, failure_reasons_json, created_at
             FROM iterations WHERE agent_id = ?1 ORDER BY iteration_number ASC",
        )?;
        let rows = stmt.query_map(params![agent_id.to_string()], row_to_iteration)?;
        let mut iterations = Vec::new();
        for row in rows {
            iterations.push(row?);
        }
        Ok(iterations)
    }
}

fn status_str(status: IterationStatus) -> &'static str {
    match status {
        IterationStatus::Completed => "completed",
        IterationStatus::Failed => "failed",
        IterationStatus::Approved => "approved",
        IterationStatus::Rejected => "rejected",
    }
}

fn parse_status(s: &str) -> IterationStatus {
    match s {
        "approved" => IterationStatus::Approved,
        "rejected" => IterationStatus::Rejected,
        "failed" => IterationStatus::Failed,
        _ => IterationStatus::Completed,
    }
}

fn row_to_iteration(row: &rusqlite::Row<'_>) -> rusqlite::Result<Iteration> {
    let id: String = row.get(0)?;
    let agent_id: String = row.get(1)?;
    let scanner_version_id: Option<String> = row.get(3)?;
    let backtest_id: Option<String> = row.get(4)?;
    let analysis_json: Option<String> = row.get(5)?;
    let refinements_json: String = row.get(6)?;
    let status: String = row.get(7)?;
    let failure_reasons_json: String = row.get(10)?;
    let created_at: String = row.get(11)?;

    Ok(Iteration {
        id: parse_uuid(&id)?,
        agent_id: parse_uuid(&agent_id)?,
        iteration_number: row.get(2)?,
        scanner_version_id: scanner_version_id.map(|s| parse_uuid(&s)).transpose()?,
        backtest_id: backtest_id.map(|s| parse_uuid(&s)).transpose()?,
        analysis: analysis_json
            .and_then(|s| serde_json::from_str::<ExpertAnalysis>(&s).ok()),
        refinements: serde_json::from_str::<Refinements>(&refinements_json).unwrap_or_default(),
        status: parse_status(&status),
        trades_executed: row.get::<_, i64>(8)? as usize,
        signals_found: row.get::<_, i64>(9)? as usize,
        failure_reasons: serde_json::from_str(&failure_reasons_json).unwrap_or_default(),
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&chrono::Utc))
            .unwrap_or_else(|_| chrono::Utc::now()),
    })
}

fn parse_uuid(s: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(s)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iteration_numbers_are_monotone_per_agent() {
        let store = Store::open_in_memory().unwrap();
        let agent_id = Uuid::new_v4();
        let i1 = store.insert_iteration(Iteration::new(agent_id, 0)).unwrap();
        let i2 = store.insert_iteration(Iteration::new(agent_id, 0)).unwrap();
        assert_eq!(i1.iteration_number, 1);
        assert_eq!(i2.iteration_number, 2);
        assert_eq!(store.list_iterations(agent_id).unwrap().len(), 2);
    }
}
