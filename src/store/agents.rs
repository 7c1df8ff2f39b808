//! Agent persistence.

use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use crate::bar_store::BarStoreError;
use crate::domain::agent::{Agent, AgentStatus, Personality};

use super::Store;

impl Store {
    pub fn insert_agent(&self, agent: &Agent) -> Result<(), BarStoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO agents (id, name, instructions, risk_tolerance, trading_style, status,
                allow_multiple_signals_per_day, discovery_mode, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                agent.id.to_string(),
                agent.name,
                agent.instructions,
                agent.personality.risk_tolerance,
                agent.personality.trading_style,
                agent.status.as_str(),
                agent.allow_multiple_signals_per_day,
                agent.discovery_mode,
                agent.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_agent(&self, id: Uuid) -> Result<Option<Agent>, BarStoreError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, name, instructions, risk_tolerance, trading_style, status,
                allow_multiple_signals_per_day, discovery_mode, created_at
             FROM agents WHERE id = ?1",
            params![id.to_string()],
            row_to_agent,
        )
        .optional()
        .map_err(BarStoreError::from)
    }

    pub fn list_agents(&self) -> Result<Vec<Agent>, BarStoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, name, instructions, risk_tolerance, trading_style, status,
                allow_multiple_signals_per_day, discovery_mode, created_at
             FROM agents ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map([], row_to_agent)?;
        let mut agents = Vec::new();
        for row in rows {
            agents.push(row?);
        }
        Ok(agents)
    }

    pub fn update_agent_status(&self, id: Uuid, status: AgentStatus) -> Result<(), BarStoreError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE agents SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id.to_string()],
        )?;
        if changed == 0 {
            return Err(BarStoreError::NotFound);
        }
        Ok(())
    }
}

fn row_to_agent(row: &rusqlite::Row<'_>) -> rusqlite::Result<Agent> {
    let id: String = row.get(0)?;
    let status: String = row.get(5)?;
    let created_at: String = row.get(8)?;
    Ok(Agent {
        id: Uuid::parse_str(&id).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?,
        name: row.get(1)?,
        instructions: row.get(2)?,
        personality: Personality {
            risk_tolerance: row.get(3)?,
            trading_style: row.get(4)?,
        },
        status: AgentStatus::parse(&status).unwrap_or(AgentStatus::Learning),
        allow_multiple_signals_per_day: row.get(6)?,
        discovery_mode: row.get(7)?,
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&chrono::Utc))
            .unwrap_or_else(|_| chrono::Utc::now()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_an_agent() {
        let store = Store::open_in_memory().unwrap();
        let agent = Agent::new(
            "Momentum Hunter".to_string(),
            "Trade opening range breakouts".to_string(),
            Personality::default(),
        );
        store.insert_agent(&agent).unwrap();

        let fetched = store.get_agent(agent.id).unwrap().unwrap();
        assert_eq!(fetched.name, agent.name);
        assert_eq!(fetched.status, AgentStatus::Learning);

        store.update_agent_status(agent.id, AgentStatus::PaperTrading).unwrap();
        let fetched = store.get_agent(agent.id).unwrap().unwrap();
        assert_eq!(fetched.status, AgentStatus::PaperTrading);

        assert_eq!(store.list_agents().unwrap().len(), 1);
    }

    #[test]
    fn missing_agent_status_update_errors() {
        let store = Store::open_in_memory().unwrap();
        let err = store.update_agent_status(Uuid::new_v4(), AgentStatus::LiveTrading);
        assert!(err.is_err());
    }
}
