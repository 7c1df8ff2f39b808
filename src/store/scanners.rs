//! Scanner Version persistence (§3, §8.4 "version numbers are monotone").

use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use crate::bar_store::BarStoreError;
use crate::domain::scanner::ScannerVersion;

use super::Store;

impl Store {
    /// Inserts `version` with `version_number` set to one past the agent's
    /// current max (starts at 1), ignoring whatever `version.version_number`
    /// carried in — monotonicity is the store's job, not the caller's.
    pub fn insert_scanner_version(
        &self,
        mut version: ScannerVersion,
    ) -> Result<ScannerVersion, BarStoreError> {
        let conn = self.conn.lock();
        let next: u32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version_number), 0) + 1 FROM scanner_versions WHERE agent_id = ?1",
                params![version.agent_id.to_string()],
                |row| row.get(0),
            )?;
        version.version_number = next;

        conn.execute(
            "INSERT INTO scanner_versions (id, agent_id, version_number, name, code, model_tag,
                generation_prompt, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                version.id.to_string(),
                version.agent_id.to_string(),
                version.version_number,
                version.name,
                version.code,
                version.model_tag,
                version.generation_prompt,
                version.created_at.to_rfc3339(),
            ],
        )?;
        Ok(version)
    }

    pub fn get_scanner_version(&self, id: Uuid) -> Result<Option<ScannerVersion>, BarStoreError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, agent_id, version_number, name, code, model_tag, generation_prompt, created_at
             FROM scanner_versions WHERE id = ?1",
            params![id.to_string()],
            row_to_scanner_version,
        )
        .optional()
        .map_err(BarStoreError::from)
    }

    pub fn latest_scanner_version(&self, agent_id: Uuid) -> Result<Option<ScannerVersion>, BarStoreError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, agent_id, version_number, name, code, model_tag, generation_prompt, created_at
             FROM scanner_versions WHERE agent_id = ?1 ORDER BY version_number DESC LIMIT 1",
            params![agent_id.to_string()],
            row_to_scanner_version,
        )
        .optional()
        .map_err(BarStoreError::from)
    }

    pub fn list_scanner_versions(&self, agent_id: Uuid) -> Result<Vec<ScannerVersion>, BarStoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, agent_id, version_number, name, code, model_tag, generation_prompt, created_at
             FROM scanner_versions WHERE agent_id = ?1 ORDER BY version_number ASC",
        )?;
        let rows = stmt.query_map(params![agent_id.to_string()], row_to_scanner_version)?;
        let mut versions = Vec::new();
        for row in rows {
            versions.push(row?);
        }
        Ok(versions)
    }
}

fn row_to_scanner_version(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScannerVersion> {
    let id: String = row.get(0)?;
    let agent_id: String = row.get(1)?;
    let created_at: String = row.get(7)?;
    Ok(ScannerVersion {
        id: parse_uuid(&id)?,
        agent_id: parse_uuid(&agent_id)?,
        version_number: row.get(2)?,
        name: row.get(3)?,
        code: row.get(4)?,
        model_tag: row.get(5)?,
        generation_prompt: row.get(6)?,
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
    use chrono::Utc;

    fn sample(agent_id: Uuid) -> ScannerVersion {
        ScannerVersion {
            id: Uuid::new_v4(),
            agent_id,
            version_number: 0,
            name: "placeholder".to_string(),
            code: "function scan(bars) { return null; }".to_string(),
            model_tag: "test-model".to_string(),
            generation_prompt: "buy breakouts".to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn version_numbers_are_monotone_per_agent() {
        let store = Store::open_in_memory().unwrap();
        let agent_id = Uuid::new_v4();
        let v1 = store.insert_scanner_version(sample(agent_id)).unwrap();
        let v2 = store.insert_scanner_version(sample(agent_id)).unwrap();
        assert_eq!(v1.version_number, 1);
        assert_eq!(v2.version_number, 2);

        let other_agent = Uuid::new_v4();
        let v1_other = store.insert_scanner_version(sample(other_agent)).unwrap();
        assert_eq!(v1_other.version_number, 1);

        let latest = store.latest_scanner_version(agent_id).unwrap().unwrap();
        assert_eq!(latest.version_number, 2);
        assert_eq!(store.list_scanner_versions(agent_id).unwrap().len(), 2);
    }
}
