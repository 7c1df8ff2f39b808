//! Execution Template (content-addressed, §4.4/§9) and Backtest persistence.

use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use crate::bar_store::BarStoreError;
use crate::domain::backtest_record::{Backtest, BacktestMetrics, BacktestStatus, TickerRunStats};
use crate::domain::execution_template::ExecutionTemplate;
use crate::domain::trade::Trade;
use crate::signal::Signal;

use super::Store;

impl Store {
    /// Returns the existing row for `template.code_hash` if one is already
    /// stored, otherwise inserts `template` and returns it unchanged — the
    /// dedup-by-hash contract of the Execution Template Engine (§4.4, §9).
    pub fn get_or_create_execution_template(
        &self,
        template: ExecutionTemplate,
    ) -> Result<ExecutionTemplate, BarStoreError> {
        let conn = self.conn.lock();
        let existing = conn
            .query_row(
                "SELECT id, code_hash, template_name, code FROM execution_templates WHERE code_hash = ?1",
                params![template.code_hash],
                row_to_template,
            )
            .optional()?;
        if let Some(existing) = existing {
            return Ok(existing);
        }

        conn.execute(
            "INSERT INTO execution_templates (id, code_hash, template_name, code) VALUES (?1, ?2, ?3, ?4)",
            params![
                template.id.to_string(),
                template.code_hash,
                template.template_name,
                template.code,
            ],
        )?;
        Ok(template)
    }

    pub fn get_execution_template(&self, id: Uuid) -> Result<Option<ExecutionTemplate>, BarStoreError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, code_hash, template_name, code FROM execution_templates WHERE id = ?1",
            params![id.to_string()],
            row_to_template,
        )
        .optional()
        .map_err(BarStoreError::from)
    }

    pub fn insert_backtest(&self, backtest: &Backtest) -> Result<(), BarStoreError> {
        let conn = self.conn.lock();
        let tickers_json = serde_json::to_string(&backtest.tickers).unwrap_or_default();
        let signals_json = serde_json::to_string(&backtest.signals).unwrap_or_default();
        let trades_json = serde_json::to_string(&backtest.trades).unwrap_or_default();
        let metrics_json = serde_json::to_string(&backtest.metrics).unwrap_or_default();
        let meta_json = serde_json::to_string(&backtest.per_ticker_stats).unwrap_or_default();

        conn.execute(
            "INSERT INTO backtests (id, scanner_version_id, start_date, end_date, tickers_json,
                execution_template_id, signals_json, trades_json, metrics_json, status, meta_json,
                error, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                backtest.id.to_string(),
                backtest.scanner_version_id.to_string(),
                backtest.start_date.to_string(),
                backtest.end_date.to_string(),
                tickers_json,
                backtest.execution_template_id.to_string(),
                signals_json,
                trades_json,
                metrics_json,
                status_str(backtest.status),
                meta_json,
                backtest.error,
                backtest.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_backtest(&self, id: Uuid) -> Result<Option<Backtest>, BarStoreError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, scanner_version_id, start_date, end_date, tickers_json, execution_template_id,
                signals_json, trades_json, metrics_json, status, meta_json, error, created_at
             FROM backtests WHERE id = ?1",
            params![id.to_string()],
            row_to_backtest,
        )
        .optional()
        .map_err(BarStoreError::from)
    }
}

fn status_str(status: BacktestStatus) -> &'static str {
    match status {
        BacktestStatus::Running => "running",
        BacktestStatus::Completed => "completed",
        BacktestStatus::Failed => "failed",
    }
}

fn parse_status(s: &str) -> BacktestStatus {
    match s {
        "running" => BacktestStatus::Running,
        "failed" => BacktestStatus::Failed,
        _ => BacktestStatus::Completed,
    }
}

fn row_to_template(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExecutionTemplate> {
    let id: String = row.get(0)?;
    Ok(ExecutionTemplate {
        id: parse_uuid(&id)?,
        code_hash: row.get(1)?,
        template_name: row.get(2)?,
        code: row.get(3)?,
    })
}

fn row_to_backtest(row: &rusqlite::Row<'_>) -> rusqlite::Result<Backtest> {
    let id: String = row.get(0)?;
    let scanner_version_id: String = row.get(1)?;
    let start_date: String = row.get(2)?;
    let end_date: String = row.get(3)?;
    let tickers_json: String = row.get(4)?;
    let execution_template_id: String = row.get(5)?;
    let signals_json: String = row.get(6)?;
    let trades_json: String = row.get(7)?;
    let metrics_json: String = row.get(8)?;
    let status: String = row.get(9)?;
    let meta_json: String = row.get(10)?;
    let created_at: String = row.get(12)?;

    let tickers: Vec<String> = serde_json::from_str(&tickers_json).unwrap_or_default();
    let signals: Vec<Signal> = serde_json::from_str(&signals_json).unwrap_or_default();
    let trades: Vec<Trade> = serde_json::from_str(&trades_json).unwrap_or_default();
    let metrics: BacktestMetrics = serde_json::from_str(&metrics_json).unwrap_or_default();
    let per_ticker_stats: std::collections::BTreeMap<String, TickerRunStats> =
        serde_json::from_str(&meta_json).unwrap_or_default();

    Ok(Backtest {
        id: parse_uuid(&id)?,
        scanner_version_id: parse_uuid(&scanner_version_id)?,
        start_date: start_date.parse().unwrap_or_default(),
        end_date: end_date.parse().unwrap_or_default(),
        tickers,
        execution_template_id: parse_uuid(&execution_template_id)?,
        signals,
        trades,
        metrics,
        status: parse_status(&status),
        per_ticker_stats,
        error: row.get(11)?,
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
    use crate::domain::execution_template::hash_code;
    use chrono::NaiveDate;

    #[test]
    fn execution_templates_dedup_by_hash() {
        let store = Store::open_in_memory().unwrap();
        let code = "stop_loss=0.01\n".to_string();
        let t1 = ExecutionTemplate::new("Conservative Scalper".to_string(), code.clone());
        let t2 = ExecutionTemplate::new("Conservative Scalper Copy".to_string(), code.clone());
        assert_eq!(t1.code_hash, hash_code(&code));

        let stored1 = store.get_or_create_execution_template(t1.clone()).unwrap();
        let stored2 = store.get_or_create_execution_template(t2).unwrap();
        assert_eq!(stored1.id, stored2.id);
        assert_eq!(stored2.template_name, "Conservative Scalper");
    }

    #[test]
    fn round_trips_a_backtest() {
        let store = Store::open_in_memory().unwrap();
        let template = store
            .get_or_create_execution_template(ExecutionTemplate::new(
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
            metrics: BacktestMetrics::default(),
            status: BacktestStatus::Completed,
            per_ticker_stats: Default::default(),
            error: None,
            created_at: chrono::Utc::now(),
        };
        store.insert_backtest(&backtest).unwrap();

        let fetched = store.get_backtest(backtest.id).unwrap().unwrap();
        assert_eq!(fetched.tickers, backtest.tickers);
        assert_eq!(fetched.status, BacktestStatus::Completed);
    }
}
