//! Signal & Knowledge Store (C5, §3.1): one SQLite database mirroring the
//! entities of §3 — agents, scanner versions, execution templates,
//! backtests, iterations, agent knowledge, paper accounts/positions/orders,
//! and daily equity snapshots.

mod agents;
mod backtests;
mod iterations;
mod knowledge;
mod paper;
mod scanners;

use parking_lot::Mutex;
use rusqlite::Connection;

use crate::bar_store::BarStoreError;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS agents (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    instructions TEXT NOT NULL,
    risk_tolerance TEXT NOT NULL,
    trading_style TEXT NOT NULL,
    status TEXT NOT NULL,
    allow_multiple_signals_per_day INTEGER NOT NULL DEFAULT 0,
    discovery_mode INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS scanner_versions (
    id TEXT PRIMARY KEY,
    agent_id TEXT NOT NULL REFERENCES agents(id),
    version_number INTEGER NOT NULL,
    name TEXT NOT NULL,
    code TEXT NOT NULL,
    model_tag TEXT NOT NULL,
    generation_prompt TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE(agent_id, version_number)
);

CREATE TABLE IF NOT EXISTS execution_templates (
    id TEXT PRIMARY KEY,
    code_hash TEXT NOT NULL UNIQUE,
    template_name TEXT NOT NULL,
    code TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS backtests (
    id TEXT PRIMARY KEY,
    scanner_version_id TEXT NOT NULL REFERENCES scanner_versions(id),
    start_date TEXT NOT NULL,
    end_date TEXT NOT NULL,
    tickers_json TEXT NOT NULL,
    execution_template_id TEXT NOT NULL REFERENCES execution_templates(id),
    signals_json TEXT NOT NULL,
    trades_json TEXT NOT NULL,
    metrics_json TEXT NOT NULL,
    status TEXT NOT NULL,
    meta_json TEXT NOT NULL,
    error TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS iterations (
    id TEXT PRIMARY KEY,
    agent_id TEXT NOT NULL REFERENCES agents(id),
    iteration_number INTEGER NOT NULL,
    scanner_version_id TEXT REFERENCES scanner_versions(id),
    backtest_id TEXT REFERENCES backtests(id),
    analysis_json TEXT,
    refinements_json TEXT NOT NULL,
    status TEXT NOT NULL,
    trades_executed INTEGER NOT NULL,
    signals_found INTEGER NOT NULL,
    failure_reasons_json TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE(agent_id, iteration_number)
);

CREATE TABLE IF NOT EXISTS agent_knowledge (
    id TEXT PRIMARY KEY,
    agent_id TEXT NOT NULL REFERENCES agents(id),
    knowledge_type TEXT NOT NULL,
    pattern_type TEXT,
    insight_text TEXT NOT NULL,
    normalized_text TEXT NOT NULL,
    supporting_data_json TEXT NOT NULL,
    confidence REAL NOT NULL,
    learned_from_iteration TEXT NOT NULL,
    times_validated INTEGER NOT NULL,
    last_validated TEXT NOT NULL,
    projected_metric REAL,
    UNIQUE(agent_id, knowledge_type, pattern_type, normalized_text)
);

CREATE TABLE IF NOT EXISTS paper_accounts (
    id TEXT PRIMARY KEY,
    agent_id TEXT NOT NULL UNIQUE REFERENCES agents(id),
    initial_balance INTEGER NOT NULL,
    cash INTEGER NOT NULL,
    equity INTEGER NOT NULL,
    buying_power INTEGER NOT NULL,
    metrics_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS paper_positions (
    account_id TEXT NOT NULL REFERENCES paper_accounts(id),
    ticker TEXT NOT NULL,
    quantity REAL NOT NULL,
    avg_entry_price REAL NOT NULL,
    current_price REAL NOT NULL,
    unrealized_pnl INTEGER NOT NULL,
    entry_time TEXT NOT NULL,
    PRIMARY KEY (account_id, ticker)
);

CREATE TABLE IF NOT EXISTS paper_orders (
    id TEXT PRIMARY KEY,
    account_id TEXT NOT NULL REFERENCES paper_accounts(id),
    ticker TEXT NOT NULL,
    side TEXT NOT NULL,
    order_type TEXT NOT NULL,
    quantity REAL NOT NULL,
    limit_price REAL,
    stop_price REAL,
    status TEXT NOT NULL,
    rejection_reason TEXT,
    triggered INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS equity_snapshots (
    account_id TEXT NOT NULL REFERENCES paper_accounts(id),
    session_date TEXT NOT NULL,
    equity INTEGER NOT NULL,
    PRIMARY KEY (account_id, session_date)
);
"#;

/// The durable, SQLite-backed home of every entity in §3 except bars
/// (C1 owns those separately, §4.1). A single mutex-guarded connection
/// serializes writers; `rusqlite` gives readers a consistent view of
/// everything committed before their statement started (§5).
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: &str) -> Result<Self, BarStoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, BarStoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}
