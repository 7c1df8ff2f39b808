use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};

use super::{Bar, BarStoreError, Timeframe, TimeRange};
use crate::bar_store::BarStore;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS bars (
    ticker TEXT NOT NULL,
    timeframe_minutes INTEGER NOT NULL,
    ts_utc INTEGER NOT NULL,
    open REAL NOT NULL,
    high REAL NOT NULL,
    low REAL NOT NULL,
    close REAL NOT NULL,
    volume REAL NOT NULL,
    PRIMARY KEY (ticker, timeframe_minutes, ts_utc)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_bars_range
    ON bars(ticker, timeframe_minutes, ts_utc);
"#;

/// `rusqlite`-backed [`BarStore`], the durable half of the trait (§4.1.1).
/// A single `Mutex<Connection>` serializes writers while reads still see a
/// consistent snapshot of everything committed before they started, matching
/// the "many readers, serialized writers" resource model of §5.
pub struct SqliteBarStore {
    conn: Mutex<Connection>,
}

impl SqliteBarStore {
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

fn to_nanos(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_nanos_opt().unwrap_or(0)
}

fn from_nanos(nanos: i64) -> DateTime<Utc> {
    Utc.timestamp_nanos(nanos)
}

impl BarStore for SqliteBarStore {
    fn write_bars(&self, bars: &[Bar]) -> Result<(), BarStoreError> {
        for bar in bars {
            if bar.timestamp_utc > Utc::now() {
                return Err(BarStoreError::WriteRejected(format!(
                    "bar for {} at {} is in the future",
                    bar.ticker, bar.timestamp_utc
                )));
            }
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO bars (ticker, timeframe_minutes, ts_utc, open, high, low, close, volume)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(ticker, timeframe_minutes, ts_utc) DO UPDATE SET
                    open = excluded.open, high = excluded.high, low = excluded.low,
                    close = excluded.close, volume = excluded.volume",
            )?;
            for bar in bars {
                stmt.execute(params![
                    bar.ticker,
                    bar.timeframe.minutes(),
                    to_nanos(bar.timestamp_utc),
                    bar.open,
                    bar.high,
                    bar.low,
                    bar.close,
                    bar.volume,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn get_bars(
        &self,
        ticker: &str,
        timeframe: Timeframe,
        range: TimeRange,
    ) -> Result<Vec<Bar>, BarStoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT ts_utc, open, high, low, close, volume FROM bars
             WHERE ticker = ?1 AND timeframe_minutes = ?2 AND ts_utc >= ?3 AND ts_utc < ?4
             ORDER BY ts_utc ASC",
        )?;
        let rows = stmt.query_map(
            params![ticker, timeframe.minutes(), to_nanos(range.from), to_nanos(range.to)],
            |row| {
                Ok(Bar {
                    ticker: ticker.to_string(),
                    timeframe,
                    timestamp_utc: from_nanos(row.get(0)?),
                    open: row.get(1)?,
                    high: row.get(2)?,
                    low: row.get(3)?,
                    close: row.get(4)?,
                    volume: row.get(5)?,
                })
            },
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn available_range(
        &self,
        ticker: &str,
        timeframe: Timeframe,
    ) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>, BarStoreError> {
        let conn = self.conn.lock();
        let result: Option<(i64, i64)> = conn
            .query_row(
                "SELECT MIN(ts_utc), MAX(ts_utc) FROM bars WHERE ticker = ?1 AND timeframe_minutes = ?2",
                params![ticker, timeframe.minutes()],
                |row| {
                    let min: Option<i64> = row.get(0)?;
                    let max: Option<i64> = row.get(1)?;
                    Ok(min.zip(max))
                },
            )?;
        Ok(result.map(|(min, max)| (from_nanos(min), from_nanos(max))))
    }
}
