//! Paper Account / Position / Order / equity-curve persistence (§3, §4.9).

use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use crate::amount::Amount;
use crate::bar_store::BarStoreError;
use crate::domain::paper::{AccountMetrics, OrderStatus, OrderType, PaperAccount, PaperOrder, PaperPosition};
use crate::signal::Direction;

use super::Store;

impl Store {
    pub fn create_paper_account(&self, account: &PaperAccount) -> Result<(), BarStoreError> {
        let conn = self.conn.lock();
        let metrics_json = serde_json::to_string(&account.metrics).unwrap_or_default();
        conn.execute(
            "INSERT INTO paper_accounts (id, agent_id, initial_balance, cash, equity, buying_power, metrics_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                account.id.to_string(),
                account.agent_id.to_string(),
                account.initial_balance.raw_ticks(),
                account.cash.raw_ticks(),
                account.equity.raw_ticks(),
                account.buying_power.raw_ticks(),
                metrics_json,
            ],
        )?;
        Ok(())
    }

    pub fn get_paper_account_by_agent(&self, agent_id: Uuid) -> Result<Option<PaperAccount>, BarStoreError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, agent_id, initial_balance, cash, equity, buying_power, metrics_json
             FROM paper_accounts WHERE agent_id = ?1",
            params![agent_id.to_string()],
            row_to_account,
        )
        .optional()
        .map_err(BarStoreError::from)
    }

    pub fn update_paper_account(&self, account: &PaperAccount) -> Result<(), BarStoreError> {
        let conn = self.conn.lock();
        let metrics_json = serde_json::to_string(&account.metrics).unwrap_or_default();
        let changed = conn.execute(
            "UPDATE paper_accounts SET cash = ?1, equity = ?2, buying_power = ?3, metrics_json = ?4
             WHERE id = ?5",
            params![
                account.cash.raw_ticks(),
                account.equity.raw_ticks(),
                account.buying_power.raw_ticks(),
                metrics_json,
                account.id.to_string(),
            ],
        )?;
        if changed == 0 {
            return Err(BarStoreError::NotFound);
        }
        Ok(())
    }

    pub fn upsert_position(&self, position: &PaperPosition) -> Result<(), BarStoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO paper_positions (account_id, ticker, quantity, avg_entry_price, current_price, unrealized_pnl, entry_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(account_id, ticker) DO UPDATE SET
                quantity = excluded.quantity,
                avg_entry_price = excluded.avg_entry_price,
                current_price = excluded.current_price,
                unrealized_pnl = excluded.unrealized_pnl,
                entry_time = excluded.entry_time",
            params![
                position.account_id.to_string(),
                position.ticker,
                position.quantity,
                position.avg_entry_price,
                position.current_price,
                position.unrealized_pnl.raw_ticks(),
                position.entry_time.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn list_positions(&self, account_id: Uuid) -> Result<Vec<PaperPosition>, BarStoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT account_id, ticker, quantity, avg_entry_price, current_price, unrealized_pnl, entry_time
             FROM paper_positions WHERE account_id = ?1 ORDER BY ticker ASC",
        )?;
        let rows = stmt.query_map(params![account_id.to_string()], row_to_position)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn insert_order(&self, order: &PaperOrder) -> Result<(), BarStoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO paper_orders (id, account_id, ticker, side, order_type, quantity, limit_price,
                stop_price, status, rejection_reason, triggered, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                order.id.to_string(),
                order.account_id.to_string(),
                order.ticker,
                side_str(order.side),
                order_type_str(order.order_type),
                order.quantity,
                order.limit_price,
                order.stop_price,
                order_status_str(order.status),
                order.rejection_reason,
                order.triggered,
                order.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn mark_order_triggered(&self, id: Uuid) -> Result<(), BarStoreError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE paper_orders SET triggered = 1 WHERE id = ?1",
            params![id.to_string()],
        )?;
        if changed == 0 {
            return Err(BarStoreError::NotFound);
        }
        Ok(())
    }

    pub fn update_order_status(
        &self,
        id: Uuid,
        status: OrderStatus,
        rejection_reason: Option<&str>,
    ) -> Result<(), BarStoreError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE paper_orders SET status = ?1, rejection_reason = ?2 WHERE id = ?3",
            params![order_status_str(status), rejection_reason, id.to_string()],
        )?;
        if changed == 0 {
            return Err(BarStoreError::NotFound);
        }
        Ok(())
    }

    pub fn list_orders(&self, account_id: Uuid) -> Result<Vec<PaperOrder>, BarStoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, account_id, ticker, side, order_type, quantity, limit_price, stop_price, status,
                rejection_reason, triggered, created_at
             FROM paper_orders WHERE account_id = ?1 ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(params![account_id.to_string()], row_to_order)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Records the day's closing equity (§4.8: daily equity snapshots feed
    /// the paper-trading equity curve). Idempotent per (account, day).
    pub fn record_equity_snapshot(
        &self,
        account_id: Uuid,
        session_date: chrono::NaiveDate,
        equity: Amount,
    ) -> Result<(), BarStoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO equity_snapshots (account_id, session_date, equity) VALUES (?1, ?2, ?3)
             ON CONFLICT(account_id, session_date) DO UPDATE SET equity = excluded.equity",
            params![account_id.to_string(), session_date.to_string(), equity.raw_ticks()],
        )?;
        Ok(())
    }

    pub fn equity_curve(&self, account_id: Uuid) -> Result<Vec<(chrono::NaiveDate, Amount)>, BarStoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT session_date, equity FROM equity_snapshots WHERE account_id = ?1 ORDER BY session_date ASC",
        )?;
        let rows = stmt.query_map(params![account_id.to_string()], |row| {
            let date: String = row.get(0)?;
            let equity: i64 = row.get(1)?;
            Ok((date.parse().unwrap_or_default(), Amount::from_ticks(equity)))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

fn side_str(side: Direction) -> &'static str {
    match side {
        Direction::Long => "LONG",
        Direction::Short => "SHORT",
    }
}

fn parse_side(s: &str) -> Direction {
    if s == "SHORT" {
        Direction::Short
    } else {
        Direction::Long
    }
}

fn order_type_str(t: OrderType) -> &'static str {
    match t {
        OrderType::Market => "MARKET",
        OrderType::Limit => "LIMIT",
        OrderType::Stop => "STOP",
        OrderType::StopLimit => "STOP_LIMIT",
    }
}

fn parse_order_type(s: &str) -> OrderType {
    match s {
        "LIMIT" => OrderType::Limit,
        "STOP" => OrderType::Stop,
        "STOP_LIMIT" => OrderType::StopLimit,
        _ => OrderType::Market,
    }
}

fn order_status_str(s: OrderStatus) -> &'static str {
    match s {
        OrderStatus::Pending => "PENDING",
        OrderStatus::Filled => "FILLED",
        OrderStatus::Partial => "PARTIAL",
        OrderStatus::Cancelled => "CANCELLED",
        OrderStatus::Rejected => "REJECTED",
    }
}

fn parse_order_status(s: &str) -> OrderStatus {
    match s {
        "FILLED" => OrderStatus::Filled,
        "PARTIAL" => OrderStatus::Partial,
        "CANCELLED" => OrderStatus::Cancelled,
        "REJECTED" => OrderStatus::Rejected,
        _ => OrderStatus::Pending,
    }
}

fn row_to_account(row: &rusqlite::Row<'_>) -> rusqlite::Result<PaperAccount> {
    let id: String = row.get(0)?;
    let agent_id: String = row.get(1)?;
    let metrics_json: String = row.get(6)?;
    Ok(PaperAccount {
        id: parse_uuid(&id)?,
        agent_id: parse_uuid(&agent_id)?,
        initial_balance: Amount::from_ticks(row.get(2)?),
        cash: Amount::from_ticks(row.get(3)?),
        equity: Amount::from_ticks(row.get(4)?),
        buying_power: Amount::from_ticks(row.get(5)?),
        metrics: serde_json::from_str::<AccountMetrics>(&metrics_json).unwrap_or_default(),
    })
}

fn row_to_position(row: &rusqlite::Row<'_>) -> rusqlite::Result<PaperPosition> {
    let account_id: String = row.get(0)?;
    let entry_time: String = row.get(6)?;
    Ok(PaperPosition {
        account_id: parse_uuid(&account_id)?,
        ticker: row.get(1)?,
        quantity: row.get(2)?,
        avg_entry_price: row.get(3)?,
        current_price: row.get(4)?,
        unrealized_pnl: Amount::from_ticks(row.get(5)?),
        entry_time: chrono::DateTime::parse_from_rfc3339(&entry_time)
            .map(|dt| dt.with_timezone(&chrono::Utc))
            .unwrap_or_else(|_| chrono::Utc::now()),
    })
}

fn row_to_order(row: &rusqlite::Row<'_>) -> rusqlite::Result<PaperOrder> {
    let id: String = row.get(0)?;
    let account_id: String = row.get(1)?;
    let side: String = row.get(3)?;
    let order_type: String = row.get(4)?;
    let status: String = row.get(8)?;
    let created_at: String = row.get(11)?;
    Ok(PaperOrder {
        id: parse_uuid(&id)?,
        account_id: parse_uuid(&account_id)?,
        ticker: row.get(2)?,
        side: parse_side(&side),
        order_type: parse_order_type(&order_type),
        quantity: row.get(5)?,
        limit_price: row.get(6)?,
        stop_price: row.get(7)?,
        status: parse_order_status(&status),
        rejection_reason: row.get(9)?,
        triggered: row.get(10)?,
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
    use chrono::NaiveDate;

    #[test]
    fn round_trips_account_position_and_order() {
        let store = Store::open_in_memory().unwrap();
        let agent_id = Uuid::new_v4();
        let account = PaperAccount::new(agent_id, Amount::from_f64(100_000.0));
        store.create_paper_account(&account).unwrap();

        let fetched = store.get_paper_account_by_agent(agent_id).unwrap().unwrap();
        assert_eq!(fetched.cash, account.cash);

        let mut position = PaperPosition::flat(account.id, "AAPL".to_string());
        position.quantity = 10.0;
        position.avg_entry_price = 150.0;
        position.mark_to_market(155.0);
        store.upsert_position(&position).unwrap();
        let positions = store.list_positions(account.id).unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].quantity, 10.0);

        let order = PaperOrder::new(
            account.id,
            "AAPL".to_string(),
            Direction::Long,
            OrderType::Market,
            10.0,
            None,
            None,
        );
        store.insert_order(&order).unwrap();
        store.update_order_status(order.id, OrderStatus::Filled, None).unwrap();
        let orders = store.list_orders(account.id).unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].status, OrderStatus::Filled);

        store
            .record_equity_snapshot(account.id, NaiveDate::from_ymd_opt(2025, 10, 15).unwrap(), account.equity)
            .unwrap();
        assert_eq!(store.equity_curve(account.id).unwrap().len(), 1);
    }
}
