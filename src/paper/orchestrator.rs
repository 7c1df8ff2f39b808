//! Paper-Trading Orchestrator (C8, §4.8): one supervisor task per agent,
//! fed by the shared [`LiveBarFeed`], driving a per-ticker ring buffer, a
//! reused [`ScannerWorker`] (the same protocol C3 uses — "single engine for
//! backtest and paper trading", §4.3/§9), and the [`VirtualExecutor`] for
//! fills and risk checks.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use crate::bar_store::{Bar, BarStore, SqliteBarStore, Timeframe};
use crate::config::Config;
use crate::domain::paper::{OrderStatus, OrderType, PaperOrder, PaperPosition};
use crate::error::{EngineError, Result};
use crate::execution::templates::{TemplateKind, TimeExit};
use crate::feed::LiveBarFeed;
use crate::market_hours;
use crate::signal::Direction;
use crate::store::Store;
use crate::worker::protocol::ScanRequest;
use crate::worker::{next_request_id, ScannerWorker};

use super::executor::VirtualExecutor;

/// Per-ticker live state kept by one agent's supervisor: a bounded ring of
/// recent bars (§4.8, `MAX_BARS_PER_TICKER`), the exit levels of any open
/// position, and whether a signal has already fired today (at most one
/// signal per ticker per day, mirroring C3's real-time rule).
struct TickerState {
    bars: VecDeque<Bar>,
    capacity: usize,
    signalled_today: Option<chrono::NaiveDate>,
    stop_level: Option<f64>,
    target_level: Option<f64>,
    bars_since_entry: u32,
}

impl TickerState {
    fn new(capacity: usize) -> Self {
        Self {
            bars: VecDeque::with_capacity(capacity),
            capacity,
            signalled_today: None,
            stop_level: None,
            target_level: None,
            bars_since_entry: 0,
        }
    }

    /// Appends `bar`, dropping the oldest entry once `capacity` is
    /// exceeded (§4.8 "drop-oldest" ring buffer semantics).
    fn push(&mut self, bar: Bar) {
        if self.bars.len() >= self.capacity {
            self.bars.pop_front();
        }
        self.bars.push_back(bar);
    }
}

/// Supervises one agent: subscribes to its tickers on the shared feed, runs
/// the scan-and-decide loop, and drives position exits. Each instance owns
/// exactly one `PaperAccount` (§5 "each account is mutated by exactly one
/// supervisor").
pub struct AgentSupervisor {
    agent_id: Uuid,
    store: Arc<Store>,
    config: Arc<Config>,
    feed: Arc<dyn LiveBarFeed>,
    worker_argv: Vec<String>,
    template: TemplateKind,
}

impl AgentSupervisor {
    pub fn new(
        agent_id: Uuid,
        store: Arc<Store>,
        config: Arc<Config>,
        feed: Arc<dyn LiveBarFeed>,
        template: TemplateKind,
    ) -> Self {
        let worker_argv = config.scanner_worker_cmd.clone();
        Self {
            agent_id,
            store,
            config,
            feed,
            worker_argv,
            template,
        }
    }

    /// Runs until `tickers` is empty for good or the feed closes for good.
    /// A disconnected feed (channel closed) is retried with exponential
    /// backoff; a lagging receiver (buffer overrun) just logs and resumes
    /// from the next bar — live freshness over exact delivery (§5).
    pub async fn run(&self, tickers: Vec<String>) -> Result<()> {
        let private_path = temp_private_db_path(self.agent_id);
        let private_path_str = private_path.to_string_lossy().to_string();
        let private_store = SqliteBarStore::open(&private_path_str)?;

        let mut worker = match ScannerWorker::spawn(&self.worker_argv, self.config.scan_request_timeout).await {
            Ok(w) => Some(w),
            Err(e) => {
                warn!(agent_id = %self.agent_id, error = %e, "scanner worker failed to spawn at startup");
                None
            }
        };

        let mut states: HashMap<String, TickerState> = tickers
            .iter()
            .map(|t| (t.clone(), TickerState::new(self.config.max_bars_per_ticker)))
            .collect();

        let mut backoff = Duration::from_secs(1);
        loop {
            let mut rx = self.feed.subscribe(&tickers).await;
            backoff = Duration::from_secs(1);

            loop {
                match rx.recv().await {
                    Ok(bar) => {
                        if let Err(e) = self
                            .on_bar(&mut worker, &private_store, &private_path_str, &mut states, bar)
                            .await
                        {
                            warn!(agent_id = %self.agent_id, error = %e, "error processing live bar");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(agent_id = %self.agent_id, skipped, "live feed lagged, dropping to latest");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!(agent_id = %self.agent_id, backoff_secs = backoff.as_secs(), "feed closed, reconnecting");
                        break;
                    }
                }
            }

            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(Duration::from_secs(60));
        }
    }

    async fn on_bar(
        &self,
        worker: &mut Option<ScannerWorker>,
        private_store: &SqliteBarStore,
        private_path: &str,
        states: &mut HashMap<String, TickerState>,
        bar: Bar,
    ) -> Result<()> {
        let Some(state) = states.get_mut(&bar.ticker) else {
            return Ok(());
        };
        state.push(bar.clone());
        private_store.write_bars(std::slice::from_ref(&bar))?;

        let Some(account) = self.store.get_paper_account_by_agent(self.agent_id)? else {
            return Err(EngineError::Internal(format!(
                "agent {} has no paper account",
                self.agent_id
            )));
        };
        let mut account = account;

        self.fill_pending_orders(&account, &bar)?;
        // `fill_pending_orders` persists account updates through its own
        // copy; reload so the rest of this pass sees the fresh cash/equity.
        if let Some(refreshed) = self.store.get_paper_account_by_agent(self.agent_id)? {
            account = refreshed;
        }
        self.monitor_position(&mut account, state, &bar)?;

        let today = market_hours::to_eastern_naive(&bar.timestamp_utc).date();
        let already_signalled = state.signalled_today == Some(today);
        let position = self
            .store
            .list_positions(account.id)?
            .into_iter()
            .find(|p| p.ticker == bar.ticker)
            .unwrap_or_else(|| PaperPosition::flat(account.id, bar.ticker.clone()));

        if !already_signalled && position.is_flat() && state.bars.len() >= crate::config::DEFAULT_WARMUP_BARS {
            if worker.is_none() {
                *worker = ScannerWorker::spawn(&self.worker_argv, self.config.scan_request_timeout)
                    .await
                    .ok();
            }
            if let Some(w) = worker.as_mut() {
                let request = ScanRequest {
                    request_id: next_request_id(),
                    database_path: private_path.to_string(),
                    tickers: vec![bar.ticker.clone()],
                    current_bar_timestamp: bar.timestamp_utc.timestamp(),
                };
                match w.scan(request).await {
                    Ok(response) if response.success => {
                        if let Some(signal) = response.data {
                            state.signalled_today = Some(today);
                            self.open_position(&account, &signal, &bar)?;
                        }
                    }
                    Ok(response) => {
                        info!(agent_id = %self.agent_id, ticker = %bar.ticker, error = ?response.error, "scanner rejected scan");
                    }
                    Err(e) => {
                        warn!(agent_id = %self.agent_id, ticker = %bar.ticker, error = %e, "scanner worker crashed, will respawn on next scan");
                        if let Some(w) = worker.take() {
                            w.shutdown().await;
                        }
                    }
                }
            }
        }

        let is_session_close = market_hours::minutes_to_close(&bar.timestamp_utc) == Some(0);
        let bar_ticker = bar.ticker.clone();
        let bar_close = bar.close;
        self.executor().mark_to_market_all(
            &mut account,
            |ticker| if ticker == bar_ticker { Some(bar_close) } else { None },
            today,
            is_session_close,
        )?;

        Ok(())
    }

    fn executor(&self) -> VirtualExecutor<'_> {
        VirtualExecutor::new(&self.store, &self.config)
    }

    /// Places a Market entry order sized by the exit template's risk band
    /// and leaves the stop/target levels on `TickerState` for the
    /// position-monitor pass to enforce (§4.8 step "position monitor").
    fn open_position(&self, account: &crate::domain::paper::PaperAccount, signal: &crate::signal::Signal, bar: &Bar) -> Result<()> {
        let quantity = self.size_position(account, bar.open);
        if quantity <= 0.0 {
            return Ok(());
        }
        let order = PaperOrder::new(
            account.id,
            bar.ticker.clone(),
            signal.direction,
            OrderType::Market,
            quantity,
            None,
            None,
        );
        let placed = self.executor().place_order(account, order)?;
        if placed.status == OrderStatus::Rejected {
            info!(agent_id = %self.agent_id, ticker = %bar.ticker, reason = ?placed.rejection_reason, "entry order rejected by risk checks");
        }
        Ok(())
    }

    /// Sizes a new position at a fixed fraction of equity (the max position
    /// pct risk limit, §4.9), capped so buying power is never exceeded.
    fn size_position(&self, account: &crate::domain::paper::PaperAccount, price: f64) -> f64 {
        if price <= 0.0 {
            return 0.0;
        }
        let budget = account
            .equity
            .scale(self.config.max_position_pct_of_equity)
            .to_f64()
            .min(account.buying_power.to_f64());
        (budget / price).max(0.0).floor()
    }

    /// Fills any still-pending orders for `bar.ticker` against `bar`
    /// (§4.9 "fill rules against the next bar after order placement").
    fn fill_pending_orders(&self, account: &crate::domain::paper::PaperAccount, bar: &Bar) -> Result<()> {
        let mut account = account.clone();
        let orders = self.store.list_orders(account.id)?;
        let position = self
            .store
            .list_positions(account.id)?
            .into_iter()
            .find(|p| p.ticker == bar.ticker)
            .unwrap_or_else(|| PaperPosition::flat(account.id, bar.ticker.clone()));

        for mut order in orders.into_iter().filter(|o| o.ticker == bar.ticker && o.status == OrderStatus::Pending) {
            self.executor().try_fill(&mut order, &mut account, &position, bar)?;
        }
        Ok(())
    }

    /// Stop/target/trailing/time-exit checks against the exit template's
    /// resolved [`ExitRule`] (§4.8), plus the forced flat-by-close rule:
    /// positions are closed 5 minutes before session close.
    fn monitor_position(
        &self,
        account: &mut crate::domain::paper::PaperAccount,
        state: &mut TickerState,
        bar: &Bar,
    ) -> Result<()> {
        let position = self
            .store
            .list_positions(account.id)?
            .into_iter()
            .find(|p| p.ticker == bar.ticker);
        let Some(position) = position else { return Ok(()) };
        if position.is_flat() {
            state.stop_level = None;
            state.target_level = None;
            state.bars_since_entry = 0;
            return Ok(());
        }

        let rule = self.template.rule();
        let direction = if position.quantity > 0.0 { Direction::Long } else { Direction::Short };

        if state.stop_level.is_none() {
            let (stop_dist, target_dist) = (
                position.avg_entry_price * rule.stop_loss_pct,
                position.avg_entry_price * rule.take_profit_pct,
            );
            state.stop_level = Some(match direction {
                Direction::Long => position.avg_entry_price - stop_dist,
                Direction::Short => position.avg_entry_price + stop_dist,
            });
            state.target_level = Some(match direction {
                Direction::Long => position.avg_entry_price + target_dist,
                Direction::Short => position.avg_entry_price - target_dist,
            });
            state.bars_since_entry = 0;
        }
        state.bars_since_entry += 1;

        let stop_level = state.stop_level.unwrap();
        let target_level = state.target_level.unwrap();

        let (stop_hit, target_hit) = match direction {
            Direction::Long => (bar.low <= stop_level, bar.high >= target_level),
            Direction::Short => (bar.high >= stop_level, bar.low <= target_level),
        };

        let flat_by_close = market_hours::minutes_to_close(&bar.timestamp_utc)
            .map(|m| m <= 5)
            .unwrap_or(false);
        let time_exit = match rule.time_exit {
            TimeExit::AfterBars(n) => state.bars_since_entry >= n,
            TimeExit::MinutesBeforeClose(minutes) => {
                market_hours::minutes_to_close(&bar.timestamp_utc).map(|m| m <= minutes).unwrap_or(false)
            }
            TimeExit::None => false,
        };

        if stop_hit || target_hit || time_exit || flat_by_close {
            self.close_position(account, &position, bar)?;
            state.stop_level = None;
            state.target_level = None;
            state.bars_since_entry = 0;
        } else if let Some(trail_dist) = rule.trailing_stop_pct.map(|pct| position.avg_entry_price * pct) {
            let activation = position.avg_entry_price * rule.trailing_activation_pct;
            let activated = match direction {
                Direction::Long => bar.high >= position.avg_entry_price + activation,
                Direction::Short => bar.low <= position.avg_entry_price - activation,
            };
            if activated {
                state.stop_level = Some(match direction {
                    Direction::Long => stop_level.max(bar.high - trail_dist),
                    Direction::Short => stop_level.min(bar.low + trail_dist),
                });
            }
        }

        Ok(())
    }

    fn close_position(
        &self,
        account: &mut crate::domain::paper::PaperAccount,
        position: &PaperPosition,
        bar: &Bar,
    ) -> Result<()> {
        let side = if position.quantity > 0.0 { Direction::Short } else { Direction::Long };
        let order = PaperOrder::new(
            account.id,
            position.ticker.clone(),
            side,
            OrderType::Market,
            position.quantity.abs(),
            None,
            None,
        );
        self.store.insert_order(&order)?;
        let mut order = order;
        let _ = self.executor().try_fill(&mut order, account, position, bar)?;
        Ok(())
    }
}

/// A per-agent private bar store, reused across the agent's lifetime in
/// live mode (unlike C3's per-day throwaway file, since there is no notion
/// of "day boundary" cleanup while a supervisor keeps running).
fn temp_private_db_path(agent_id: Uuid) -> PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!("intraday-lab-paper-{agent_id}.db"));
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_drops_oldest_past_capacity() {
        let mut state = TickerState::new(2);
        for i in 0..5 {
            state.push(Bar {
                ticker: "AAA".to_string(),
                timeframe: Timeframe::FIVE_MIN,
                timestamp_utc: chrono::Utc::now() + chrono::Duration::minutes(i),
                open: i as f64,
                high: i as f64,
                low: i as f64,
                close: i as f64,
                volume: 1.0,
            });
        }
        assert_eq!(state.bars.len(), 2);
        assert_eq!(state.bars.front().unwrap().open, 3.0);
    }
}
