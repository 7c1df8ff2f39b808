//! Virtual Executor & Paper Account (C9, §4.9): simulates fills for Market,
//! Limit, Stop, and Stop-Limit orders against the bar following placement,
//! enforces the pre-fill risk checks, and keeps cash/position/equity
//! bookkeeping exact via [`Amount`].

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::amount::Amount;
use crate::bar_store::Bar;
use crate::config::Config;
use crate::domain::paper::{OrderStatus, OrderType, PaperAccount, PaperOrder, PaperPosition};
use crate::domain::trade::{ExitReason, Trade};
use crate::error::Result;
use crate::signal::Direction;
use crate::store::Store;

/// Pre-fill risk checks of §4.9, evaluated against the account and book of
/// positions as they would stand *after* the candidate fill.
pub struct RiskLimits {
    pub max_position_pct_of_equity: f64,
    pub max_open_positions: usize,
    pub min_cash_pct_of_equity: f64,
}

impl From<&Config> for RiskLimits {
    fn from(cfg: &Config) -> Self {
        Self {
            max_position_pct_of_equity: cfg.max_position_pct_of_equity,
            max_open_positions: cfg.max_open_positions,
            min_cash_pct_of_equity: cfg.min_cash_pct_of_equity,
        }
    }
}

/// A fill that was actually applied, carrying the `Trade` record when the
/// fill closed or reduced an existing position (flat → non-flat opens do
/// not yet have a realized trade to report).
pub struct FillOutcome {
    pub fill_price: f64,
    pub commission: Amount,
    pub trade: Option<Trade>,
}

/// Drives order placement, fill simulation, and account bookkeeping for one
/// Paper Account. Holds no state of its own beyond the `Store` handle and
/// risk limits — the account/position/order rows are the source of truth,
/// matching §4.9's "each account is mutated by exactly one supervisor"
/// concurrency guarantee (§5).
pub struct VirtualExecutor<'a> {
    store: &'a Store,
    limits: RiskLimits,
    commission_per_fill: Amount,
    default_slippage: f64,
}

impl<'a> VirtualExecutor<'a> {
    pub fn new(store: &'a Store, cfg: &Config) -> Self {
        Self {
            store,
            limits: RiskLimits::from(cfg),
            commission_per_fill: Amount::from_f64(cfg.commission_per_fill),
            default_slippage: cfg.default_slippage_bps / 10_000.0,
        }
    }

    /// Runs the pre-fill risk checks of §4.9 against the candidate order's
    /// worst-case notional, rejecting (not erroring) the order in place if
    /// any is violated.
    pub fn place_order(&self, account: &PaperAccount, mut order: PaperOrder) -> Result<PaperOrder> {
        let reference_price = order
            .limit_price
            .or(order.stop_price)
            .unwrap_or(account.buying_power.to_f64().max(1.0));
        let notional = Amount::from_f64(order.quantity.abs() * reference_price);

        if account.buying_power < notional {
            order.reject("insufficient buying power");
            self.store.insert_order(&order)?;
            return Ok(order);
        }

        let max_position_notional = account.equity.scale(self.limits.max_position_pct_of_equity);
        if notional > max_position_notional {
            order.reject("position notional would exceed max position pct of equity");
            self.store.insert_order(&order)?;
            return Ok(order);
        }

        let positions = self.store.list_positions(account.id)?;
        let open_positions = positions.iter().filter(|p| !p.is_flat()).count();
        let opens_new_position = !positions.iter().any(|p| p.ticker == order.ticker && !p.is_flat());
        if opens_new_position && open_positions + 1 > self.limits.max_open_positions {
            order.reject("open position count would exceed limit");
            self.store.insert_order(&order)?;
            return Ok(order);
        }

        let post_fill_cash = account.cash - notional - self.commission_per_fill;
        let min_cash = account.equity.scale(self.limits.min_cash_pct_of_equity);
        if post_fill_cash < min_cash {
            order.reject("post-fill cash would fall below min cash pct of equity");
            self.store.insert_order(&order)?;
            return Ok(order);
        }

        self.store.insert_order(&order)?;
        Ok(order)
    }

    /// Evaluates `order` against the bar immediately following its
    /// placement (§4.9's "fill rules against the next bar"). Returns `None`
    /// if the order does not fill on this bar (e.g. a resting limit whose
    /// price was not touched, or a stop-limit still waiting to trigger).
    /// On fill, updates `account` and the position in place and persists
    /// both plus the order status.
    pub fn try_fill(
        &self,
        order: &mut PaperOrder,
        account: &mut PaperAccount,
        position: &PaperPosition,
        bar: &Bar,
    ) -> Result<Option<FillOutcome>> {
        if order.status != OrderStatus::Pending {
            return Ok(None);
        }
        let is_buy = matches!(order.side, Direction::Long);

        let fill_price = match order.order_type {
            OrderType::Market => Some(market_fill_price(bar, is_buy, self.default_slippage)),
            OrderType::Limit => limit_fill_price(bar, is_buy, order.limit_price.unwrap_or(bar.open)),
            OrderType::Stop => stop_fill_price(bar, is_buy, order.stop_price.unwrap_or(bar.open)),
            OrderType::StopLimit => {
                if !order.triggered {
                    let stop_price = order.stop_price.unwrap_or(bar.open);
                    let triggered = if is_buy { bar.high >= stop_price } else { bar.low <= stop_price };
                    if !triggered {
                        return Ok(None);
                    }
                    order.triggered = true;
                    self.store.mark_order_triggered(order.id)?;
                }
                limit_fill_price(bar, is_buy, order.limit_price.unwrap_or(bar.open))
            }
        };

        let Some(fill_price) = fill_price else {
            return Ok(None);
        };

        let trade = self.apply_fill(order, account, position, fill_price, bar.timestamp_utc)?;
        order.status = OrderStatus::Filled;
        self.store.update_order_status(order.id, OrderStatus::Filled, None)?;

        Ok(Some(FillOutcome {
            fill_price,
            commission: self.commission_per_fill,
            trade,
        }))
    }

    /// Applies a fill's effect to cash, position, and (when the fill closes
    /// or reduces an existing position) produces a `Trade` record. Average
    /// price updates on an add-to-position fill; a `Trade` is booked for
    /// the closed portion of a reduce/flip (§3, §4.9 "average-in or
    /// close-down").
    fn apply_fill(
        &self,
        order: &PaperOrder,
        account: &mut PaperAccount,
        position: &PaperPosition,
        fill_price: f64,
        fill_time: DateTime<Utc>,
    ) -> Result<Option<Trade>> {
        let signed_qty = match order.side {
            Direction::Long => order.quantity,
            Direction::Short => -order.quantity,
        };

        let mut pos = position.clone();
        let cash_delta = Amount::from_f64(-(signed_qty * fill_price)) - self.commission_per_fill;
        account.cash += cash_delta;
        // §4.9: commission is applied to P&L, not just cash, on every fill
        // (including one that only opens/adds to a position and has no
        // `Trade` of its own yet) so the accounting identity in §8.5 holds.
        account.metrics.realized_pnl -= self.commission_per_fill;

        let trade = if pos.is_flat() || pos.quantity.signum() == signed_qty.signum() {
            // Opening or adding to an existing position: roll the average
            // entry price; no trade closes yet.
            let opening_from_flat = pos.is_flat();
            let new_qty = pos.quantity + signed_qty;
            pos.avg_entry_price = if opening_from_flat {
                fill_price
            } else {
                (pos.avg_entry_price * pos.quantity.abs() + fill_price * signed_qty.abs()) / new_qty.abs()
            };
            pos.quantity = new_qty;
            if opening_from_flat {
                pos.entry_time = fill_time;
            }
            None
        } else {
            // Reducing or flipping: the overlapping quantity closes out at
            // the position's existing average entry price.
            let closing_qty = signed_qty.abs().min(pos.quantity.abs());
            let side = if pos.quantity > 0.0 { Direction::Long } else { Direction::Short };
            let trade = Trade::new(
                pos.ticker.clone(),
                pos.entry_time,
                pos.avg_entry_price,
                fill_time,
                fill_price,
                closing_qty,
                side,
                ExitReason::Manual,
            );
            account.metrics.realized_pnl += Amount::from_f64(trade.pnl);

            let remaining = pos.quantity + signed_qty;
            if remaining.signum() != pos.quantity.signum() && remaining.abs() > 1e-9 {
                // Flip: the excess opens a new position in the other direction.
                pos.avg_entry_price = fill_price;
                pos.entry_time = fill_time;
            }
            pos.quantity = remaining;
            Some(trade)
        };

        pos.mark_to_market(fill_price);
        self.store.upsert_position(&pos)?;

        account.equity = self.remark_equity(account, &pos)?;
        if account.equity > account.metrics.peak_equity {
            account.metrics.peak_equity = account.equity;
        }
        account.buying_power = account.cash;
        self.store.update_paper_account(account)?;

        Ok(trade)
    }

    /// Recomputes `equity = cash + Σ(position.quantity × current_price)`
    /// (§3's accounting identity), folding in the freshly updated position
    /// alongside whatever else the book currently holds.
    fn remark_equity(&self, account: &PaperAccount, updated: &PaperPosition) -> Result<Amount> {
        let positions = self.store.list_positions(account.id)?;
        let mut equity = account.cash;
        let mut seen_updated = false;
        for p in &positions {
            let notional = if p.ticker == updated.ticker {
                seen_updated = true;
                Amount::from_f64(updated.quantity * updated.current_price)
            } else {
                Amount::from_f64(p.quantity * p.current_price)
            };
            equity += notional;
        }
        if !seen_updated {
            equity += Amount::from_f64(updated.quantity * updated.current_price);
        }
        Ok(equity)
    }

    /// Marks every open position in `account` to `price_by_ticker`, updates
    /// equity, and — when `is_session_close` — records the day's equity
    /// snapshot (§4.9 "daily equity snapshot at session close").
    pub fn mark_to_market_all(
        &self,
        account: &mut PaperAccount,
        price_by_ticker: impl Fn(&str) -> Option<f64>,
        session_date: chrono::NaiveDate,
        is_session_close: bool,
    ) -> Result<()> {
        let mut positions = self.store.list_positions(account.id)?;
        let mut equity = account.cash;
        for pos in &mut positions {
            if let Some(price) = price_by_ticker(&pos.ticker) {
                pos.mark_to_market(price);
                self.store.upsert_position(pos)?;
            }
            equity += Amount::from_f64(pos.quantity * pos.current_price);
        }
        account.equity = equity;
        if equity > account.metrics.peak_equity {
            account.metrics.peak_equity = equity;
        }
        let drawdown = if account.metrics.peak_equity.to_f64() > 0.0 {
            1.0 - equity.to_f64() / account.metrics.peak_equity.to_f64()
        } else {
            0.0
        };
        account.metrics.max_drawdown_pct = account.metrics.max_drawdown_pct.max(drawdown);
        self.store.update_paper_account(account)?;
        if is_session_close {
            self.store.record_equity_snapshot(account.id, session_date, equity)?;
        }
        Ok(())
    }
}

fn market_fill_price(bar: &Bar, is_buy: bool, slippage: f64) -> f64 {
    if is_buy {
        bar.open * (1.0 + slippage)
    } else {
        bar.open * (1.0 - slippage)
    }
}

fn limit_fill_price(bar: &Bar, is_buy: bool, limit_price: f64) -> Option<f64> {
    if is_buy {
        (bar.low <= limit_price).then(|| limit_price.min(bar.open))
    } else {
        (bar.high >= limit_price).then(|| limit_price.max(bar.open))
    }
}

fn stop_fill_price(bar: &Bar, is_buy: bool, stop_price: f64) -> Option<f64> {
    if is_buy {
        (bar.high >= stop_price).then_some(stop_price)
    } else {
        (bar.low <= stop_price).then_some(stop_price)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bar_store::Timeframe;
    use chrono::Utc;

    fn bar(o: f64, h: f64, l: f64, c: f64) -> Bar {
        Bar {
            ticker: "AAPL".to_string(),
            timeframe: Timeframe::FIVE_MIN,
            timestamp_utc: Utc::now(),
            open: o,
            high: h,
            low: l,
            close: c,
            volume: 1000.0,
        }
    }

    #[test]
    fn market_buy_applies_positive_slippage() {
        let price = market_fill_price(&bar(100.0, 101.0, 99.0, 100.5), true, 0.0001);
        assert!((price - 100.01).abs() < 1e-6);
    }

    #[test]
    fn limit_buy_fills_only_when_low_touches_price() {
        let b = bar(100.0, 101.0, 99.5, 100.5);
        assert!(limit_fill_price(&b, true, 99.0).is_none());
        let filled = limit_fill_price(&b, true, 99.5).unwrap();
        assert!((filled - 99.5).abs() < 1e-9);
    }

    #[test]
    fn stop_sell_fills_at_stop_price_not_bar_low() {
        let b = bar(100.0, 100.5, 97.0, 98.0);
        let filled = stop_fill_price(&b, false, 98.5).unwrap();
        assert_eq!(filled, 98.5);
    }

    /// §8 property 5: after an open-then-close round trip, realized P&L
    /// (net of both fills' commissions) plus unrealized P&L must equal
    /// `equity - initial_balance` within $0.01.
    #[test]
    fn round_trip_commission_folds_into_realized_pnl_and_closes_the_identity() {
        let store = Store::open_in_memory().unwrap();
        let cfg = Config::default();
        let executor = VirtualExecutor::new(&store, &cfg);

        let agent_id = Uuid::new_v4();
        let mut account = PaperAccount::new(agent_id, Amount::from_f64(100_000.0));
        store.create_paper_account(&account).unwrap();

        let mut position = PaperPosition::flat(account.id, "AAPL".to_string());

        let mut buy = PaperOrder::new(
            account.id,
            "AAPL".to_string(),
            Direction::Long,
            OrderType::Market,
            100.0,
            None,
            None,
        );
        let open_bar = bar(100.0, 100.5, 99.5, 100.2);
        let outcome = executor
            .try_fill(&mut buy, &mut account, &position, &open_bar)
            .unwrap()
            .expect("market order fills on the next bar");
        assert!(outcome.trade.is_none(), "opening fill books no trade yet");
        position = store.list_positions(account.id).unwrap().remove(0);

        let mut sell = PaperOrder::new(
            account.id,
            "AAPL".to_string(),
            Direction::Short,
            OrderType::Market,
            100.0,
            None,
            None,
        );
        let close_bar = bar(101.0, 101.5, 100.5, 101.2);
        let outcome = executor
            .try_fill(&mut sell, &mut account, &position, &close_bar)
            .unwrap()
            .expect("closing market order fills on the next bar");
        assert!(outcome.trade.is_some(), "closing fill books a realized trade");

        let positions = store.list_positions(account.id).unwrap();
        let unrealized: f64 = positions.iter().map(|p| p.unrealized_pnl.to_f64()).sum();
        let identity_gap =
            (account.metrics.realized_pnl.to_f64() + unrealized) - (account.equity.to_f64() - 100_000.0);
        assert!(
            identity_gap.abs() < 0.01,
            "realized {} + unrealized {} should equal equity {} - initial 100000 (gap {})",
            account.metrics.realized_pnl.to_f64(),
            unrealized,
            account.equity.to_f64(),
            identity_gap
        );

        // Two fills at $0.50 commission each: realized P&L must reflect
        // both, not just the closing trade's raw price delta.
        let raw_trade_pnl = outcome.trade.as_ref().unwrap().pnl;
        assert!((account.metrics.realized_pnl.to_f64() - (raw_trade_pnl - 1.0)).abs() < 1e-6);
    }
}
