//! Execution Template Engine (C4, §4.4): walks Signals forward through bars
//! under each catalogue template, producing per-template scorecards and
//! picking the profit-factor winner.

use chrono::{Duration as ChronoDuration, NaiveDate};

use crate::bar_store::{Bar, BarStore, Timeframe, TimeRange};
use crate::domain::trade::{ExitReason, Trade};
use crate::market_hours;
use crate::signal::{Direction, Signal};

use super::templates::{ExitRule, TemplateKind, TimeExit, EXIT_CUTOFF, PRICE_ACTION_TRAILING_ACTIVATION_BARS};

#[derive(Debug, Clone)]
pub struct ScoreCard {
    pub template: TemplateKind,
    pub trade_count: usize,
    pub win_rate: f64,
    pub total_return: f64,
    pub profit_factor: f64,
    pub avg_win_pct: f64,
    pub avg_loss_pct: f64,
    pub sharpe_ratio: f64,
    pub trades: Vec<Trade>,
}

impl ScoreCard {
    fn empty(template: TemplateKind) -> Self {
        Self {
            template,
            trade_count: 0,
            win_rate: 0.0,
            total_return: 0.0,
            profit_factor: 0.0,
            avg_win_pct: 0.0,
            avg_loss_pct: 0.0,
            sharpe_ratio: 0.0,
            trades: Vec::new(),
        }
    }

    fn from_trades(template: TemplateKind, trades: Vec<Trade>) -> Self {
        if trades.is_empty() {
            return Self::empty(template);
        }
        let trade_count = trades.len();
        let wins: Vec<&Trade> = trades.iter().filter(|t| t.is_win()).collect();
        let losses: Vec<&Trade> = trades.iter().filter(|t| !t.is_win()).collect();

        let win_rate = wins.len() as f64 / trade_count as f64;
        let total_return: f64 = trades.iter().map(|t| t.pnl_pct).sum();

        let gross_win: f64 = wins.iter().map(|t| t.pnl_pct.max(0.0)).sum();
        let gross_loss: f64 = losses.iter().map(|t| t.pnl_pct.abs()).sum();
        let profit_factor = if gross_loss > 0.0 {
            gross_win / gross_loss
        } else if gross_win > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };

        let avg_win_pct = if wins.is_empty() {
            0.0
        } else {
            wins.iter().map(|t| t.pnl_pct).sum::<f64>() / wins.len() as f64
        };
        let avg_loss_pct = if losses.is_empty() {
            0.0
        } else {
            losses.iter().map(|t| t.pnl_pct).sum::<f64>() / losses.len() as f64
        };

        let sharpe_ratio = annualized_sharpe(trades.iter().map(|t| t.pnl_pct));

        Self {
            template,
            trade_count,
            win_rate,
            total_return,
            profit_factor,
            avg_win_pct,
            avg_loss_pct,
            sharpe_ratio,
            trades,
        }
    }
}

/// Sharpe ratio over a per-trade return series, treating each trade as one
/// trading day's return (at most one signal per ticker per day, §3), then
/// annualizing by `sqrt(252)` (§4.4).
fn annualized_sharpe(returns: impl Iterator<Item = f64>) -> f64 {
    let returns: Vec<f64> = returns.collect();
    if returns.len() < 2 {
        return 0.0;
    }
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let variance =
        returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (returns.len() - 1) as f64;
    let stddev = variance.sqrt();
    if stddev == 0.0 {
        return 0.0;
    }
    (mean / stddev) * (252.0_f64).sqrt()
}

#[derive(Debug, Clone)]
pub struct TemplateRunResult {
    pub scorecards: Vec<ScoreCard>,
    pub winner: Option<TemplateKind>,
}

impl TemplateRunResult {
    pub fn winner_trades(&self) -> &[Trade] {
        match self.winner {
            Some(kind) => self
                .scorecards
                .iter()
                .find(|s| s.template == kind)
                .map(|s| s.trades.as_slice())
                .unwrap_or(&[]),
            None => &[],
        }
    }
}

/// Runs all five catalogue templates against `signals`, fetching each
/// signal's day bars from `store` (§4.4 step 1). Picks the winner by max
/// profit factor among templates with >= 1 trade; tie-break (win rate, then
/// total return) (§8.6).
pub fn run_templates(store: &dyn BarStore, timeframe: Timeframe, signals: &[Signal]) -> TemplateRunResult {
    use rayon::prelude::*;

    // Each template walks every signal through its own bar-by-bar exit
    // simulation independently of the others; scoring the catalogue is
    // embarrassingly parallel across its five entries.
    let scorecards: Vec<ScoreCard> = TemplateKind::ALL
        .par_iter()
        .map(|&kind| run_single_template(store, timeframe, signals, kind))
        .collect();

    let winner = scorecards
        .iter()
        .filter(|s| s.trade_count > 0)
        .max_by(|a, b| {
            a.profit_factor
                .partial_cmp(&b.profit_factor)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.win_rate.partial_cmp(&b.win_rate).unwrap_or(std::cmp::Ordering::Equal))
                .then_with(|| {
                    a.total_return
                        .partial_cmp(&b.total_return)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
        })
        .map(|s| s.template);

    TemplateRunResult { scorecards, winner }
}

/// Scores one template against `signals`, without running the rest of the
/// catalogue. Used by discovery mode (§4.6), which only needs the
/// Conservative Scalper template to get a fast read on whether a scanner
/// produces signals at all.
pub fn run_single_template(
    store: &dyn BarStore,
    timeframe: Timeframe,
    signals: &[Signal],
    kind: TemplateKind,
) -> ScoreCard {
    let mut trades = Vec::new();
    for signal in signals {
        if let Some(day_bars) = fetch_day_bars(store, timeframe, &signal.ticker, signal.signal_date) {
            if let Some(trade) = simulate_signal(&day_bars, signal, kind) {
                trades.push(trade);
            }
        }
    }
    ScoreCard::from_trades(kind, trades)
}

fn fetch_day_bars(store: &dyn BarStore, timeframe: Timeframe, ticker: &str, day: NaiveDate) -> Option<Vec<Bar>> {
    let from = market_hours::eastern_date_time_to_utc(day, market_hours::REGULAR_OPEN);
    let to = market_hours::eastern_date_time_to_utc(day, market_hours::REGULAR_CLOSE) + ChronoDuration::minutes(1);
    let bars = store.get_bars(ticker, timeframe, TimeRange::new(from, to)).ok()?;
    if bars.is_empty() {
        None
    } else {
        Some(bars)
    }
}

/// Simulates one signal through one template's exit policy (§4.4 steps
/// 2-4). Returns `None` if the signal is skipped (past the exit cutoff, no
/// entry bar available, or — for the ATR template — too little history to
/// compute ATR).
fn simulate_signal(day_bars: &[Bar], signal: &Signal, kind: TemplateKind) -> Option<Trade> {
    if signal.signal_time >= EXIT_CUTOFF {
        return None;
    }

    let fired_at = market_hours::eastern_date_time_to_utc(signal.signal_date, signal.signal_time);
    let entry_idx = day_bars.iter().position(|b| b.timestamp_utc > fired_at)?;
    let entry_bar = &day_bars[entry_idx];
    let entry_price = entry_bar.open;

    let rule = kind.rule();
    let atr = if rule.atr_based {
        match compute_atr(day_bars, entry_idx, 14) {
            Some(v) => Some(v),
            None => return None,
        }
    } else {
        None
    };

    let (stop_dist, target_dist) = if rule.atr_based {
        let atr = atr.unwrap();
        (atr * rule.stop_loss_pct, atr * rule.take_profit_pct)
    } else {
        (entry_price * rule.stop_loss_pct, entry_price * rule.take_profit_pct)
    };

    let trailing_stop_dist = rule.trailing_stop_pct.map(|pct| {
        if rule.atr_based {
            atr.unwrap() * pct
        } else {
            entry_price * pct
        }
    });
    let trailing_activation = entry_price * rule.trailing_activation_pct;

    let (stop_level, target_level) = match signal.direction {
        Direction::Long => (entry_price - stop_dist, entry_price + target_dist),
        Direction::Short => (entry_price + stop_dist, entry_price - target_dist),
    };
    let mut stop_level = stop_level;
    // Once the trailing rule has raised `stop_level` past its initial
    // placement, a touch on it is a trailing-stop exit, not the original
    // fixed stop-loss (§3's `ExitReason::TrailingStop`).
    let mut stop_is_trailed = false;

    let mut profitable_bar_streak = 0u32;
    let mut last_bar_low_high: Option<(f64, f64)> = None;

    for (offset, bar) in day_bars[entry_idx + 1..].iter().enumerate() {
        let bars_since_entry = (offset + 1) as u32;

        if let TimeExit::AfterBars(n) = rule.time_exit {
            if bars_since_entry >= n {
                return Some(exit_trade(signal, entry_bar, entry_price, bar, bar.close, ExitReason::TimeExit));
            }
        }
        if let TimeExit::MinutesBeforeClose(minutes) = rule.time_exit {
            if let Some(remaining) = market_hours::minutes_to_close(&bar.timestamp_utc) {
                if remaining <= minutes {
                    return Some(exit_trade(signal, entry_bar, entry_price, bar, bar.close, ExitReason::TimeExit));
                }
            }
        }

        let (stop_hit, target_hit) = match signal.direction {
            Direction::Long => (bar.low <= stop_level, bar.high >= target_level),
            Direction::Short => (bar.high >= stop_level, bar.low <= target_level),
        };

        // Both touched in one bar: assume stop first for conservative
        // scoring (§4.4 step 3).
        if stop_hit {
            let reason = if stop_is_trailed { ExitReason::TrailingStop } else { ExitReason::StopLoss };
            return Some(exit_trade(signal, entry_bar, entry_price, bar, stop_level, reason));
        }
        if target_hit {
            return Some(exit_trade(signal, entry_bar, entry_price, bar, target_level, ExitReason::TakeProfit));
        }

        // Price-Action Trailing's bespoke rule: after two consecutive
        // profitable bars, trail the stop to the prior bar's low/high.
        if matches!(kind, TemplateKind::PriceActionTrailing) {
            let bar_is_profitable = match signal.direction {
                Direction::Long => bar.close > bar.open,
                Direction::Short => bar.close < bar.open,
            };
            if bar_is_profitable {
                profitable_bar_streak += 1;
            } else {
                profitable_bar_streak = 0;
            }
            if profitable_bar_streak >= PRICE_ACTION_TRAILING_ACTIVATION_BARS {
                if let Some((prev_low, prev_high)) = last_bar_low_high {
                    let trailed = match signal.direction {
                        Direction::Long => prev_low.max(stop_level),
                        Direction::Short => prev_high.min(stop_level),
                    };
                    if trailed != stop_level {
                        stop_is_trailed = true;
                    }
                    stop_level = trailed;
                }
            }
            last_bar_low_high = Some((bar.low, bar.high));
        } else if let Some(trail_dist) = trailing_stop_dist {
            // Generic percentage trailing stop, activated once price has
            // moved `trailing_activation_pct` in the favorable direction.
            let activated = match signal.direction {
                Direction::Long => bar.high >= entry_price + trailing_activation,
                Direction::Short => bar.low <= entry_price - trailing_activation,
            };
            if activated {
                let trailed = match signal.direction {
                    Direction::Long => stop_level.max(bar.high - trail_dist),
                    Direction::Short => stop_level.min(bar.low + trail_dist),
                };
                if trailed != stop_level {
                    stop_is_trailed = true;
                }
                stop_level = trailed;
            }
        }
    }

    // Forced exit at end of day: last bar's close (§4.4 step 4).
    let last_bar = day_bars.last()?;
    Some(exit_trade(signal, entry_bar, entry_price, last_bar, last_bar.close, ExitReason::EndOfDay))
}

fn exit_trade(
    signal: &Signal,
    entry_bar: &Bar,
    entry_price: f64,
    exit_bar: &Bar,
    exit_price: f64,
    reason: ExitReason,
) -> Trade {
    Trade::new(
        signal.ticker.clone(),
        entry_bar.timestamp_utc,
        entry_price,
        exit_bar.timestamp_utc,
        exit_price,
        1.0,
        signal.direction,
        reason,
    )
}

/// Average True Range over up to `lookback` bars ending at (and including)
/// `entry_idx` (§4.4.1). Requires at least 2 bars of history; returns
/// `None` (data gap) otherwise.
fn compute_atr(bars: &[Bar], entry_idx: usize, lookback: usize) -> Option<f64> {
    if entry_idx < 1 {
        return None;
    }
    let start = entry_idx.saturating_sub(lookback - 1).max(1);
    let mut true_ranges = Vec::new();
    for i in start..=entry_idx {
        let bar = &bars[i];
        let prev_close = bars[i - 1].close;
        let tr = (bar.high - bar.low)
            .max((bar.high - prev_close).abs())
            .max((bar.low - prev_close).abs());
        true_ranges.push(tr);
    }
    if true_ranges.len() < 2 {
        return None;
    }
    Some(true_ranges.iter().sum::<f64>() / true_ranges.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bar_store::{InMemoryBarStore, Timeframe};
    use chrono::{NaiveDate, NaiveTime};
    use std::collections::BTreeMap;

    fn bar(ticker: &str, day: NaiveDate, time: NaiveTime, o: f64, h: f64, l: f64, c: f64) -> Bar {
        Bar {
            ticker: ticker.to_string(),
            timeframe: Timeframe::FIVE_MIN,
            timestamp_utc: market_hours::eastern_date_time_to_utc(day, time),
            open: o,
            high: h,
            low: l,
            close: c,
            volume: 1000.0,
        }
    }

    fn signal(ticker: &str, day: NaiveDate, time: NaiveTime) -> Signal {
        Signal {
            ticker: ticker.to_string(),
            signal_date: day,
            signal_time: time,
            direction: Direction::Long,
            pattern_strength: 80.0,
            metrics: BTreeMap::new(),
        }
    }

    #[test]
    fn stop_loss_exit_uses_stop_level_not_close() {
        let day = NaiveDate::from_ymd_opt(2025, 10, 15).unwrap();
        let bars = vec![
            bar("AAA", day, NaiveTime::from_hms_opt(10, 0, 0).unwrap(), 10.0, 10.1, 9.9, 10.0),
            bar("AAA", day, NaiveTime::from_hms_opt(10, 5, 0).unwrap(), 10.0, 10.0, 9.85, 9.95),
        ];
        let sig = signal("AAA", day, NaiveTime::from_hms_opt(9, 55, 0).unwrap());
        let trade = simulate_signal(&bars, &sig, TemplateKind::ConservativeScalper).unwrap();
        assert_eq!(trade.exit_reason, ExitReason::StopLoss);
        // stop_loss_pct 1.0% of 10.0 entry = 0.10 -> stop level 9.90, not bar.close 9.95.
        assert!((trade.exit_price - 9.90).abs() < 1e-9);
    }

    #[test]
    fn trailing_stop_exit_is_tagged_trailing_not_stop_loss() {
        let day = NaiveDate::from_ymd_opt(2025, 10, 15).unwrap();
        let bars = vec![
            bar("AAA", day, NaiveTime::from_hms_opt(10, 0, 0).unwrap(), 100.0, 100.5, 99.5, 100.2),
            // High >= entry + 2% activates Aggressive Swing's trailing stop,
            // raising it to bar.high - 1.5% = 101.0.
            bar("AAA", day, NaiveTime::from_hms_opt(10, 5, 0).unwrap(), 100.2, 102.5, 100.0, 102.3),
            // Low touches the trailed level (101.0), not the original fixed
            // stop (97.5).
            bar("AAA", day, NaiveTime::from_hms_opt(10, 10, 0).unwrap(), 102.0, 102.0, 100.5, 101.0),
        ];
        let sig = signal("AAA", day, NaiveTime::from_hms_opt(9, 55, 0).unwrap());
        let trade = simulate_signal(&bars, &sig, TemplateKind::AggressiveSwing).unwrap();
        assert_eq!(trade.exit_reason, ExitReason::TrailingStop);
        assert!((trade.exit_price - 101.0).abs() < 1e-9);
    }

    #[test]
    fn winner_maximizes_profit_factor() {
        let store = InMemoryBarStore::new();
        let day = NaiveDate::from_ymd_opt(2025, 10, 15).unwrap();
        let mut bars = Vec::new();
        let mut t = NaiveTime::from_hms_opt(9, 30, 0).unwrap();
        let mut price = 10.0;
        for _ in 0..20 {
            bars.push(bar("AAA", day, t, price, price + 0.2, price - 0.05, price + 0.15));
            price += 0.15;
            t += ChronoDuration::minutes(5);
        }
        store.write_bars(&bars).unwrap();
        let sig = signal("AAA", day, NaiveTime::from_hms_opt(9, 30, 0).unwrap());
        let result = run_templates(&store, Timeframe::FIVE_MIN, &[sig]);
        assert!(result.winner.is_some());
        let winning_pf = result
            .scorecards
            .iter()
            .find(|s| s.template == result.winner.unwrap())
            .unwrap()
            .profit_factor;
        for sc in &result.scorecards {
            if sc.trade_count > 0 {
                assert!(sc.profit_factor <= winning_pf || winning_pf.is_infinite());
            }
        }
    }
}
