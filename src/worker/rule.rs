//! Reference scanner rule format (§4.2.1): a minimal declarative condition
//! language over the visible bar prefix, used by the bundled `scanner_host`
//! binary so the engine can be exercised end-to-end without an external
//! code generator. Production deployments point `SCANNER_WORKER_CMD` at any
//! executable speaking the §4.2 protocol; this format is not the "scanner
//! code" the static validator (C11) inspects — that operates on whatever
//! source text the LLM collaborator emits.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::bar_store::Bar;
use crate::signal::{Direction, Signal};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSet {
    pub rules: Vec<Rule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub direction: Direction,
    pub pattern_strength: f64,
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Condition {
    /// The last visible bar closed above its open (bullish bar).
    CloseAboveOpen,
    /// The last visible bar closed below its open (bearish bar).
    CloseBelowOpen,
    /// Percent change of the last close versus the close `lookback` bars
    /// earlier is at least `pct` (signed; negative for down moves).
    PctChangeAtLeast { lookback: usize, pct: f64 },
    /// The last bar's volume is at least `multiple`x the average of the
    /// preceding `lookback` bars' volume.
    VolumeMultipleOfAverage { lookback: usize, multiple: f64 },
    /// Always fires — used by test fixtures emulating a scanner that
    /// signals on every bar after warm-up (§8 S3).
    AlwaysTrue,
}

impl Condition {
    fn evaluate(&self, bars: &[Bar]) -> bool {
        let Some(last) = bars.last() else { return false };
        match self {
            Condition::CloseAboveOpen => last.close > last.open,
            Condition::CloseBelowOpen => last.close < last.open,
            Condition::PctChangeAtLeast { lookback, pct } => {
                if bars.len() <= *lookback {
                    return false;
                }
                let base = bars[bars.len() - 1 - lookback].close;
                if base == 0.0 {
                    return false;
                }
                let change = (last.close - base) / base;
                if *pct >= 0.0 {
                    change >= *pct
                } else {
                    change <= *pct
                }
            }
            Condition::VolumeMultipleOfAverage { lookback, multiple } => {
                if bars.len() <= *lookback {
                    return false;
                }
                let window = &bars[bars.len() - 1 - lookback..bars.len() - 1];
                let avg = window.iter().map(|b| b.volume).sum::<f64>() / window.len() as f64;
                avg > 0.0 && last.volume >= avg * multiple
            }
            Condition::AlwaysTrue => true,
        }
    }
}

/// Evaluates every rule in order against the visible bar prefix, returning
/// the first match as a `Signal` anchored to the last visible bar's
/// timestamp. `bars` must already be restricted to `timestamp <= current`
/// by the caller (the engine only ever hands the worker a prefix, §4.2
/// step 3) — this function has no way to enforce that itself.
pub fn evaluate(rule_set: &RuleSet, ticker: &str, bars: &[Bar]) -> Option<Signal> {
    let last = bars.last()?;
    for rule in &rule_set.rules {
        if rule.conditions.iter().all(|c| c.evaluate(bars)) {
            return Some(Signal {
                ticker: ticker.to_string(),
                signal_date: last.timestamp_utc.date_naive(),
                signal_time: crate::market_hours::to_eastern_naive(&last.timestamp_utc).time(),
                direction: rule.direction,
                pattern_strength: rule.pattern_strength,
                metrics: BTreeMap::new(),
            });
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bar_store::Timeframe;
    use chrono::Utc;

    fn bar(o: f64, h: f64, l: f64, c: f64, v: f64) -> Bar {
        Bar {
            ticker: "AAA".to_string(),
            timeframe: Timeframe::FIVE_MIN,
            timestamp_utc: Utc::now(),
            open: o,
            high: h,
            low: l,
            close: c,
            volume: v,
        }
    }

    #[test]
    fn always_true_fires_every_call() {
        let rules = RuleSet {
            rules: vec![Rule {
                direction: Direction::Long,
                pattern_strength: 70.0,
                conditions: vec![Condition::AlwaysTrue],
            }],
        };
        let bars = vec![bar(10.0, 10.1, 9.9, 10.05, 1000.0)];
        assert!(evaluate(&rules, "AAA", &bars).is_some());
    }

    #[test]
    fn pct_change_condition_requires_lookback_depth() {
        let cond = Condition::PctChangeAtLeast { lookback: 2, pct: 0.01 };
        let bars = vec![bar(10.0, 10.0, 10.0, 10.0, 100.0), bar(10.0, 10.0, 10.0, 10.2, 100.0)];
        // Only 2 bars total, lookback of 2 needs bars.len() > 2.
        assert!(!cond.evaluate(&bars));
    }

    #[test]
    fn no_rule_matches_returns_none() {
        let rules = RuleSet {
            rules: vec![Rule {
                direction: Direction::Long,
                pattern_strength: 70.0,
                conditions: vec![Condition::CloseBelowOpen],
            }],
        };
        let bars = vec![bar(10.0, 10.1, 9.9, 10.05, 1000.0)];
        assert!(evaluate(&rules, "AAA", &bars).is_none());
    }
}
