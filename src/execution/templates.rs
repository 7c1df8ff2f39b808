//! Execution Template catalogue (§4.4): five fixed exit strategies with a
//! deterministic rule per bar. Each entry is addressable by name (for the
//! CLI `--template` flag and C6 step 4's "named template" path) and by its
//! normalized source code (for content-addressed dedup, §4.4/§9).

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TemplateKind {
    ConservativeScalper,
    AggressiveSwing,
    TimeBasedIntraday,
    AtrAdaptive,
    PriceActionTrailing,
}

impl TemplateKind {
    pub const ALL: [TemplateKind; 5] = [
        TemplateKind::ConservativeScalper,
        TemplateKind::AggressiveSwing,
        TemplateKind::TimeBasedIntraday,
        TemplateKind::AtrAdaptive,
        TemplateKind::PriceActionTrailing,
    ];

    pub fn name(self) -> &'static str {
        match self {
            TemplateKind::ConservativeScalper => "conservative",
            TemplateKind::AggressiveSwing => "aggressive",
            TemplateKind::TimeBasedIntraday => "time_based_intraday",
            TemplateKind::AtrAdaptive => "atr_adaptive",
            TemplateKind::PriceActionTrailing => "price_action_trailing",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        TemplateKind::ALL.into_iter().find(|t| t.name() == name)
    }

    pub fn rule(self) -> ExitRule {
        match self {
            TemplateKind::ConservativeScalper => ExitRule {
                stop_loss_pct: 0.010,
                take_profit_pct: 0.015,
                trailing_stop_pct: Some(0.005),
                trailing_activation_pct: 0.0,
                time_exit: TimeExit::AfterBars(12),
                atr_based: false,
            },
            TemplateKind::AggressiveSwing => ExitRule {
                stop_loss_pct: 0.025,
                take_profit_pct: 0.050,
                trailing_stop_pct: Some(0.015),
                trailing_activation_pct: 0.02,
                time_exit: TimeExit::None,
                atr_based: false,
            },
            TemplateKind::TimeBasedIntraday => ExitRule {
                stop_loss_pct: 0.020,
                take_profit_pct: 0.030,
                trailing_stop_pct: None,
                trailing_activation_pct: 0.0,
                time_exit: TimeExit::MinutesBeforeClose(30),
                atr_based: false,
            },
            TemplateKind::AtrAdaptive => ExitRule {
                stop_loss_pct: 2.0, // interpreted as ATR multiples, see `atr_based`
                take_profit_pct: 3.0,
                trailing_stop_pct: Some(1.5),
                trailing_activation_pct: 0.0,
                time_exit: TimeExit::None,
                atr_based: true,
            },
            TemplateKind::PriceActionTrailing => ExitRule {
                stop_loss_pct: 0.020,
                take_profit_pct: 0.040,
                trailing_stop_pct: None,
                trailing_activation_pct: 0.0,
                time_exit: TimeExit::None,
                atr_based: false,
            },
        }
    }

    /// Canonical source text for this template, used both as the catalogue
    /// "code" (§3 Execution Template `code`) and as the input to the
    /// content-addressing hash (§4.4, §9).
    pub fn canonical_code(self) -> String {
        let rule = self.rule();
        format!(
            "template {}\nstop_loss={}\ntake_profit={}\ntrailing_stop={:?}\ntrailing_activation={}\ntime_exit={:?}\natr_based={}\n",
            self.name(),
            rule.stop_loss_pct,
            rule.take_profit_pct,
            rule.trailing_stop_pct,
            rule.trailing_activation_pct,
            rule.time_exit,
            rule.atr_based,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TimeExit {
    None,
    /// Force exit after N bars have elapsed since entry (Conservative
    /// Scalper's 12-bar rule).
    AfterBars(u32),
    /// Force exit N minutes before the regular session close (Time-Based
    /// Intraday's 30-minute rule).
    MinutesBeforeClose(i64),
}

/// A fully-resolved exit policy. Percent fields are fractions of entry
/// price (`0.01` = 1%) unless `atr_based`, in which case they are ATR
/// multiples (§4.4.1).
#[derive(Debug, Clone, Copy)]
pub struct ExitRule {
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    pub trailing_stop_pct: Option<f64>,
    pub trailing_activation_pct: f64,
    pub time_exit: TimeExit,
    pub atr_based: bool,
}

/// Price-Action Trailing's bespoke trailing rule (§4.4 catalogue table):
/// after two consecutive profitable bars, trail the stop to the prior bar's
/// low (long) / high (short). Not expressible as a flat percentage, so it
/// is handled separately by the walk loop in `execution::engine` rather
/// than folded into `ExitRule`.
pub const PRICE_ACTION_TRAILING_ACTIVATION_BARS: u32 = 2;

/// Exit-cutoff time of day (§4.4 step 2): signals at or after this time are
/// skipped since there is no room left in the session to manage a trade.
pub const EXIT_CUTOFF: NaiveTime = NaiveTime::from_hms_opt(15, 45, 0).unwrap();

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_round_trips_through_name() {
        for kind in TemplateKind::ALL {
            assert_eq!(TemplateKind::parse(kind.name()), Some(kind));
        }
    }

    #[test]
    fn canonical_code_is_stable_for_same_kind() {
        assert_eq!(
            TemplateKind::AggressiveSwing.canonical_code(),
            TemplateKind::AggressiveSwing.canonical_code()
        );
        assert_ne!(
            TemplateKind::AggressiveSwing.canonical_code(),
            TemplateKind::ConservativeScalper.canonical_code()
        );
    }
}
