//! The `Agent` entity and its lifecycle (§3, §4.10).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Learning,
    PaperTrading,
    LiveTrading,
}

impl AgentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentStatus::Learning => "learning",
            AgentStatus::PaperTrading => "paper_trading",
            AgentStatus::LiveTrading => "live_trading",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "learning" => Some(AgentStatus::Learning),
            "paper_trading" => Some(AgentStatus::PaperTrading),
            "live_trading" => Some(AgentStatus::LiveTrading),
            _ => None,
        }
    }
}

/// Risk tolerance / trading style pair that shapes LLM analysis prompts and
/// default position sizing (§3 "personality").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Personality {
    pub risk_tolerance: String,
    pub trading_style: String,
}

impl Default for Personality {
    fn default() -> Self {
        Self {
            risk_tolerance: "moderate".to_string(),
            trading_style: "intraday momentum".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub name: String,
    pub instructions: String,
    pub personality: Personality,
    pub status: AgentStatus,
    /// Opts an agent out of the at-most-one-signal-per-day default (§9 Open
    /// Question). Default `false`.
    pub allow_multiple_signals_per_day: bool,
    /// Discovery mode (§4.6): skips analysis/knowledge extraction and scores
    /// only the Conservative Scalper template, for fast signal-search loops.
    pub discovery_mode: bool,
    pub created_at: DateTime<Utc>,
}

impl Agent {
    pub fn new(name: String, instructions: String, personality: Personality) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            instructions,
            personality,
            status: AgentStatus::Learning,
            allow_multiple_signals_per_day: false,
            discovery_mode: false,
            created_at: Utc::now(),
        }
    }
}
