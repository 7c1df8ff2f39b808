//! Typed error kinds shared across the engine (§7 of the design).
//!
//! Component-internal plumbing mostly propagates with `anyhow::Result`, matching
//! the application-orchestration layers of the codebase this lab is built on.
//! At the seams where callers need to branch on *which* kind of failure occurred
//! (CLI exit codes, order rejection reasons, backtest metadata) we use this
//! typed enum instead.

use std::fmt;

/// The closed set of error kinds a caller may need to branch on.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Bars missing for a requested range. Recovered locally; never fatal.
    #[error("data gap: {0}")]
    DataGap(String),

    /// Scanner subprocess exited abnormally.
    #[error("scanner worker crashed: {0}")]
    WorkerCrash(String),

    /// Generated code looks truncated (unbalanced braces/missing terminator).
    #[error("generated code truncated: {0}")]
    Truncation(String),

    /// Scanner failed the static look-ahead validator.
    #[error("scanner failed validation: {0}")]
    ValidationFailure(String),

    /// A request or iteration deadline was breached.
    #[error("timed out: {0}")]
    Timeout(String),

    /// An order violated a pre-fill risk check. Not a process-level error —
    /// callers turn this into a `PaperOrder` with `status = REJECTED`.
    #[error("risk check rejected order: {0}")]
    RiskRejected(String),

    /// The live market-data feed disconnected.
    #[error("market data feed disconnected: {0}")]
    FeedDisconnect(String),

    /// Storage unavailable or corrupted. Halts the affected supervisor only.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Anything else.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<crate::bar_store::BarStoreError> for EngineError {
    fn from(e: crate::bar_store::BarStoreError) -> Self {
        match e {
            crate::bar_store::BarStoreError::NotFound => EngineError::DataGap(e.to_string()),
            crate::bar_store::BarStoreError::WriteRejected(msg) => EngineError::Internal(msg),
            crate::bar_store::BarStoreError::Storage(inner) => EngineError::Storage(inner),
        }
    }
}

impl EngineError {
    /// Maps an error kind to the CLI exit code contract in §6.
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::ValidationFailure(_) => 2,
            EngineError::Timeout(_) => 3,
            EngineError::DataGap(_) => 4,
            EngineError::WorkerCrash(_) => 5,
            _ => 1,
        }
    }
}

/// A violated structural rule reported by the static scanner validator.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Violation {
    pub rule: String,
    pub message: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.rule, self.message)
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
