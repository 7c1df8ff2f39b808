//! Wire types for the Scanner Worker line-delimited JSON protocol (§4.2,
//! §6 "Scanner Worker").

use serde::{Deserialize, Serialize};

use crate::signal::Signal;

/// Sentinel line the worker prints once on startup and after each response
/// (§4.2 steps 1 and 4).
pub const READY_SENTINEL: &str = "READY";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanRequest {
    pub request_id: String,
    pub database_path: String,
    pub tickers: Vec<String>,
    pub current_bar_timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResponse {
    pub request_id: String,
    pub success: bool,
    pub data: Option<Signal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
