//! Reference Scanner Worker (§4.2.1): satisfies the Scanner Worker Protocol
//! (C2) by loading a scanner from the restricted declarative rule format
//! (`worker::rule::RuleSet`) and evaluating it against whichever bars the
//! supplied database path exposes.
//!
//! Generated-code execution is out of scope (§1) — this binary never
//! interprets arbitrary scanner source. If the file passed via
//! `--scanner-code-file` does not parse as a `RuleSet`, every request is
//! answered with `success: false` rather than guessed at.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use chrono::{TimeZone, Utc};
use clap::Parser;
use intraday_lab::bar_store::{BarStore, SqliteBarStore, Timeframe, TimeRange};
use intraday_lab::worker::protocol::{ScanRequest, ScanResponse, READY_SENTINEL};
use intraday_lab::worker::rule::{self, RuleSet};

#[derive(Parser, Debug)]
#[command(name = "scanner_host")]
#[command(about = "Reference Scanner Worker Protocol host")]
struct Args {
    /// Path to a scanner source file. Only the declarative `RuleSet` JSON
    /// format (§4.2.1) is executable; anything else disables signal
    /// generation for this run.
    #[arg(long)]
    scanner_code_file: Option<PathBuf>,
}

fn main() {
    let args = Args::parse();

    let rule_set = args.scanner_code_file.as_ref().and_then(|path| {
        let text = std::fs::read_to_string(path).ok()?;
        serde_json::from_str::<RuleSet>(&text).ok()
    });

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let _ = writeln!(out, "{READY_SENTINEL}");
    let _ = out.flush();

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<ScanRequest>(&line) {
            Ok(request) => handle_request(&request, rule_set.as_ref()),
            Err(e) => ScanResponse {
                request_id: String::new(),
                success: false,
                data: None,
                error: Some(format!("malformed scan request: {e}")),
            },
        };

        let _ = writeln!(out, "{}", serde_json::to_string(&response).unwrap_or_default());
        let _ = writeln!(out, "{READY_SENTINEL}");
        let _ = out.flush();
    }
}

fn handle_request(request: &ScanRequest, rule_set: Option<&RuleSet>) -> ScanResponse {
    let Some(rule_set) = rule_set else {
        return ScanResponse {
            request_id: request.request_id.clone(),
            success: false,
            data: None,
            error: Some("scanner code is not an executable rule set".to_string()),
        };
    };

    let store = match SqliteBarStore::open(&request.database_path) {
        Ok(store) => store,
        Err(e) => {
            return ScanResponse {
                request_id: request.request_id.clone(),
                success: false,
                data: None,
                error: Some(format!("opening bar store: {e}")),
            }
        }
    };

    let Some(as_of) = Utc.timestamp_opt(request.current_bar_timestamp, 0).single() else {
        return ScanResponse {
            request_id: request.request_id.clone(),
            success: false,
            data: None,
            error: Some("invalid current_bar_timestamp".to_string()),
        };
    };
    // Half-open upper bound; the protocol guarantees the store itself
    // already contains only bars at or before `as_of` (§4.2 step 3), this
    // is a defensive second filter.
    let range = TimeRange::new(chrono::DateTime::<Utc>::MIN_UTC, as_of + chrono::Duration::seconds(1));

    for ticker in &request.tickers {
        let bars = match store.get_bars(ticker, Timeframe::FIVE_MIN, range) {
            Ok(bars) => bars,
            Err(e) => {
                return ScanResponse {
                    request_id: request.request_id.clone(),
                    success: false,
                    data: None,
                    error: Some(format!("reading bars for {ticker}: {e}")),
                }
            }
        };
        if let Some(signal) = rule::evaluate(rule_set, ticker, &bars) {
            return ScanResponse {
                request_id: request.request_id.clone(),
                success: true,
                data: Some(signal),
                error: None,
            };
        }
    }

    ScanResponse {
        request_id: request.request_id.clone(),
        success: true,
        data: None,
        error: None,
    }
}
