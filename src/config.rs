//! Environment-driven configuration (§6, §6.1).
//!
//! Mirrors the closed set of environment variables named in the spec. Every
//! knob has a sane default so the lab runs unconfigured in development, the
//! same way the upstream `Config::from_env` does.

use std::env;
use std::time::Duration;

/// Warm-up bar count before a scanner is allowed to fire (§4.3).
pub const DEFAULT_WARMUP_BARS: usize = 30;

/// Default engine timeframe in minutes (§4.3).
pub const DEFAULT_TIMEFRAME_MINUTES: i64 = 5;

#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite store (§6.1).
    pub database_path: String,

    /// Integer token cap for LLM generations (§6). Not enforced by this
    /// crate directly (token accounting is out of scope, §1) but surfaced
    /// so the validator's truncation heuristic can be tuned against it.
    pub max_tokens_generation: u32,

    /// When true, backtests use the real-time, bar-by-bar engine (§4.3).
    /// When false, the legacy whole-day mode is used for comparison only.
    pub realtime_simulation: bool,

    /// Required true for standard learning iterations to run template scoring.
    pub enable_template_execution: bool,

    /// Live-feed poll period. Should equal the bar timeframe.
    pub poll_interval: Duration,

    /// Ring-buffer size per ticker in live/paper mode (§4.8).
    pub max_bars_per_ticker: usize,

    /// Soft per-iteration deadline (§5).
    pub iteration_deadline: Duration,

    /// Confidence decrement applied to an under-delivering knowledge row
    /// per iteration (§4.6.1).
    pub knowledge_decay_step: f64,

    /// Executable (and argv) used to satisfy the scanner worker protocol
    /// (§4.2.1). Defaults to the bundled reference host.
    pub scanner_worker_cmd: Vec<String>,

    /// Per-request scan deadline (§4.2, §5).
    pub scan_request_timeout: Duration,

    // --- Risk limits (§4.9) ---
    pub default_slippage_bps: f64,
    pub commission_per_fill: f64,
    pub max_position_pct_of_equity: f64,
    pub max_open_positions: usize,
    pub min_cash_pct_of_equity: f64,

    // --- Graduation thresholds (§4.10) ---
    pub paper_trading_thresholds: GraduationThresholds,
    pub live_trading_thresholds: GraduationThresholds,
    pub default_paper_balance: f64,
}

/// Thresholds an agent's iteration history must clear to graduate (§4.10).
#[derive(Debug, Clone, Copy)]
pub struct GraduationThresholds {
    pub min_iterations: usize,
    pub min_mean_win_rate: f64,
    pub min_mean_sharpe: f64,
    pub min_mean_return: f64,
    pub min_total_signals: usize,
    pub recent_window: usize,
    pub recent_min_win_rate: f64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let database_path =
            env::var("DATABASE_PATH").unwrap_or_else(|_| "./trading_lab.db".to_string());

        let max_tokens_generation = env_parse_or("MAX_TOKENS_GENERATION", 8_000);
        let realtime_simulation = env_bool_or("REALTIME_SIMULATION", true);
        let enable_template_execution = env_bool_or("ENABLE_TEMPLATE_EXECUTION", true);

        let poll_interval_ms: u64 = env_parse_or("POLL_INTERVAL_MS", 300_000);
        let max_bars_per_ticker = env_parse_or("MAX_BARS_PER_TICKER", 100usize);
        let iteration_deadline_secs: u64 = env_parse_or("ITERATION_DEADLINE_SECS", 900);
        let knowledge_decay_step = env_parse_or("KNOWLEDGE_DECAY_STEP", 0.1);

        let scanner_worker_cmd = env::var("SCANNER_WORKER_CMD")
            .ok()
            .map(|s| s.split_whitespace().map(|p| p.to_string()).collect())
            .unwrap_or_else(|| vec!["scanner_host".to_string()]);

        Ok(Self {
            database_path,
            max_tokens_generation,
            realtime_simulation,
            enable_template_execution,
            poll_interval: Duration::from_millis(poll_interval_ms),
            max_bars_per_ticker,
            iteration_deadline: Duration::from_secs(iteration_deadline_secs),
            knowledge_decay_step,
            scanner_worker_cmd,
            scan_request_timeout: Duration::from_secs(120),
            default_slippage_bps: env_parse_or("DEFAULT_SLIPPAGE_BPS", 1.0),
            commission_per_fill: env_parse_or("COMMISSION_PER_FILL", 0.50),
            max_position_pct_of_equity: env_parse_or("MAX_POSITION_PCT_OF_EQUITY", 0.20),
            max_open_positions: env_parse_or("MAX_OPEN_POSITIONS", 10usize),
            min_cash_pct_of_equity: env_parse_or("MIN_CASH_PCT_OF_EQUITY", 0.05),
            paper_trading_thresholds: GraduationThresholds {
                min_iterations: 20,
                min_mean_win_rate: 0.60,
                min_mean_sharpe: 2.0,
                min_mean_return: 0.05,
                min_total_signals: 50,
                recent_window: 5,
                recent_min_win_rate: 0.55,
            },
            live_trading_thresholds: GraduationThresholds {
                min_iterations: 50,
                min_mean_win_rate: 0.60,
                min_mean_sharpe: 2.5,
                min_mean_return: 0.10,
                min_total_signals: 200,
                recent_window: 10,
                recent_min_win_rate: 0.60,
            },
            default_paper_balance: env_parse_or("DEFAULT_PAPER_BALANCE", 100_000.0),
        })
    }
}

fn env_parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_bool_or(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
        .unwrap_or(default)
}

impl Default for Config {
    fn default() -> Self {
        // Safe to unwrap: from_env() only fails on I/O errors we don't hit
        // when no .env file / env vars are present.
        Config::from_env().expect("default config construction cannot fail")
    }
}
