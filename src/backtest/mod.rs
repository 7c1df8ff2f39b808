//! Real-Time Backtest Engine (C3, §4.3): replays historical bars one at a
//! time per (ticker, day) through a persistent Scanner Worker, eliminating
//! look-ahead bias by construction — the worker is never handed anything
//! but a private bar store containing a strict prefix of the day.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use tokio::sync::Semaphore;
use tracing::{info, warn};
use uuid::Uuid;

use crate::bar_store::{Bar, BarStore, SqliteBarStore, Timeframe, TimeRange};
use crate::config::Config;
use crate::domain::backtest_record::TickerRunStats;
use crate::market_hours;
use crate::signal::Signal;
use crate::worker::protocol::ScanRequest;
use crate::worker::{next_request_id, ScannerWorker};

#[derive(Debug, Clone)]
pub struct BacktestRunConfig {
    pub warmup_bars: usize,
    pub timeframe: Timeframe,
    pub scan_timeout: Duration,
    pub worker_cmd: Vec<String>,
    pub max_parallel_tickers: usize,
}

impl BacktestRunConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            warmup_bars: crate::config::DEFAULT_WARMUP_BARS,
            timeframe: Timeframe(crate::config::DEFAULT_TIMEFRAME_MINUTES),
            scan_timeout: config.scan_request_timeout,
            worker_cmd: config.scanner_worker_cmd.clone(),
            max_parallel_tickers: num_cpus_fallback(),
        }
    }
}

fn num_cpus_fallback() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

#[derive(Debug, Default)]
pub struct BacktestRunOutcome {
    pub signals: Vec<Signal>,
    pub per_ticker_stats: BTreeMap<String, TickerRunStats>,
}

/// Runs the C3 algorithm over every ticker in `tickers`, in parallel bounded
/// by `config.max_parallel_tickers` (§4.3.1). Tickers with zero bars in
/// range are skipped silently (§4.3 edge cases).
pub async fn run_backtest(
    store: Arc<dyn BarStore>,
    config: &BacktestRunConfig,
    tickers: &[String],
    start: NaiveDate,
    end: NaiveDate,
) -> BacktestRunOutcome {
    let semaphore = Arc::new(Semaphore::new(config.max_parallel_tickers.max(1)));
    let mut handles = Vec::with_capacity(tickers.len());

    for ticker in tickers {
        let store = store.clone();
        let config = config.clone();
        let ticker = ticker.clone();
        let semaphore = semaphore.clone();
        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
            run_ticker(store.as_ref(), &config, &ticker, start, end).await
        }));
    }

    let mut outcome = BacktestRunOutcome::default();
    for handle in handles {
        match handle.await {
            Ok((ticker, signals, stats)) => {
                outcome.signals.extend(signals);
                outcome.per_ticker_stats.insert(ticker, stats);
            }
            Err(e) => warn!(error = %e, "ticker backtest task panicked"),
        }
    }
    outcome
}

async fn run_ticker(
    store: &dyn BarStore,
    config: &BacktestRunConfig,
    ticker: &str,
    start: NaiveDate,
    end: NaiveDate,
) -> (String, Vec<Signal>, TickerRunStats) {
    let mut stats = TickerRunStats::default();
    let mut signals = Vec::new();

    let from = market_hours::eastern_date_time_to_utc(start, market_hours::REGULAR_OPEN);
    let to = market_hours::eastern_date_time_to_utc(end, market_hours::REGULAR_CLOSE)
        + chrono::Duration::days(1);
    let all_bars = match store.get_bars(ticker, config.timeframe, TimeRange::new(from, to)) {
        Ok(bars) if !bars.is_empty() => bars,
        _ => {
            info!(ticker, "no bars in range, skipping ticker");
            return (ticker.to_string(), signals, stats);
        }
    };

    let days = group_by_eastern_day(&all_bars);

    let mut worker = match ScannerWorker::spawn(&config.worker_cmd, config.scan_timeout).await {
        Ok(w) => Some(w),
        Err(e) => {
            warn!(ticker, error = %e, "failed to spawn scanner worker");
            None
        }
    };

    for (day, bars) in days {
        if bars.len() < config.warmup_bars {
            stats.days_skipped_data_gap += 1;
            continue;
        }

        if worker.is_none() {
            worker = ScannerWorker::spawn(&config.worker_cmd, config.scan_timeout).await.ok();
        }
        let Some(w) = worker.as_mut() else {
            stats.days_failed_worker += 1;
            continue;
        };

        match run_day(w, config, ticker, day, &bars).await {
            Ok(Some(signal)) => {
                signals.push(signal);
                stats.days_processed += 1;
            }
            Ok(None) => {
                stats.days_processed += 1;
            }
            Err(e) => {
                warn!(ticker, %day, error = %e, "day failed, retrying once with a fresh worker");
                if let Some(w) = worker.take() {
                    w.shutdown().await;
                }
                worker = ScannerWorker::spawn(&config.worker_cmd, config.scan_timeout).await.ok();
                let retry_result = match worker.as_mut() {
                    Some(w) => run_day(w, config, ticker, day, &bars).await,
                    None => Err(crate::error::EngineError::WorkerCrash("respawn failed".to_string())),
                };
                match retry_result {
                    Ok(Some(signal)) => {
                        signals.push(signal);
                        stats.days_processed += 1;
                    }
                    Ok(None) => stats.days_processed += 1,
                    Err(e2) => {
                        warn!(ticker, %day, error = %e2, "day failed after retry, giving up for this day");
                        stats.days_failed_worker += 1;
                    }
                }
            }
        }
    }

    if let Some(w) = worker {
        w.shutdown().await;
    }

    (ticker.to_string(), signals, stats)
}

/// Runs one (ticker, day)'s worth of bars through the worker, returning at
/// most one accepted [`Signal`] (§4.3 step 3 and §8.2).
async fn run_day(
    worker: &mut ScannerWorker,
    config: &BacktestRunConfig,
    ticker: &str,
    day: NaiveDate,
    bars: &[Bar],
) -> Result<Option<Signal>, crate::error::EngineError> {
    let private_path = temp_db_path(ticker, day);
    let private_store = SqliteBarStore::open(private_path.to_str().unwrap())?;
    private_store.write_bars(&bars[..config.warmup_bars])?;

    let mut accepted: Option<Signal> = None;

    for bar in &bars[config.warmup_bars..] {
        private_store.write_bars(std::slice::from_ref(bar))?;

        let request = ScanRequest {
            request_id: next_request_id(),
            database_path: private_path.to_string_lossy().to_string(),
            tickers: vec![ticker.to_string()],
            current_bar_timestamp: bar.timestamp_utc.timestamp(),
        };

        let response = worker.scan(request).await?;
        if !response.success {
            continue;
        }
        let Some(signal) = response.data else { continue };

        if !market_hours::is_regular_hours(&market_hours::eastern_date_time_to_utc(
            signal.signal_date,
            signal.signal_time,
        )) {
            continue; // §4.3 edge case: reject out-of-hours signals.
        }

        // At-most-one signal per ticker per day (§3, §8.2): take the first
        // accepted signal and stop scanning. A poorly-written scanner that
        // would have kept firing never gets the chance to produce a
        // conflicting duplicate, since we break here.
        accepted = Some(signal);
        break;
    }

    let _ = std::fs::remove_file(&private_path);
    Ok(accepted)
}

fn temp_db_path(ticker: &str, day: NaiveDate) -> PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!(
        "intraday-lab-private-{}-{}-{}.db",
        ticker,
        day,
        Uuid::new_v4()
    ));
    path
}

fn group_by_eastern_day(bars: &[Bar]) -> Vec<(NaiveDate, Vec<Bar>)> {
    let mut by_day: BTreeMap<NaiveDate, Vec<Bar>> = BTreeMap::new();
    for bar in bars {
        let day = market_hours::to_eastern_naive(&bar.timestamp_utc).date();
        by_day.entry(day).or_default().push(bar.clone());
    }
    for bars in by_day.values_mut() {
        bars.sort_by_key(|b| b.timestamp_utc);
    }
    by_day.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bar_store::InMemoryBarStore;
    use chrono::NaiveTime;

    fn bar(ticker: &str, ts: chrono::DateTime<chrono::Utc>, o: f64, h: f64, l: f64, c: f64) -> Bar {
        Bar {
            ticker: ticker.to_string(),
            timeframe: Timeframe::FIVE_MIN,
            timestamp_utc: ts,
            open: o,
            high: h,
            low: l,
            close: c,
            volume: 1_000.0,
        }
    }

    #[test]
    fn groups_bars_by_eastern_calendar_day() {
        let day1 = NaiveDate::from_ymd_opt(2025, 10, 15).unwrap();
        let day2 = NaiveDate::from_ymd_opt(2025, 10, 16).unwrap();
        let t1 = market_hours::eastern_date_time_to_utc(day1, NaiveTime::from_hms_opt(9, 30, 0).unwrap());
        let t2 = market_hours::eastern_date_time_to_utc(day2, NaiveTime::from_hms_opt(9, 30, 0).unwrap());
        let bars = vec![bar("AAA", t1, 1.0, 1.0, 1.0, 1.0), bar("AAA", t2, 1.0, 1.0, 1.0, 1.0)];
        let grouped = group_by_eastern_day(&bars);
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[0].0, day1);
        assert_eq!(grouped[1].0, day2);
    }
}
