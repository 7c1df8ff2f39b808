//! Lab CLI (§6): the control surface for agents, learning iterations,
//! one-off backtests, and walk-forward validation runs.
//!
//! `DATABASE_PATH` / `BAR_DATABASE_PATH` select the store and bar store
//! respectively; every other knob is read by `Config::from_env` (§6.1).

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use uuid::Uuid;

use intraday_lab::bar_store::{BarStore, SqliteBarStore};
use intraday_lab::backtest::{self, BacktestRunConfig};
use intraday_lab::collaborator::{LlmCollaborator, StaticRuleCollaborator};
use intraday_lab::config::Config;
use intraday_lab::domain::agent::{Agent, AgentStatus, Personality};
use intraday_lab::domain::backtest_record::{Backtest, BacktestMetrics, BacktestStatus};
use intraday_lab::domain::execution_template::ExecutionTemplate;
use intraday_lab::error::EngineError;
use intraday_lab::execution::engine;
use intraday_lab::execution::templates::TemplateKind;
use intraday_lab::lifecycle::LifecycleManager;
use intraday_lab::pipeline::{ExecutionChoice, IterationRequest, LearningPipeline};
use intraday_lab::store::Store;
use intraday_lab::walk_forward::{WalkForwardConfig, WalkForwardCoordinator};

#[derive(Parser, Debug)]
#[command(name = "lab")]
#[command(about = "Autonomous intraday equity-trading laboratory control surface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create, list, and graduate agents.
    Agents {
        #[command(subcommand)]
        command: AgentCommands,
    },
    /// Run a single learning iteration for an agent.
    Iterations {
        #[command(subcommand)]
        command: IterationCommands,
    },
    /// Run a standalone backtest against a persisted scanner version.
    Backtests {
        #[command(subcommand)]
        command: BacktestCommands,
    },
    /// Run walk-forward validation for an agent.
    WalkForward {
        agent_id: Uuid,
        #[arg(long)]
        start: NaiveDate,
        #[arg(long)]
        end: NaiveDate,
        #[arg(long)]
        tickers: String,
        #[arg(long)]
        train_months: u32,
        #[arg(long)]
        test_months: u32,
        #[arg(long, default_value_t = 0)]
        overlap_months: u32,
    },
}

#[derive(Subcommand, Debug)]
enum AgentCommands {
    /// Creates a new agent in the `learning` state.
    Create {
        #[arg(long)]
        instructions: String,
        /// Free text describing the agent's risk appetite (§3 "personality").
        #[arg(long, default_value = "moderate")]
        risk_tolerance: String,
        /// Free text describing the agent's trading style.
        #[arg(long, default_value = "intraday momentum")]
        trading_style: String,
        #[arg(long, default_value_t = false)]
        allow_multiple_signals_per_day: bool,
        #[arg(long, default_value_t = false)]
        discovery_mode: bool,
    },
    /// Prints `id\tname\tstatus` for every agent, one per line.
    List,
    /// Promotes an agent to the next lifecycle stage (§4.10).
    Graduate {
        id: Uuid,
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// Manually demotes an agent (§4.10.1). Always permitted.
    Downgrade { id: Uuid, to: String },
}

#[derive(Subcommand, Debug)]
enum IterationCommands {
    /// Runs one learning iteration for `agent_id` (§4.6).
    Start {
        agent_id: Uuid,
        #[arg(long)]
        guidance: Option<String>,
        #[arg(long)]
        tickers: String,
        #[arg(long)]
        start: NaiveDate,
        #[arg(long)]
        end: NaiveDate,
        #[arg(long)]
        template: Option<String>,
        #[arg(long)]
        custom_code: Option<String>,
        #[arg(long, default_value_t = false)]
        explain_zero_signal: bool,
    },
}

#[derive(Subcommand, Debug)]
enum BacktestCommands {
    /// Backtests a previously generated scanner version over `[start, end)`
    /// (§6). `--universe` is accepted as a synonym for `--tickers`.
    Run {
        #[arg(long)]
        scanner: Uuid,
        #[arg(long)]
        start: NaiveDate,
        #[arg(long)]
        end: NaiveDate,
        #[arg(long)]
        tickers: Option<String>,
        #[arg(long)]
        universe: Option<String>,
        #[arg(long)]
        template: Option<String>,
        #[arg(long)]
        custom_code: Option<String>,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start async runtime: {e}");
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(run()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            let code = e
                .downcast_ref::<EngineError>()
                .map(|e| e.exit_code())
                .unwrap_or(1);
            ExitCode::from(code as u8)
        }
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?;
    let store = Store::open(&config.database_path)
        .with_context(|| format!("opening store at {}", config.database_path))?;

    let bar_db_path =
        std::env::var("BAR_DATABASE_PATH").unwrap_or_else(|_| "./bars.db".to_string());
    let bars: Arc<dyn BarStore> = Arc::new(
        SqliteBarStore::open(&bar_db_path)
            .with_context(|| format!("opening bar store at {bar_db_path}"))?,
    );
    let collaborator: Arc<dyn LlmCollaborator> = Arc::new(StaticRuleCollaborator);

    match cli.command {
        Commands::Agents { command } => run_agents(&store, &config, command),
        Commands::Iterations { command } => {
            run_iterations(&store, bars, collaborator, &config, command).await
        }
        Commands::Backtests { command } => run_backtests(&store, bars, &config, command).await,
        Commands::WalkForward {
            agent_id,
            start,
            end,
            tickers,
            train_months,
            test_months,
            overlap_months,
        } => {
            run_walk_forward(
                &store,
                bars,
                collaborator,
                &config,
                agent_id,
                parse_tickers(&tickers),
                start,
                end,
                WalkForwardConfig {
                    train_months,
                    test_months,
                    overlap_months,
                },
            )
            .await
        }
    }
}

fn run_agents(store: &Store, config: &Config, command: AgentCommands) -> anyhow::Result<()> {
    match command {
        AgentCommands::Create {
            instructions,
            risk_tolerance,
            trading_style,
            allow_multiple_signals_per_day,
            discovery_mode,
        } => {
            let mut agent = Agent::new(
                derive_agent_name(&instructions),
                instructions,
                Personality {
                    risk_tolerance,
                    trading_style,
                },
            );
            agent.allow_multiple_signals_per_day = allow_multiple_signals_per_day;
            agent.discovery_mode = discovery_mode;
            store.insert_agent(&agent)?;
            println!("{}", agent.id);
            Ok(())
        }
        AgentCommands::List => {
            for agent in store.list_agents()? {
                println!("{}\t{}\t{}", agent.id, agent.name, agent.status.as_str());
            }
            Ok(())
        }
        AgentCommands::Graduate { id, force } => {
            let agent = store
                .get_agent(id)?
                .ok_or_else(|| anyhow!("unknown agent {id}"))?;
            let target = match agent.status {
                AgentStatus::Learning => AgentStatus::PaperTrading,
                AgentStatus::PaperTrading => AgentStatus::LiveTrading,
                AgentStatus::LiveTrading => {
                    return Err(anyhow!("agent {id} is already live_trading"))
                }
            };
            let manager = LifecycleManager::new(store);
            let check = manager.graduate(id, target, force, config)?;
            println!(
                "graduated to {} (eligible={}, iterations={}, mean_win_rate={:.3}, mean_sharpe={:.3})",
                target.as_str(),
                check.eligible,
                check.iterations,
                check.mean_win_rate,
                check.mean_sharpe
            );
            Ok(())
        }
        AgentCommands::Downgrade { id, to } => {
            let target = AgentStatus::parse(&to)
                .ok_or_else(|| anyhow!("unknown status '{to}' (expected learning|paper_trading|live_trading)"))?;
            let manager = LifecycleManager::new(store);
            manager.downgrade(id, target)?;
            println!("downgraded to {}", target.as_str());
            Ok(())
        }
    }
}

async fn run_iterations(
    store: &Store,
    bars: Arc<dyn BarStore>,
    collaborator: Arc<dyn LlmCollaborator>,
    config: &Config,
    command: IterationCommands,
) -> anyhow::Result<()> {
    let IterationCommands::Start {
        agent_id,
        guidance,
        tickers,
        start,
        end,
        template,
        custom_code,
        explain_zero_signal,
    } = command;

    let execution = resolve_execution_choice(template, custom_code)?;
    let pipeline = LearningPipeline::new(store, bars, collaborator, config);
    let iteration = pipeline
        .run_iteration(
            agent_id,
            IterationRequest {
                tickers: parse_tickers(&tickers),
                start,
                end,
                execution,
                manual_guidance: guidance,
                explain_zero_signal,
            },
        )
        .await?;

    println!(
        "iteration {} status={:?} signals={} trades={}",
        iteration.iteration_number, iteration.status, iteration.signals_found, iteration.trades_executed
    );
    if !iteration.failure_reasons.is_empty() {
        for reason in &iteration.failure_reasons {
            eprintln!("  - {reason}");
        }
    }
    Ok(())
}

async fn run_backtests(
    store: &Store,
    bars: Arc<dyn BarStore>,
    config: &Config,
    command: BacktestCommands,
) -> anyhow::Result<()> {
    let BacktestCommands::Run {
        scanner,
        start,
        end,
        tickers,
        universe,
        template,
        custom_code,
    } = command;

    let ticker_list = tickers
        .or(universe)
        .map(|s| parse_tickers(&s))
        .ok_or_else(|| anyhow!("one of --tickers or --universe is required"))?;

    let version = store
        .get_scanner_version(scanner)?
        .ok_or_else(|| anyhow!("unknown scanner version {scanner}"))?;

    let execution = resolve_execution_choice(template, custom_code)?;
    let execution_template = match &execution {
        ExecutionChoice::Template(kind) => {
            ExecutionTemplate::new(kind.name().to_string(), kind.canonical_code())
        }
        ExecutionChoice::Custom(code) => {
            ExecutionTemplate::new("Custom Execution".to_string(), code.clone())
        }
    };
    let execution_template = store.get_or_create_execution_template(execution_template)?;

    let code_path = write_scanner_code_file(&version.code)?;
    let mut run_config = BacktestRunConfig::from_config(config);
    run_config.worker_cmd.push("--scanner-code-file".to_string());
    run_config
        .worker_cmd
        .push(code_path.to_string_lossy().to_string());

    let outcome = backtest::run_backtest(bars.clone(), &run_config, &ticker_list, start, end).await;
    let _ = std::fs::remove_file(&code_path);

    let card = match &execution {
        ExecutionChoice::Template(kind) => {
            engine::run_single_template(bars.as_ref(), run_config.timeframe, &outcome.signals, *kind)
        }
        ExecutionChoice::Custom(_) => {
            let result = engine::run_templates(bars.as_ref(), run_config.timeframe, &outcome.signals);
            result
                .winner
                .and_then(|kind| result.scorecards.iter().find(|s| s.template == kind).cloned())
                .unwrap_or_else(|| {
                    engine::run_single_template(
                        bars.as_ref(),
                        run_config.timeframe,
                        &outcome.signals,
                        TemplateKind::ConservativeScalper,
                    )
                })
        }
    };

    let metrics = BacktestMetrics::from(&card);
    let backtest = Backtest {
        id: Uuid::new_v4(),
        scanner_version_id: version.id,
        start_date: start,
        end_date: end,
        tickers: ticker_list,
        execution_template_id: execution_template.id,
        signals: outcome.signals,
        trades: card.trades,
        metrics: metrics.clone(),
        status: BacktestStatus::Completed,
        per_ticker_stats: outcome.per_ticker_stats,
        error: None,
        created_at: chrono::Utc::now(),
    };
    store.insert_backtest(&backtest)?;

    println!(
        "backtest {} trades={} win_rate={:.3} total_return={:.3} profit_factor={:.3} sharpe={:.3}",
        backtest.id,
        metrics.trade_count,
        metrics.win_rate,
        metrics.total_return,
        metrics.profit_factor,
        metrics.sharpe_ratio
    );
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_walk_forward(
    store: &Store,
    bars: Arc<dyn BarStore>,
    collaborator: Arc<dyn LlmCollaborator>,
    config: &Config,
    agent_id: Uuid,
    tickers: Vec<String>,
    start: NaiveDate,
    end: NaiveDate,
    wf_config: WalkForwardConfig,
) -> anyhow::Result<()> {
    let coordinator = WalkForwardCoordinator::new(store, bars, collaborator, config);
    let result = coordinator
        .run(agent_id, &tickers, start, end, &wf_config)
        .await?;

    println!(
        "scanner={} periods={} mean_return={:.4} t_stat={:.3} p_value={:.4} consistency={:.2}",
        result.scanner_version_id,
        result.periods.len(),
        result.mean_return,
        result.t_statistic,
        result.p_value,
        result.consistency
    );
    Ok(())
}

fn resolve_execution_choice(
    template: Option<String>,
    custom_code: Option<String>,
) -> anyhow::Result<ExecutionChoice> {
    match (template, custom_code) {
        (Some(_), Some(_)) => Err(anyhow!("specify only one of --template or --custom-code")),
        (Some(name), None) => {
            let kind = TemplateKind::parse(&name)
                .ok_or_else(|| anyhow!("unknown execution template '{name}'"))?;
            Ok(ExecutionChoice::Template(kind))
        }
        (None, Some(code)) => Ok(ExecutionChoice::Custom(code)),
        (None, None) => Ok(ExecutionChoice::Template(TemplateKind::ConservativeScalper)),
    }
}

fn write_scanner_code_file(code: &str) -> anyhow::Result<PathBuf> {
    let mut path = std::env::temp_dir();
    path.push(format!("intraday-lab-scanner-{}.js", Uuid::new_v4()));
    std::fs::write(&path, code)
        .with_context(|| format!("writing scanner code file {}", path.display()))?;
    Ok(path)
}

fn parse_tickers(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}

/// A short, human-readable agent name derived from its instructions, the
/// same way `scanner::derive_name` reads a generation prompt (§3).
fn derive_agent_name(instructions: &str) -> String {
    let first_clause = instructions
        .split(['.', ',', '\n'])
        .next()
        .unwrap_or(instructions)
        .trim();
    if first_clause.is_empty() {
        "Agent".to_string()
    } else {
        let mut chars = first_clause.chars();
        match chars.next() {
            Some(c) => c.to_uppercase().collect::<String>() + chars.as_str(),
            None => "Agent".to_string(),
        }
    }
}
