use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::style;

use orchestra::adapter::default_adapters;
use orchestra::config::{ConfigOverrides, OrchestraConfig};
use orchestra::driver;
use orchestra::orchestrator::{Outcome, PlanReviewer};
use orchestra::scratch::ScratchArea;
use orchestra::state::StateManager;
use orchestra::state::manager::list_history;
use orchestra::validator;

#[derive(Parser)]
#[command(name = "orchestra")]
#[command(version, about = "Meta-orchestrator driving LLM CLI backends through plan/execute/audit loops")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Skip the interactive plan review gate
    #[arg(long, global = true)]
    pub yes: bool,

    #[arg(long, global = true)]
    pub workspace_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Launch a new session for a task
    Start {
        task: String,
        /// Run the file scheduler with multiple workers
        #[arg(long)]
        parallel: bool,
        /// Skip the auditor phase
        #[arg(long)]
        no_audit: bool,
        #[arg(long)]
        max_iterations: Option<u32>,
    },
    /// Continue the most recent resumable session
    Resume,
    /// As `start`, with audit/generation overlap enabled
    Pipeline { task: String },
    /// As `start`, re-triggering on workspace changes (debounced 500 ms)
    Watch { task: String },
    /// Run the architect only and print the plan
    DryRun { task: String },
    /// Dump current phase, iteration, and recent workflow steps
    Status,
    /// Print the current session plan
    Plan,
    /// List past sessions from the history index
    History {
        #[arg(long, default_value = "10")]
        limit: usize,
    },
    /// Run the validator across the last session's artifacts
    Validate,
    /// Remove session scratch
    Clean,
    /// Probe all adapter CLIs for availability
    Doctor,
    /// Write the default config file
    Init,
}

/// Exit codes: 0 ok, 1 task failed, 2 setup error, 3 cancelled.
const EXIT_SETUP_ERROR: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(&cli).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("{} {err:#}", style("error:").red().bold());
            ExitCode::from(EXIT_SETUP_ERROR)
        }
    }
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;
    let default = if verbose { "orchestra=debug" } else { "orchestra=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn workspace_dir(cli: &Cli) -> Result<PathBuf> {
    match &cli.workspace_dir {
        Some(dir) => Ok(dir.clone()),
        None => std::env::current_dir().context("Failed to get current directory"),
    }
}

fn resolve_config(cli: &Cli, overrides: ConfigOverrides) -> Result<OrchestraConfig> {
    let workspace = workspace_dir(cli)?;
    OrchestraConfig::resolve(&workspace, &overrides)
}

fn reviewer(cli: &Cli) -> PlanReviewer {
    if cli.yes || !console::user_attended() {
        PlanReviewer::AutoApprove
    } else {
        PlanReviewer::Interactive
    }
}

async fn run(cli: &Cli) -> Result<u8> {
    match &cli.command {
        Commands::Start {
            task,
            parallel,
            no_audit,
            max_iterations,
        } => {
            let config = resolve_config(
                cli,
                ConfigOverrides {
                    parallel: Some(*parallel),
                    audit_enabled: Some(!*no_audit),
                    max_iterations: *max_iterations,
                    ..Default::default()
                },
            )?;
            let adapters = default_adapters(&config);
            let outcome =
                driver::run_with_adapters(task, config, adapters, reviewer(cli), false).await?;
            report_outcome(&outcome);
            Ok(outcome.exit_code() as u8)
        }
        Commands::Resume => {
            let config = resolve_config(cli, ConfigOverrides::default())?;
            let outcome = driver::resume(config).await?;
            report_outcome(&outcome);
            Ok(outcome.exit_code() as u8)
        }
        Commands::Pipeline { task } => {
            let config = resolve_config(
                cli,
                ConfigOverrides {
                    parallel: Some(true),
                    pipeline: Some(true),
                    ..Default::default()
                },
            )?;
            let adapters = default_adapters(&config);
            let outcome =
                driver::run_with_adapters(task, config, adapters, reviewer(cli), false).await?;
            report_outcome(&outcome);
            Ok(outcome.exit_code() as u8)
        }
        Commands::Watch { task } => cmd_watch(cli, task).await,
        Commands::DryRun { task } => {
            let config = resolve_config(cli, ConfigOverrides::default())?;
            let outcome = driver::dry_run(task, config.clone()).await?;
            let scratch = ScratchArea::new(config.orchestra_dir());
            if let Some(plan) = scratch.read_plan() {
                println!("{plan}");
            }
            Ok(outcome.exit_code() as u8)
        }
        Commands::Status => cmd_status(cli),
        Commands::Plan => cmd_plan(cli),
        Commands::History { limit } => cmd_history(cli, *limit),
        Commands::Validate => cmd_validate(cli).await,
        Commands::Clean => cmd_clean(cli),
        Commands::Doctor => cmd_doctor(cli).await,
        Commands::Init => {
            let workspace = workspace_dir(cli)?;
            let path = OrchestraConfig::write_default(&workspace)?;
            println!("Wrote default config to {}", path.display());
            Ok(0)
        }
    }
}

fn report_outcome(outcome: &Outcome) {
    let label = match outcome.final_phase {
        orchestra::state::session::Phase::Completed => style("completed").green().bold(),
        orchestra::state::session::Phase::Cancelled => style("cancelled").yellow().bold(),
        _ => style(outcome.final_phase.as_str()).red().bold(),
    };
    match &outcome.reason {
        Some(reason) => println!("Session {label}: {reason}"),
        None => println!("Session {label}"),
    }
}

async fn cmd_watch(cli: &Cli, task: &str) -> Result<u8> {
    let config = resolve_config(cli, ConfigOverrides::default())?;
    let workspace = config.workspace_dir.clone();

    loop {
        // Each trigger is a fresh session; stale state would block the run.
        let state_file = ScratchArea::new(config.orchestra_dir()).state_path();
        if state_file.exists() {
            std::fs::remove_file(&state_file).ok();
        }

        let adapters = default_adapters(&config);
        match driver::run_with_adapters(task, config.clone(), adapters, reviewer(cli), false).await
        {
            Ok(outcome) => report_outcome(&outcome),
            Err(err) => eprintln!("{} {err:#}", style("run failed:").red()),
        }

        let baseline = orchestra::watch::fingerprint(&workspace);
        println!("Watching {} for changes...", workspace.display());
        orchestra::watch::await_change(&workspace, &baseline).await;
        println!("Change detected, re-running");
    }
}

fn cmd_status(cli: &Cli) -> Result<u8> {
    let config = resolve_config(cli, ConfigOverrides::default())?;
    let manager = match StateManager::load(config.orchestra_dir()) {
        Ok(manager) => manager,
        Err(_) => {
            println!("No session state found. Run `orchestra start <task>`.");
            return Ok(0);
        }
    };
    let session = manager.session();
    println!("Session:    {}", session.session_id);
    println!("Task:       {}", session.task);
    println!("Phase:      {}", session.phase);
    println!("Iteration:  {}", session.iteration);
    println!("Resumable:  {}", manager.can_resume());
    println!(
        "Attempts:   {} ({} ok, {} failed, {} rotations)",
        session.global_metrics.total_attempts,
        session.global_metrics.successful_attempts,
        session.global_metrics.failed_attempts,
        session.global_metrics.fallback_rotations,
    );
    println!("Est. cost:  ${:.4}", session.global_metrics.total_cost_estimate);

    println!("\nRecent workflow steps:");
    for step in session.workflow.iter().rev().take(10) {
        let file = step
            .file_path
            .as_ref()
            .map(|p| format!(" {}", p.display()))
            .unwrap_or_default();
        println!(
            "  {:<10} {:<9} {} attempts{}",
            step.agent_role,
            format!("{:?}", step.status).to_lowercase(),
            step.attempts.len(),
            file,
        );
    }
    Ok(0)
}

fn cmd_plan(cli: &Cli) -> Result<u8> {
    let config = resolve_config(cli, ConfigOverrides::default())?;
    let scratch = ScratchArea::new(config.orchestra_dir());
    match scratch.read_plan() {
        Some(plan) => {
            println!("{plan}");
            Ok(0)
        }
        None => {
            println!("No plan found for the current session.");
            Ok(0)
        }
    }
}

fn cmd_history(cli: &Cli, limit: usize) -> Result<u8> {
    let config = resolve_config(cli, ConfigOverrides::default())?;
    let sessions = list_history(&config.orchestra_dir(), limit)?;
    if sessions.is_empty() {
        println!("No past sessions.");
        return Ok(0);
    }
    println!(
        "{:<38} {:<16} {:<12} {}",
        "Session", "Phase", "Attempts", "Task"
    );
    for session in sessions {
        println!(
            "{:<38} {:<16} {:<12} {}",
            session.session_id,
            session.phase.as_str(),
            session.global_metrics.total_attempts,
            orchestra::util::truncate_str(&session.task, 48),
        );
    }
    Ok(0)
}

async fn cmd_validate(cli: &Cli) -> Result<u8> {
    let config = resolve_config(cli, ConfigOverrides::default())?;
    let manager = StateManager::load(config.orchestra_dir())
        .map_err(|e| anyhow::anyhow!("no session to validate: {e}"))?;

    let mut failures = 0usize;
    for file in &manager.session().files {
        let path = config.workspace_dir.join(&file.path);
        let outcome = validator::validate_file(&path, None).await;
        if outcome.valid {
            println!("{} {}", style("ok  ").green(), file.path.display());
        } else {
            failures += 1;
            println!("{} {}", style("FAIL").red().bold(), file.path.display());
            for error in &outcome.errors {
                println!("      {error}");
            }
        }
    }
    Ok(if failures == 0 { 0 } else { 1 })
}

fn cmd_clean(cli: &Cli) -> Result<u8> {
    let config = resolve_config(cli, ConfigOverrides::default())?;
    let scratch = ScratchArea::new(config.orchestra_dir());
    scratch.remove_all()?;
    println!("Removed {}", config.orchestra_dir().display());
    Ok(0)
}

async fn cmd_doctor(cli: &Cli) -> Result<u8> {
    let config = resolve_config(cli, ConfigOverrides::default())?;
    let adapters = default_adapters(&config);

    let probe_bar = indicatif::ProgressBar::new(adapters.len() as u64);
    probe_bar.set_style(
        indicatif::ProgressStyle::with_template("probing adapters {bar:24} {pos}/{len}")
            .expect("static template"),
    );
    let mut probes = Vec::with_capacity(adapters.len());
    for adapter in &adapters {
        let start = std::time::Instant::now();
        let available = adapter.is_available().await;
        probes.push((available, start.elapsed()));
        probe_bar.inc(1);
    }
    probe_bar.finish_and_clear();

    println!("{:<16} {:<10} {:<12} {:<10} availability", "adapter", "provider", "tier", "latency");
    let mut unavailable = 0usize;
    for (adapter, (available, latency)) in adapters.iter().zip(probes) {
        if !available {
            unavailable += 1;
        }
        let status = if available {
            style("available").green()
        } else {
            style("unavailable").red()
        };
        println!(
            "{:<16} {:<10} {:<12} {:<10} {}",
            adapter.info.id,
            adapter.info.provider.as_str(),
            format!("{:?}", adapter.info.tier).to_lowercase(),
            format!("{}ms", latency.as_millis()),
            status,
        );
    }
    if unavailable == adapters.len() {
        eprintln!("\nNo adapter is available. Check PATH and API key environment variables.");
        return Ok(1);
    }
    Ok(0)
}
