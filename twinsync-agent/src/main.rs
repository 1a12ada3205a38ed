//! twinsync - source/backup server sync orchestration
//!
//! Entry point: parses the command line, loads the configuration once and
//! runs the requested command. An interrupt (SIGINT/SIGTERM) drops the
//! running workflow immediately, without any further step.

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use twinsync_agent::config::{Config, Role};
use twinsync_agent::error::{EXIT_CONFIG, EXIT_INTERRUPTED, EXIT_REMOTE_EXEC, EXIT_TIMEOUT};
use twinsync_agent::execution::{HostRunner, SharedExecutor, SshTarget, SystemExecutor};
use twinsync_agent::notify::{CommandNotifier, LogNotifier, SharedNotifier};
use twinsync_agent::orchestrator::{Orchestrator, RunOutcome};
use twinsync_agent::probe::Prober;
use twinsync_agent::state::TriggerFile;
use twinsync_agent::sync::{is_root_path, pairs_for, SyncCategory};

#[derive(Parser)]
#[command(name = "twinsync", version, about = "Source/backup server sync orchestration")]
struct Cli {
    /// Config file (default: $TWINSYNC_CONFIG, then <config dir>/twinsync/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the workflow
    Run(RunArgs),
    /// Validate the configuration and print the sync plan
    Check,
    /// Probe the peer and verify remote execution
    Probe,
    /// Consume the local trigger file
    Cleanup,
}

#[derive(Args)]
struct RunArgs {
    /// Override the configured role
    #[arg(long, value_enum)]
    role: Option<RoleArg>,

    /// Run even without a trigger file
    #[arg(long)]
    force: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum RoleArg {
    Initiator,
    Responder,
}

impl From<RoleArg> for Role {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Initiator => Role::Initiator,
            RoleArg::Responder => Role::Responder,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = match Config::load(cli.config.as_deref()).await {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let executor: SharedExecutor = Arc::new(SystemExecutor);

    match cli.command {
        Commands::Run(args) => {
            if let Some(role) = args.role {
                config.role = role.into();
            }
            if args.force {
                config.flags.force_start = true;
            }
            run(config, executor).await
        }
        Commands::Check => {
            print_plan(&config);
            ExitCode::SUCCESS
        }
        Commands::Probe => probe(&config, executor).await,
        Commands::Cleanup => match TriggerFile::new(config.state.trigger_file.clone()).consume().await {
            Ok(true) => {
                println!("trigger {} consumed", config.state.trigger_file.display());
                ExitCode::SUCCESS
            }
            Ok(false) => {
                println!("no trigger at {}", config.state.trigger_file.display());
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!("Cleanup failed: {:#}", e);
                ExitCode::FAILURE
            }
        },
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "twinsync=debug,twinsync_agent=debug" } else { "twinsync=info,twinsync_agent=info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .init();
}

fn build_notifier(config: &Config, executor: &SharedExecutor) -> SharedNotifier {
    match config.notify.command.as_deref() {
        Some(template) => match CommandNotifier::new(executor.clone(), template) {
            Ok(notifier) => Arc::new(notifier),
            Err(e) => {
                warn!("Invalid notify command, logging only: {}", e);
                Arc::new(LogNotifier)
            }
        },
        None => Arc::new(LogNotifier),
    }
}

async fn run(config: Config, executor: SharedExecutor) -> ExitCode {
    let notifier = build_notifier(&config, &executor);
    let orchestrator = Orchestrator::new(config, executor, notifier);
    let run_id = orchestrator.run_id();

    tokio::select! {
        report = orchestrator.run() => {
            match &report.outcome {
                RunOutcome::Completed => info!("Run {} completed", run_id),
                RunOutcome::NothingToDo(reason) => info!("Run {} had nothing to do: {}", run_id, reason),
                RunOutcome::Aborted(e) => error!("Run {} aborted: {}", run_id, e),
            }
            ExitCode::from(report.exit_code())
        }
        _ = interrupted() => {
            warn!("Run {} interrupted, stopping without further steps", run_id);
            ExitCode::from(EXIT_INTERRUPTED)
        }
    }
}

async fn interrupted() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn probe(config: &Config, executor: SharedExecutor) -> ExitCode {
    let runner = HostRunner::new(executor, SshTarget::from_config(config));
    let prober = Prober::new(
        runner,
        Duration::from_secs(config.timing.probe_timeout_secs),
        config.timing.command_timeout(),
    );

    let reachable = prober.probe().await;
    println!("{} reachable: {}", config.peer.address, reachable);
    if !reachable {
        return ExitCode::from(EXIT_TIMEOUT);
    }

    let remote_exec = prober.verify_remote_exec().await;
    println!("{} remote execution: {}", config.peer.address, remote_exec);
    if remote_exec {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_REMOTE_EXEC)
    }
}

fn print_plan(config: &Config) {
    let flags = &config.flags;
    println!("role:              {}", config.role);
    println!("peer:              {}@{}:{}", config.peer.ssh_user, config.peer.address, config.peer.ssh_port);
    println!("power method:      {:?}", config.peer.power.method);
    println!("copy main data:    {}", flags.copy_main_data);
    println!("copy app data:     {}", flags.copy_app_data);
    println!("force start:       {}", flags.force_start);
    println!("check and start:   {}", flags.check_and_start);
    println!("switch server:     {}", flags.switch_server);
    println!("power off target:  {:?}", flags.power_off_target);
    println!("continue with VMs: {}", flags.continue_if_vms_running);
    println!("trigger file:      {}", config.state.trigger_file.display());

    for category in [SyncCategory::Main, SyncCategory::AppData] {
        for pair in pairs_for(category, &config.sync) {
            let status = if !pair.is_configured() {
                "unset"
            } else if is_root_path(&pair.destination) {
                "REJECTED (root destination)"
            } else {
                "ok"
            };
            println!("{:<9} #{} {} -> {} [{}]", category.to_string(), pair.index, pair.source, pair.destination, status);
        }
    }
}
