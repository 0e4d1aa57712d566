//! ---
//! bridge_section: "04-binaries"
//! bridge_subsection: "binary"
//! bridge_type: "source"
//! bridge_scope: "code"
//! bridge_description: "Binary entrypoint for the updater agent."
//! bridge_version: "v0.1.0"
//! bridge_owner: "tbd"
//! ---
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

use anyhow::{Context, Result};
use bridge_updater_common::config::{AppConfig, DEFAULT_CONFIG_PATH};
use bridge_updater_common::logging::{init_tracing, ConsoleTarget};
use bridge_updater_common::version::VersionInfo;
use bridge_updater_core::{
    new_registry, CycleMetrics, CycleReport, InstanceLock, LockError, UpdateOrchestrator,
};
use clap::{ArgAction, Parser, Subcommand};
use tokio::signal;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Exit code when another cycle holds the instance lock or the lock is unusable.
const EXIT_LOCK: u8 = 3;

#[derive(Debug, Parser)]
#[command(
    author,
    disable_version_flag = true,
    about = "Self-updating deployment agent for the bridge service",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(
        short = 'V',
        long = "version",
        action = ArgAction::SetTrue,
        help = "Print extended version information and exit"
    )]
    version: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run update cycles on the configured interval until terminated")]
    Run,
    #[command(about = "Run a single update cycle and exit with its outcome code")]
    Cycle {
        #[arg(long, help = "Print the cycle report as JSON on stdout")]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let version = VersionInfo::current();
    if cli.version {
        println!("{}", version.extended());
        return Ok(ExitCode::SUCCESS);
    }

    let candidates = [
        PathBuf::from(DEFAULT_CONFIG_PATH),
        PathBuf::from("configs/example.toml"),
    ];
    let loaded = AppConfig::resolve(cli.config.as_deref(), &candidates)?;
    let config = loaded.config;
    let command = cli.command.unwrap_or(Commands::Run);
    let console = match command {
        Commands::Cycle { json: true } => ConsoleTarget::Stderr,
        _ => ConsoleTarget::Stdout,
    };
    // Dropped when main returns, after the last cycle line is queued.
    let _log_guard = init_tracing("bridge-updaterd", &config.logging, console)?;
    info!(
        version = %version.cli_string(),
        config = %loaded
            .source
            .as_ref()
            .map_or_else(|| "<defaults>".to_owned(), |p| p.display().to_string()),
        install_root = %config.install.root.display(),
        "configuration loaded"
    );

    let metrics = CycleMetrics::new(new_registry()).context("failed to register cycle metrics")?;
    let orchestrator = UpdateOrchestrator::from_config(&config)
        .context("invalid dependency install command")?
        .with_metrics(metrics.clone());

    match command {
        Commands::Run => {
            run_daemon(&orchestrator, &config, &metrics).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Cycle { json } => {
            let code = match locked_cycle(&orchestrator, &config.state.lock_path).await {
                Ok(report) => {
                    export_metrics(&metrics, &config);
                    if json {
                        println!("{}", serde_json::to_string_pretty(&report)?);
                    }
                    ExitCode::from(exit_byte(&report))
                }
                Err(err) => {
                    error!(error = %err, "cycle not started");
                    ExitCode::from(EXIT_LOCK)
                }
            };
            Ok(code)
        }
    }
}

/// One cycle under the single-instance lock.
async fn locked_cycle(
    orchestrator: &UpdateOrchestrator,
    lock_path: &Path,
) -> Result<CycleReport, LockError> {
    let mut lock = InstanceLock::open(lock_path)?;
    let _guard = lock.try_acquire()?;
    Ok(orchestrator.run_cycle().await)
}

async fn run_daemon(
    orchestrator: &UpdateOrchestrator,
    config: &AppConfig,
    metrics: &CycleMetrics,
) -> Result<()> {
    let schedule = &config.schedule;
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    if !schedule.initial_delay.is_zero() {
        info!(delay = ?schedule.initial_delay, "delaying first cycle");
        tokio::select! {
            _ = &mut shutdown => {
                info!("termination signal received before first cycle");
                return Ok(());
            }
            _ = tokio::time::sleep(schedule.initial_delay) => {}
        }
    }

    let mut ticker = tokio::time::interval(schedule.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(interval = ?schedule.interval, "agent running; waiting for termination signal");

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("termination signal received; shutting down");
                break;
            }
            _ = ticker.tick() => {
                // The cycle runs to completion; a signal is only seen between cycles.
                let started = Instant::now();
                match locked_cycle(orchestrator, &config.state.lock_path).await {
                    Ok(report) => {
                        debug!(
                            cycle = report.cycle,
                            outcome = %report.outcome,
                            exit_code = report.outcome.exit_code(),
                            elapsed = ?started.elapsed(),
                            "cycle finished"
                        );
                    }
                    Err(LockError::AlreadyRunning(path)) => {
                        warn!(lock = %path.display(), "another cycle is running; skipping tick");
                    }
                    Err(err) => error!(error = %err, "cycle not started"),
                }
                export_metrics(metrics, config);
            }
        }
    }
    Ok(())
}

fn exit_byte(report: &CycleReport) -> u8 {
    u8::try_from(report.outcome.exit_code()).unwrap_or(1)
}

fn export_metrics(metrics: &CycleMetrics, config: &AppConfig) {
    if let Some(path) = &config.metrics.textfile {
        if let Err(err) = metrics.write_textfile(path) {
            warn!(path = %path.display(), error = %err, "failed to write metrics textfile");
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        tokio::select! {
            _ = ctrl_c() => {},
            _ = terminate() => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c().await;
    }
}

async fn ctrl_c() {
    if let Err(err) = signal::ctrl_c().await {
        warn!(?err, "failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            term.recv().await;
        }
        Err(err) => {
            warn!(?err, "failed to install SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}
