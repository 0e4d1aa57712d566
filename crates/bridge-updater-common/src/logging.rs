//! ---
//! bridge_section: "01-common"
//! bridge_subsection: "module"
//! bridge_type: "source"
//! bridge_scope: "code"
//! bridge_description: "Tracing subscriber setup for stdout and rolling log files."
//! bridge_version: "v0.1.0"
//! bridge_owner: "tbd"
//! ---
use std::io::IsTerminal;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::daily;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

const LOG_ENV: &str = "BRIDGE_UPDATER_LOG";
const DEFAULT_DIRECTIVE: &str = "info";

/// Available log formats for the agent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    Pretty,
    StructuredJson,
}

/// Stream carrying the console copy of every event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConsoleTarget {
    #[default]
    Stdout,
    /// Keeps stdout free for machine-readable command output.
    Stderr,
}

/// Flushes the non-blocking writers on drop.
///
/// Hold it in `main` until the process is about to exit; events still queued
/// when it is dropped are written out before the drop returns.
#[must_use = "dropping the guard stops log delivery"]
#[derive(Debug)]
pub struct LogGuard {
    _console: WorkerGuard,
    _file: WorkerGuard,
}

fn env_filter() -> EnvFilter {
    match std::env::var(LOG_ENV) {
        Ok(directive) => EnvFilter::try_new(directive).unwrap_or_else(|err| {
            eprintln!(
                "invalid {} directive ({}); defaulting to {}",
                LOG_ENV, err, DEFAULT_DIRECTIVE
            );
            EnvFilter::new(DEFAULT_DIRECTIVE)
        }),
        Err(_) => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE)),
    }
}

/// Initialize the tracing subscriber based on configuration and environment variables.
///
/// * `BRIDGE_UPDATER_LOG` overrides the filter (e.g. `info`, `debug,bridge_updater_core=trace`).
///   When unset the standard `RUST_LOG` variable is honoured, finally defaulting to `info`.
/// * Every event goes to the console stream, which the process supervisor
///   forwards to the system journal, and to a daily rolling file under
///   `config.directory`. ANSI colours are only used when the console stream
///   is a terminal.
pub fn init_tracing(
    service_name: &str,
    config: &LoggingConfig,
    console: ConsoleTarget,
) -> Result<LogGuard> {
    std::fs::create_dir_all(&config.directory).with_context(|| {
        format!(
            "unable to create log directory {}",
            config.directory.display()
        )
    })?;
    let prefix = config
        .file_prefix
        .clone()
        .unwrap_or_else(|| service_name.to_owned());

    let file_appender = daily(&config.directory, format!("{}.log", prefix));
    let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);
    let (console_writer, console_guard, ansi) = match console {
        ConsoleTarget::Stdout => {
            let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());
            (writer, guard, std::io::stdout().is_terminal())
        }
        ConsoleTarget::Stderr => {
            let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());
            (writer, guard, std::io::stderr().is_terminal())
        }
    };

    let console_layer = match config.format {
        LogFormat::StructuredJson => fmt::layer()
            .with_target(false)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .json()
            .with_writer(console_writer)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_target(false)
            .with_ansi(ansi)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(console_writer)
            .boxed(),
    };

    let file_layer = fmt::layer()
        .with_target(true)
        .with_ansi(false)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_writer(file_writer)
        .boxed();

    tracing_subscriber::registry()
        .with(env_filter())
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .ok();

    info!(
        service = %service_name,
        tag = %config.tag,
        log_dir = %config.directory.display(),
        format = ?config.format,
        console = ?console,
        "tracing initialised"
    );
    Ok(LogGuard {
        _console: console_guard,
        _file: file_guard,
    })
}

/// Stderr-only subscriber for short-lived operator commands.
pub fn init_console() {
    let _ = tracing_subscriber::registry()
        .with(env_filter())
        .with(
            fmt::layer()
                .with_target(false)
                .with_ansi(std::io::stderr().is_terminal())
                .with_writer(std::io::stderr),
        )
        .try_init();
}
