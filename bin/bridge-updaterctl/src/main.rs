//! ---
//! bridge_section: "04-binaries"
//! bridge_subsection: "binary"
//! bridge_type: "source"
//! bridge_scope: "code"
//! bridge_description: "Control CLI for operators inspecting the updater agent."
//! bridge_version: "v0.1.0"
//! bridge_owner: "tbd"
//! ---
use std::path::PathBuf;

use anyhow::Result;
use bridge_updater_common::logging::init_console;
use bridge_updater_common::version::VersionInfo;
use clap::{ArgAction, Parser, Subcommand};

mod inspect;

#[derive(Debug, Parser)]
#[command(
    author,
    disable_version_flag = true,
    about = "Bridge updater control utility",
    long_about = None
)]
struct Cli {
    #[arg(
        short = 'V',
        long = "version",
        action = ArgAction::SetTrue,
        help = "Print extended version information and exit"
    )]
    version: bool,

    #[arg(long, value_name = "FILE", global = true, help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Show service state, installed revision and overlay summary")]
    Status {
        #[arg(long, help = "Emit JSON instead of text")]
        json: bool,
    },
    #[command(about = "Compare installed and published revisions without applying anything")]
    Check,
    #[command(about = "Print the committed LocalState record as JSON")]
    State,
}

fn main() -> Result<()> {
    init_console();
    let cli = Cli::parse();
    if cli.version {
        println!("{}", VersionInfo::current().extended());
        return Ok(());
    }
    let Some(command) = cli.command else {
        anyhow::bail!("no command given; see --help");
    };
    let config = inspect::load_config(cli.config.as_deref())?;
    match command {
        Commands::Status { json } => inspect::status(&config, json)?,
        Commands::Check => inspect::check(&config)?,
        Commands::State => inspect::state(&config)?,
    }
    Ok(())
}
