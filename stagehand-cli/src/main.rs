//! Stagehand CLI - runs partial-state join scenarios
//!
//! Each scenario spawns a fresh simulated homeserver and peer emulator, so a
//! run needs nothing but a free pair of local ports.

mod commands;
mod scenarios;

use std::path::PathBuf;

use clap::Parser;
use stagehand_core::HarnessConfig;
use stagehand_core::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "stagehand")]
#[command(about = "Partial-state join coordination scenarios")]
struct Cli {
    /// Console log level; the trace file always records everything
    #[arg(long, value_enum, default_value_t = CliLogLevel::Info)]
    log_level: CliLogLevel,

    /// Directory for the trace log of the last run
    #[arg(long)]
    logs_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_tracing_level(), cli.logs_dir.as_deref())
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    commands::handle_command(cli.command, &HarnessConfig::from_env()).await
}
