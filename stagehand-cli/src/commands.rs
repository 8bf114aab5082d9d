//! CLI command implementations

use std::time::Instant;

use anyhow::bail;
use clap::Subcommand;
use stagehand_core::HarnessConfig;

use crate::scenarios::{self, Scenario};

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run one scenario against a fresh simulated homeserver
    Scenario {
        /// Scenario to run
        #[arg(value_enum)]
        name: Scenario,
    },
    /// Run every scenario in turn
    All,
    /// List available scenarios
    List,
}

/// Handle the CLI command
///
/// # Errors
///
/// Returns the first scenario failure
pub async fn handle_command(command: Commands, config: &HarnessConfig) -> anyhow::Result<()> {
    match command {
        Commands::Scenario { name } => run_scenario(name, config).await,
        Commands::All => run_all(config).await,
        Commands::List => {
            list_scenarios();
            Ok(())
        }
    }
}

async fn run_scenario(scenario: Scenario, config: &HarnessConfig) -> anyhow::Result<()> {
    let started = Instant::now();
    match scenarios::run(scenario, config).await {
        Ok(()) => {
            println!("PASS {} ({:.2?})", scenario.name(), started.elapsed());
            Ok(())
        }
        Err(e) => {
            println!("FAIL {} ({:.2?})", scenario.name(), started.elapsed());
            Err(e.context(format!("scenario {} failed", scenario.name())))
        }
    }
}

async fn run_all(config: &HarnessConfig) -> anyhow::Result<()> {
    let mut failed = Vec::new();
    for scenario in Scenario::ALL {
        if let Err(e) = run_scenario(scenario, config).await {
            tracing::error!("{e:#}");
            failed.push(scenario.name());
        }
    }

    if !failed.is_empty() {
        bail!("{} scenario(s) failed: {}", failed.len(), failed.join(", "));
    }
    Ok(())
}

fn list_scenarios() {
    for scenario in Scenario::ALL {
        println!("{:<16} {}", scenario.name(), scenario.description());
    }
}
