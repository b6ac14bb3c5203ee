//! Command-line entry point for the labctl service.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use labctl_orchestrator::{logging, Orchestrator, OrchestratorConfig};
use tracing::info;

/// labctl - lab device coordination service.
#[derive(Parser, Debug)]
#[command(name = "labctl")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Config file (defaults to $LABCTL_CONFIG, then ./labctl.toml).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// JSON log lines (also enabled by LABCTL_LOG_JSON=true).
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect to the broker and run until Ctrl-C.
    Run,
    /// Load and validate the configuration, then exit.
    CheckConfig,
    /// Print the effective configuration as TOML.
    PrintConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(args.log_json || logging::json_requested(), args.verbose);

    let config = OrchestratorConfig::load(args.config.as_deref()).context("loading config")?;

    match args.command {
        Command::Run => run(config).await,
        Command::CheckConfig => {
            println!("Configuration OK (topic root '{}')", config.topics.root);
            Ok(())
        }
        Command::PrintConfig => {
            let text = toml::to_string_pretty(&config).context("serializing config")?;
            println!("{text}");
            Ok(())
        }
    }
}

async fn run(config: OrchestratorConfig) -> Result<()> {
    let orchestrator = Arc::new(Orchestrator::builder(config).build()?);
    orchestrator.start().await?;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    info!(category = "router", "Interrupt received");

    orchestrator.shutdown().await;
    Ok(())
}
