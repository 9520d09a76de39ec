//! Clearinghouse adapter sync
//!
//! Runs reconciliation cycles between a provider and the Ride Clearinghouse.
//! An external scheduler decides how often `poll` runs.
//!
//! # Configuration
//!
//! Environment variables:
//! - `ADAPTER_DATABASE_PATH`: SQLite database path
//! - `ADAPTER_API_URL`, `ADAPTER_API_KEY`, `ADAPTER_API_PRIVATE_KEY`: Clearinghouse access
//! - `RUST_LOG`: log filter (default: `trip_adapter=info,adapter_sync=info`)

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

use commands::{CheckRulesCommand, PollCommand, StatusCommand};
use trip_adapter::config::Config;

#[derive(Parser)]
#[command(name = "adapter-sync")]
#[command(version)]
#[command(about = "Keeps provider trip tickets in sync with the Ride Clearinghouse", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one reconciliation cycle
    Poll(PollCommand),

    /// Parse and validate a mapping or normalization rule document
    CheckRules(CheckRulesCommand),

    /// Show what the local store is tracking
    Status(StatusCommand),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "trip_adapter=info,adapter_sync=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::CheckRules(cmd)) => {
            cmd.run()?;
        }
        Some(Commands::Status(cmd)) => {
            let config = Config::load(cli.config)?;
            cmd.run(&config).await?;
        }
        Some(Commands::Poll(cmd)) => {
            let config = Config::load(cli.config)?;
            cmd.run(&config).await?;
        }
        None => {
            let config = Config::load(cli.config)?;
            PollCommand::default().run(&config).await?;
        }
    }

    Ok(())
}
