pub mod compact;
pub mod sequence;
pub mod serve;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use common::cli::{CommonArgs, utils};
use common::config::Configuration;
use compactor::MaintenanceOrchestrator;
use serde::Serialize;

/// densekey: compact primary keys, remap foreign keys and repair sequences
#[derive(Parser, Debug)]
#[command(name = "densekey", version, about)]
pub struct Cli {
    #[command(flatten)]
    pub common: CommonArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Renumber one table to 1..N and remap the relations pointing at it
    CompactTable(compact::CompactTableArgs),
    /// Compact every table of the registry in order
    CompactAll(compact::CompactAllArgs),
    /// Set one table's autoincrement counter to its current max id
    RepairSequence(sequence::RepairSequenceArgs),
    /// Repair the counter of every table that has an id column
    RepairAll,
    /// Start the admin HTTP API
    Serve(serve::ServeArgs),
    /// Show the effective configuration
    Config {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Validate the configuration and exit
    Validate,
}

impl Cli {
    /// Run the selected command. `Ok(false)` means the run completed but reported failures.
    pub async fn run(self) -> Result<bool> {
        let config = utils::load_config(self.common.config.as_ref())?;

        match self.command {
            Commands::Config { json } => {
                utils::display_config(&config, json)?;
                Ok(true)
            }
            Commands::Validate => {
                utils::validate_config(&config)?;
                println!("Configuration is valid");
                Ok(true)
            }
            Commands::CompactTable(args) => compact::compact_table(&config, args).await,
            Commands::CompactAll(args) => compact::compact_all(&config, args).await,
            Commands::RepairSequence(args) => sequence::repair_sequence(&config, args).await,
            Commands::RepairAll => sequence::repair_all(&config).await,
            Commands::Serve(args) => serve::serve(config, args).await.map(|_| true),
        }
    }
}

/// Connect to the configured store.
pub(crate) async fn connect(config: &Configuration) -> Result<MaintenanceOrchestrator> {
    utils::validate_config(config)?;
    MaintenanceOrchestrator::from_config(config)
        .await
        .context("Failed to set up maintenance")
}

/// Print `value` as pretty JSON on stdout.
pub(crate) fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize result")?;
    println!("{json}");
    Ok(())
}
