use anyhow::Result;
use clap::Args;
use common::config::Configuration;

use super::{connect, print_json};

#[derive(Args, Debug)]
pub struct RepairSequenceArgs {
    /// Table whose counter is repaired
    pub table: String,

    /// Id column of the table
    #[arg(long)]
    pub id_column: Option<String>,
}

pub async fn repair_sequence(config: &Configuration, args: RepairSequenceArgs) -> Result<bool> {
    let id_column = args
        .id_column
        .unwrap_or_else(|| config.maintenance.id_column.clone());

    let orchestrator = connect(config).await?;
    let result = orchestrator.repair_sequence(&args.table, &id_column).await;
    orchestrator.store().close().await;

    print_json(&result)?;
    Ok(result.success)
}

pub async fn repair_all(config: &Configuration) -> Result<bool> {
    let orchestrator = connect(config).await?;
    let report = orchestrator
        .repair_all_sequences(&config.maintenance.id_column)
        .await;
    orchestrator.store().close().await;

    print_json(&report)?;
    Ok(report.success)
}
