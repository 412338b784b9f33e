use anyhow::Result;
use clap::Args;
use common::config::Configuration;
use compactor::{CompactableTable, Registry, Relation};

use super::{connect, print_json};

#[derive(Args, Debug)]
pub struct CompactTableArgs {
    /// Table whose ids are renumbered
    pub table: String,

    /// Dependent column as table:foreign_key[:referenced_key]. Repeatable.
    /// Defaults to the relations registered for the table.
    #[arg(long = "relation", value_name = "TABLE:FK[:PK]")]
    pub relations: Vec<Relation>,

    /// Id column of the table
    #[arg(long)]
    pub id_column: Option<String>,

    /// Roll back instead of committing
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Args, Debug)]
pub struct CompactAllArgs {
    /// Roll back instead of committing
    #[arg(long)]
    pub dry_run: bool,
}

pub async fn compact_table(config: &Configuration, args: CompactTableArgs) -> Result<bool> {
    let registry = Registry::from_config(&config.maintenance.tables);
    let entry = registry.find(&args.table);

    let relations = if args.relations.is_empty() {
        entry.map(|entry| entry.relations.clone()).unwrap_or_default()
    } else {
        args.relations
    };
    let id_column = args
        .id_column
        .or_else(|| entry.map(|entry| entry.table.id_column.clone()))
        .unwrap_or_else(|| config.maintenance.id_column.clone());
    let table = CompactableTable::new(args.table).with_id_column(id_column);

    let orchestrator = connect(config).await?.with_dry_run(args.dry_run);
    let result = orchestrator.compact_table(&table, &relations).await;
    orchestrator.store().close().await;

    print_json(&result)?;
    Ok(result.success)
}

pub async fn compact_all(config: &Configuration, args: CompactAllArgs) -> Result<bool> {
    let registry = Registry::from_config(&config.maintenance.tables);

    let orchestrator = connect(config).await?.with_dry_run(args.dry_run);
    let report = orchestrator.compact_all(&registry).await;
    orchestrator.metrics().summary().log();
    orchestrator.store().close().await;

    print_json(&report)?;
    Ok(report.success)
}
