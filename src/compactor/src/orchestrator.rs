//! Maintenance run orchestration
//!
//! Drives compaction, remapping and sequence repair for one table per transaction
//! and turns every per-table failure into a reported result, so multi-table runs
//! record the failure and move on to the next table.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::Configuration;
use serde::Serialize;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{ErrorKind, MaintenanceError, Result};
use crate::handle::{Store, Tx};
use crate::mapping::IdMapping;
use crate::metrics::MaintenanceMetrics;
use crate::registry::{CompactableTable, Registry, Relation};
use crate::remap::{self, MappingTable, RelationReport};
use crate::rewriter::TableRewriter;
use crate::schema;
use crate::sequence::{self, SequenceAdapter, SequenceRepairer};

/// Outcome of compacting one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactionResult {
    pub success: bool,
    pub table: String,
    pub message: String,
    pub max_id: i64,
    pub rows: u64,
    pub moved: u64,
    pub dropped_rows: u64,
    pub relations: Vec<RelationReport>,
    pub dry_run: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl CompactionResult {
    fn failed(table: &str, error: &MaintenanceError, dry_run: bool) -> Self {
        Self {
            success: false,
            table: table.to_string(),
            message: format!("failed to compact ids of table {table}: {error}"),
            max_id: 0,
            rows: 0,
            moved: 0,
            dropped_rows: 0,
            relations: Vec::new(),
            dry_run,
            error_kind: Some(error.kind()),
        }
    }
}

/// Outcome of repairing one table's autoincrement counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairResult {
    pub success: bool,
    pub table: String,
    pub message: String,
    pub max_id: i64,
    pub previous: Option<i64>,
    pub tracked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl RepairResult {
    fn failed(table: &str, error: &MaintenanceError) -> Self {
        Self {
            success: false,
            table: table.to_string(),
            message: format!("failed to repair the sequence of table {table}: {error}"),
            max_id: 0,
            previous: None,
            tracked: false,
            error_kind: Some(error.kind()),
        }
    }
}

/// A result that reports whether its table succeeded.
pub trait TableOutcome {
    fn succeeded(&self) -> bool;

    fn error_kind(&self) -> Option<ErrorKind>;

    /// Whether the run deadline stopped this table.
    fn timed_out(&self) -> bool {
        self.error_kind() == Some(ErrorKind::Timeout)
    }
}

impl TableOutcome for CompactionResult {
    fn succeeded(&self) -> bool {
        self.success
    }

    fn error_kind(&self) -> Option<ErrorKind> {
        self.error_kind
    }
}

impl TableOutcome for RepairResult {
    fn succeeded(&self) -> bool {
        self.success
    }

    fn error_kind(&self) -> Option<ErrorKind> {
        self.error_kind
    }
}

/// Results of a multi-table run, in execution order.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceReport<T> {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub success: bool,
    pub results: Vec<T>,
}

impl<T: TableOutcome> MaintenanceReport<T> {
    pub fn new(run_id: Uuid, started_at: DateTime<Utc>, results: Vec<T>) -> Self {
        Self {
            run_id,
            started_at,
            success: results.iter().all(TableOutcome::succeeded),
            results,
        }
    }

    pub fn failures(&self) -> usize {
        self.results.iter().filter(|r| !r.succeeded()).count()
    }

    pub fn timed_out(&self) -> bool {
        self.results.iter().any(TableOutcome::timed_out)
    }
}

/// Runs maintenance against one store.
#[derive(Debug, Clone)]
pub struct MaintenanceOrchestrator {
    store: Store,
    rewriter: TableRewriter,
    sequences: SequenceRepairer,
    metrics: MaintenanceMetrics,
    dry_run: bool,
    run_timeout: Option<Duration>,
}

impl MaintenanceOrchestrator {
    pub fn new(store: Store, adapter: Arc<dyn SequenceAdapter>) -> Self {
        Self {
            store,
            rewriter: TableRewriter::new(),
            sequences: SequenceRepairer::new(adapter),
            metrics: MaintenanceMetrics::new(),
            dry_run: false,
            run_timeout: None,
        }
    }

    /// Connect to the configured store and pick the configured sequence adapter.
    pub async fn from_config(config: &Configuration) -> Result<Self> {
        let store = Store::connect(&config.database).await?;
        let adapter = sequence::adapter_for(config.maintenance.sequence, store.backend())?;
        log::info!(
            "Maintenance orchestrator ready ({} store, {} sequence adapter)",
            store.backend(),
            adapter.name()
        );
        Ok(Self::new(store, adapter))
    }

    /// Execute everything, then roll back instead of committing.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Bound every run by `limit`.
    ///
    /// The table in flight when the limit passes is rolled back and tables not yet
    /// started are reported as timed out; tables that finished stay committed.
    pub fn with_run_timeout(mut self, limit: Option<Duration>) -> Self {
        self.run_timeout = limit;
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn metrics(&self) -> &MaintenanceMetrics {
        &self.metrics
    }

    /// Renumber `table` to `1..N`, remap `relations` and repair its sequence.
    ///
    /// Never fails: errors roll the table back and come back as `success: false`.
    pub async fn compact_table(
        &self,
        table: &CompactableTable,
        relations: &[Relation],
    ) -> CompactionResult {
        self.compact_before(table, relations, self.deadline()).await
    }

    #[tracing::instrument(skip(self, relations, deadline), fields(table = %table.name, dry_run = self.dry_run))]
    async fn compact_before(
        &self,
        table: &CompactableTable,
        relations: &[Relation],
        deadline: Option<Instant>,
    ) -> CompactionResult {
        self.metrics.record_table_start();
        let started = Instant::now();

        match self
            .within(&table.name, deadline, self.try_compact(table, relations))
            .await
        {
            Ok(result) => {
                self.metrics
                    .record_table_success(result.moved, result.dropped_rows, started.elapsed());
                log::info!("{}", result.message);
                result
            }
            Err(e) => {
                self.metrics.record_table_failure();
                log::error!("Compaction of table {} failed: {e}", table.name);
                CompactionResult::failed(&table.name, &e, self.dry_run)
            }
        }
    }

    /// Compact every registry entry in declared order, one transaction each.
    #[tracing::instrument(skip_all, fields(run_id = tracing::field::Empty, dry_run = self.dry_run))]
    pub async fn compact_all(&self, registry: &Registry) -> MaintenanceReport<CompactionResult> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        tracing::Span::current().record("run_id", tracing::field::display(run_id));
        self.metrics.record_run();

        log::info!(
            "Starting compaction run {run_id} over {} tables{}",
            registry.entries().len(),
            if self.dry_run { " (dry run)" } else { "" }
        );

        let deadline = self.deadline();
        let mut results = Vec::with_capacity(registry.entries().len());
        for entry in registry.entries() {
            results.push(
                self.compact_before(&entry.table, &entry.relations, deadline)
                    .await,
            );
        }

        let report = MaintenanceReport::new(run_id, started_at, results);
        if report.timed_out() {
            log::warn!(
                "Compaction run {run_id} hit its time limit, {} tables were not completed",
                report.failures()
            );
        } else if report.success {
            log::info!("Compaction run {run_id} completed");
        } else {
            log::warn!(
                "Compaction run {run_id} completed with {} failed tables",
                report.failures()
            );
        }
        report
    }

    /// Set `table`'s counter to its current `MAX(id)`.
    pub async fn repair_sequence(&self, table: &str, id_column: &str) -> RepairResult {
        self.repair_before(table, id_column, self.deadline()).await
    }

    #[tracing::instrument(skip(self, deadline), fields(dry_run = self.dry_run))]
    async fn repair_before(
        &self,
        table: &str,
        id_column: &str,
        deadline: Option<Instant>,
    ) -> RepairResult {
        match self
            .within(table, deadline, self.try_repair(table, id_column))
            .await
        {
            Ok(result) => {
                self.metrics.record_sequence_repair();
                result
            }
            Err(e) => {
                log::error!("Sequence repair of table {table} failed: {e}");
                RepairResult::failed(table, &e)
            }
        }
    }

    /// Repair the counter of every table that has `id_column`.
    #[tracing::instrument(skip(self), fields(run_id = tracing::field::Empty, dry_run = self.dry_run))]
    pub async fn repair_all_sequences(&self, id_column: &str) -> MaintenanceReport<RepairResult> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        tracing::Span::current().record("run_id", tracing::field::display(run_id));
        self.metrics.record_run();

        let deadline = self.deadline();
        let tables = match self
            .within("*", deadline, self.eligible_tables(id_column))
            .await
        {
            Ok(tables) => tables,
            Err(e) => {
                log::error!("Failed to list tables for sequence repair: {e}");
                return MaintenanceReport::new(run_id, started_at, vec![RepairResult::failed("*", &e)]);
            }
        };

        log::info!("Repairing sequences of {} tables (run {run_id})", tables.len());
        let mut results = Vec::with_capacity(tables.len());
        for table in &tables {
            results.push(self.repair_before(table, id_column, deadline).await);
        }

        MaintenanceReport::new(run_id, started_at, results)
    }

    fn deadline(&self) -> Option<Instant> {
        self.run_timeout
            .and_then(|limit| Instant::now().checked_add(limit))
    }

    /// Run `work` unless `deadline` has passed, dropping it (and its open
    /// transaction) when the deadline passes mid-flight.
    async fn within<T>(
        &self,
        table: &str,
        deadline: Option<Instant>,
        work: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let Some(deadline) = deadline else {
            return work.await;
        };
        let timed_out = || MaintenanceError::Timeout {
            table: table.to_string(),
            limit: self.run_timeout.unwrap_or_default(),
        };

        if Instant::now() >= deadline {
            return Err(timed_out());
        }
        tokio::time::timeout_at(deadline, work)
            .await
            .unwrap_or_else(|_| Err(timed_out()))
    }

    async fn eligible_tables(&self, id_column: &str) -> Result<Vec<String>> {
        let mut tx = self.store.begin("*").await?;
        let outcome = async {
            let mut eligible = Vec::new();
            for table in schema::list_tables(&mut tx).await? {
                if schema::has_id_column(&mut tx, &table, id_column).await? {
                    eligible.push(table);
                } else {
                    log::debug!("Skipping table {table}: no '{id_column}' column");
                }
            }
            Ok::<_, MaintenanceError>(eligible)
        }
        .await;
        tx.abandon("*", outcome).await
    }

    async fn try_compact(
        &self,
        table: &CompactableTable,
        relations: &[Relation],
    ) -> Result<CompactionResult> {
        let mut tx = self.store.begin(&table.name).await?;
        let outcome = self.compact_in(&mut tx, table, relations).await;
        self.close(tx, &table.name, outcome).await
    }

    async fn try_repair(&self, table: &str, id_column: &str) -> Result<RepairResult> {
        let mut tx = self.store.begin(table).await?;
        let outcome = async {
            let schema = schema::describe(&mut tx, table, id_column).await?;
            self.sequences.repair(&mut tx, &schema).await
        }
        .await;
        let repaired = self.close(tx, table, outcome).await?;

        let message = if repaired.tracked {
            format!(
                "sequence of table {table} set to {}{}",
                repaired.value,
                if self.dry_run { " (dry run)" } else { "" }
            )
        } else {
            format!("table {table} has no tracked sequence, max id is {}", repaired.value)
        };

        Ok(RepairResult {
            success: true,
            table: repaired.table,
            message,
            max_id: repaired.value,
            previous: repaired.previous,
            tracked: repaired.tracked,
            error_kind: None,
        })
    }

    async fn close<T>(&self, tx: Tx, table: &str, outcome: Result<T>) -> Result<T> {
        if self.dry_run {
            tx.abandon(table, outcome).await
        } else {
            tx.finish(table, outcome).await
        }
    }

    async fn compact_in(
        &self,
        tx: &mut Tx,
        table: &CompactableTable,
        relations: &[Relation],
    ) -> Result<CompactionResult> {
        // Step 1: Resolve the table and every relation before touching anything
        let schema = schema::describe(tx, &table.name, &table.id_column).await?;
        let mut dependents = Vec::with_capacity(relations.len());
        for relation in relations {
            dependents.push(remap::validate_relation(tx, &schema, relation).await?);
        }

        // Step 2: Renumber the table itself
        let mapping = self.rewriter.compact(tx, &schema).await?;

        // Step 3: Rewrite dependents through the mapping
        let reports = self.remap_dependents(tx, &schema.name, &mapping, &dependents).await?;

        // Step 4: Point the sequence at the new maximum
        let repaired = self.sequences.repair(tx, &schema).await?;
        if repaired.value != mapping.max_new_id() {
            return Err(MaintenanceError::Invariant {
                table: schema.name.clone(),
                message: format!(
                    "max id is {} after renumbering {} rows",
                    repaired.value,
                    mapping.len()
                ),
            });
        }

        let dropped_rows = reports.iter().map(|report| report.dropped).sum();
        let message = if self.dry_run {
            format!(
                "dry run: ids of table {} would be renumbered to 1..{}",
                schema.name, repaired.value
            )
        } else {
            format!(
                "ids of table {} renumbered to 1..{}",
                schema.name, repaired.value
            )
        };

        Ok(CompactionResult {
            success: true,
            table: schema.name,
            message,
            max_id: repaired.value,
            rows: mapping.len() as u64,
            moved: mapping.moved() as u64,
            dropped_rows,
            relations: reports,
            dry_run: self.dry_run,
            error_kind: None,
        })
    }

    async fn remap_dependents(
        &self,
        tx: &mut Tx,
        table: &str,
        mapping: &IdMapping,
        dependents: &[remap::Dependent],
    ) -> Result<Vec<RelationReport>> {
        if dependents.is_empty() {
            return Ok(Vec::new());
        }

        let mapping_table = MappingTable::create(tx, table, mapping).await?;
        let mut reports = Vec::with_capacity(dependents.len());
        for dependent in dependents {
            reports.push(mapping_table.remap(tx, dependent).await?);
        }
        mapping_table.drop(tx).await?;

        Ok(reports)
    }
}
