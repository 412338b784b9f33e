//! Foreign-key remapping of dependent tables
//!
//! After a table is renumbered, every declared relation pointing at it is rewritten
//! through a transaction-local copy of the [`IdMapping`]. Dependent rows whose
//! foreign key no longer resolves are dropped and reported; rows with a NULL
//! foreign key reference nothing and are kept as-is.

use serde::Serialize;

use crate::error::{MaintenanceError, Result};
use crate::handle::{Backend, Param, Tx, quote_ident};
use crate::mapping::IdMapping;
use crate::registry::Relation;
use crate::schema::{self, TableSchema};

const MAPPING_TABLE: &str = "densekey_id_map";
const STAGE_TABLE: &str = "densekey_stage";

/// Rows per `INSERT` when loading the mapping.
const LOAD_CHUNK_SIZE: usize = 500;

/// Per-relation outcome of a remap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationReport {
    pub table: String,
    pub foreign_key: String,
    pub kept: u64,
    pub dropped: u64,
    /// Distinct foreign-key values with no counterpart in the mapping.
    pub unresolved_ids: Vec<i64>,
}

/// A relation checked against the live schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependent {
    pub table: String,
    pub columns: Vec<String>,
    /// Stored spelling of the foreign-key column.
    pub foreign_key: String,
}

/// Check `relation` against the compacted table and the dependent's schema.
///
/// Runs before any mutation so a bad declaration never leaves half-rewritten data.
pub async fn validate_relation(
    tx: &mut Tx,
    compacted: &TableSchema,
    relation: &Relation,
) -> Result<Dependent> {
    if !relation
        .referenced_key
        .eq_ignore_ascii_case(&compacted.id_column)
    {
        return Err(MaintenanceError::configuration(format!(
            "relation {relation} references column '{}' but '{}' is keyed by '{}'",
            relation.referenced_key, compacted.name, compacted.id_column
        )));
    }

    if relation.table.eq_ignore_ascii_case(&compacted.name) {
        return Err(MaintenanceError::configuration(format!(
            "relation {relation} references its own table, self-referencing keys are not supported"
        )));
    }

    let columns = match schema::columns(tx, &relation.table).await {
        Ok(columns) => columns,
        Err(MaintenanceError::TableNotFound { table }) => {
            return Err(MaintenanceError::configuration(format!(
                "relation {relation} names table '{table}', which does not exist"
            )));
        }
        Err(e) => return Err(e),
    };

    let foreign_key = columns
        .iter()
        .find(|column| column.eq_ignore_ascii_case(&relation.foreign_key))
        .cloned()
        .ok_or_else(|| {
            MaintenanceError::configuration(format!(
                "relation {relation} names column '{}', which does not exist on '{}'",
                relation.foreign_key, relation.table
            ))
        })?;

    let referencing = delete_actions_on(tx, &relation.table).await?;
    if !referencing.is_empty() {
        return Err(MaintenanceError::configuration(format!(
            "relation {relation}: '{}' is referenced by {} with ON DELETE CASCADE, \
             SET NULL or SET DEFAULT, rewriting it would alter those rows",
            relation.table,
            referencing.join(", ")
        )));
    }

    Ok(Dependent {
        table: relation.table.clone(),
        columns,
        foreign_key,
    })
}

/// Tables whose foreign keys into `table` act on delete.
///
/// Dependents are rewritten by clearing and repopulating them, so such an action
/// would fire on rows that are put back right after.
async fn delete_actions_on(tx: &mut Tx, table: &str) -> Result<Vec<String>> {
    let sql = match tx.backend() {
        Backend::Sqlite => {
            "SELECT DISTINCT m.name FROM sqlite_master m \
             JOIN pragma_foreign_key_list(m.name) f \
             WHERE m.type = 'table' AND f.\"table\" = ? COLLATE NOCASE \
             AND upper(f.on_delete) IN ('CASCADE', 'SET NULL', 'SET DEFAULT') \
             ORDER BY 1"
        }
        Backend::Postgres => {
            "SELECT DISTINCT c.conrelid::regclass::text FROM pg_constraint c \
             JOIN pg_class p ON p.oid = c.confrelid \
             WHERE c.contype = 'f' AND c.confdeltype IN ('c', 'n', 'd') \
             AND lower(p.relname) = lower($1) AND pg_table_is_visible(p.oid) \
             ORDER BY 1"
        }
    };
    tx.fetch_scalars(table, "look up delete actions", sql, &[Param::text(table)])
        .await
}

/// The mapping of one compaction, loaded into a temporary table.
#[derive(Debug)]
pub struct MappingTable {
    table: String,
    /// Qualified name of the temporary table.
    name: String,
    identity: bool,
}

impl MappingTable {
    /// Load `mapping` into `densekey_id_map` inside `tx`.
    pub async fn create(tx: &mut Tx, table: &str, mapping: &IdMapping) -> Result<Self> {
        let name = tx.backend().temp_table(MAPPING_TABLE);
        tx.execute(
            table,
            "drop a stale mapping table",
            &format!("DROP TABLE IF EXISTS {name}"),
            &[],
        )
        .await?;
        tx.execute(
            table,
            "create the mapping table",
            &format!(
                "CREATE TEMP TABLE {name} \
                 (old_id BIGINT NOT NULL PRIMARY KEY, new_id BIGINT NOT NULL)"
            ),
            &[],
        )
        .await?;

        let pairs: Vec<(i64, i64)> = mapping.iter().collect();
        for chunk in pairs.chunks(LOAD_CHUNK_SIZE) {
            let values = chunk
                .iter()
                .map(|(old, new)| format!("({old}, {new})"))
                .collect::<Vec<_>>()
                .join(", ");
            tx.execute(
                table,
                "load the id mapping",
                &format!("INSERT INTO {name} (old_id, new_id) VALUES {values}"),
                &[],
            )
            .await?;
        }

        log::debug!("Loaded {} mapping entries for table {table}", mapping.len());
        Ok(Self {
            table: table.to_string(),
            name,
            identity: mapping.is_identity(),
        })
    }

    pub async fn drop(self, tx: &mut Tx) -> Result<()> {
        tx.execute(
            &self.table,
            "drop the mapping table",
            &format!("DROP TABLE IF EXISTS {}", self.name),
            &[],
        )
        .await?;
        Ok(())
    }

    /// Rewrite `dependent`'s foreign key through the mapping.
    pub async fn remap(&self, tx: &mut Tx, dependent: &Dependent) -> Result<RelationReport> {
        let table = dependent.table.as_str();
        let quoted_table = quote_ident(table);
        let fk = quote_ident(&dependent.foreign_key);
        let unresolved = format!(
            "d.{fk} IS NOT NULL AND NOT EXISTS \
             (SELECT 1 FROM {} m WHERE m.old_id = d.{fk})",
            self.name
        );

        // Step 1: Find foreign keys that no longer resolve
        let unresolved_ids: Vec<i64> = tx
            .fetch_scalars(
                table,
                "collect unresolved foreign keys",
                &format!(
                    "SELECT DISTINCT CAST(d.{fk} AS BIGINT) FROM {quoted_table} d \
                     WHERE {unresolved} ORDER BY 1"
                ),
                &[],
            )
            .await?;
        let dropped: i64 = tx
            .fetch_scalar(
                table,
                "count rows with unresolved foreign keys",
                &format!("SELECT COUNT(*) FROM {quoted_table} d WHERE {unresolved}"),
                &[],
            )
            .await?;
        let total: i64 = tx
            .fetch_scalar(
                table,
                "count dependent rows",
                &format!("SELECT COUNT(*) FROM {quoted_table}"),
                &[],
            )
            .await?;

        let report = RelationReport {
            table: table.to_string(),
            foreign_key: dependent.foreign_key.clone(),
            kept: (total - dropped) as u64,
            dropped: dropped as u64,
            unresolved_ids,
        };

        if report.dropped > 0 {
            log::warn!(
                "Dropping {} rows from {table} whose {} does not resolve in {}: {:?}",
                report.dropped,
                dependent.foreign_key,
                self.table,
                report.unresolved_ids
            );
        }

        // Step 2: Nothing moved and nothing dangles, leave the table alone
        if self.identity && report.dropped == 0 {
            log::debug!("Relation {table}.{fk} is unaffected, skipping rewrite");
            return Ok(report);
        }

        // Step 3: Stage, clear and repopulate with remapped keys
        self.rewrite(tx, dependent).await?;

        log::info!(
            "Remapped {table}.{}: kept {}, dropped {}",
            dependent.foreign_key,
            report.kept,
            report.dropped
        );
        Ok(report)
    }

    async fn rewrite(&self, tx: &mut Tx, dependent: &Dependent) -> Result<()> {
        let table = dependent.table.as_str();
        let quoted_table = quote_ident(table);
        let fk = quote_ident(&dependent.foreign_key);

        let columns = dependent
            .columns
            .iter()
            .map(|column| quote_ident(column))
            .collect::<Vec<_>>()
            .join(", ");
        let projection = dependent
            .columns
            .iter()
            .map(|column| {
                if *column == dependent.foreign_key {
                    "m.new_id".to_string()
                } else {
                    format!("s.{}", quote_ident(column))
                }
            })
            .collect::<Vec<_>>()
            .join(", ");
        let stage = tx.backend().temp_table(STAGE_TABLE);
        let mapping = &self.name;
        // Reinsert in original insertion order where the engine exposes it
        let order = match tx.backend() {
            Backend::Sqlite => " ORDER BY s.rowid",
            Backend::Postgres => "",
        };

        tx.execute(
            table,
            "drop a stale stage table",
            &format!("DROP TABLE IF EXISTS {stage}"),
            &[],
        )
        .await?;
        tx.execute(
            table,
            "stage dependent rows",
            &format!("CREATE TEMP TABLE {stage} AS SELECT * FROM {quoted_table}"),
            &[],
        )
        .await?;
        tx.execute(
            table,
            "clear dependent rows",
            &format!("DELETE FROM {quoted_table}"),
            &[],
        )
        .await?;
        tx.execute(
            table,
            "reinsert remapped rows",
            &format!(
                "INSERT INTO {quoted_table} ({columns}) SELECT {projection} \
                 FROM {stage} s LEFT JOIN {mapping} m ON m.old_id = s.{fk} \
                 WHERE s.{fk} IS NULL OR m.new_id IS NOT NULL{order}"
            ),
            &[],
        )
        .await?;
        tx.execute(
            table,
            "drop the stage table",
            &format!("DROP TABLE {stage}"),
            &[],
        )
        .await?;
        Ok(())
    }
}
