//! Primary-key renumbering of a single table
//!
//! Rewrites the id column of one table so surviving rows occupy `1..N` in the
//! order of their old ids. Only the compacted table is touched; dependents are the
//! remapper's job.

use crate::error::{MaintenanceError, Result};
use crate::handle::{Tx, quote_ident};
use crate::mapping::IdMapping;
use crate::schema::TableSchema;

/// Renumbers a table in place with collision-free `UPDATE` statements
#[derive(Debug, Default, Clone, Copy)]
pub struct TableRewriter;

impl TableRewriter {
    pub fn new() -> Self {
        Self
    }

    /// Renumber `schema`'s table and return the mapping that was applied
    pub async fn compact(&self, tx: &mut Tx, schema: &TableSchema) -> Result<IdMapping> {
        let table = schema.name.as_str();
        let id = quote_ident(&schema.id_column);
        let quoted_table = quote_ident(table);

        // Step 1: Snapshot surviving ids in ascending order
        let sql = format!("SELECT CAST({id} AS BIGINT) FROM {quoted_table} ORDER BY {id} ASC");
        let ids: Vec<i64> = tx
            .fetch_scalars(table, "snapshot surviving ids", &sql, &[])
            .await?;

        // Step 2: Assign 1..N in scan order
        let mapping = IdMapping::from_sorted_ids(table, &schema.id_column, &ids)?;

        if mapping.is_empty() {
            log::info!("Table {table} is empty, nothing to renumber");
            return Ok(mapping);
        }

        if mapping.is_identity() {
            log::info!(
                "Table {table} is already dense (1..{}), nothing to renumber",
                mapping.len()
            );
            return Ok(mapping);
        }

        // Step 3: Move rows; non-id columns are never touched
        let moves = mapping.collision_free_moves();
        log::info!(
            "Renumbering {} of {} rows in table {table}",
            moves.len(),
            mapping.len()
        );

        for (old, new) in &moves {
            let sql = format!("UPDATE {quoted_table} SET {id} = {new} WHERE {id} = {old}");
            let updated = tx.execute(table, "renumber a row", &sql, &[]).await?;
            if updated != 1 {
                return Err(MaintenanceError::Invariant {
                    table: table.to_string(),
                    message: format!("moving id {old} to {new} updated {updated} rows"),
                });
            }
        }

        // Step 4: Verify the table is dense
        self.verify_dense(tx, schema, mapping.len()).await?;

        Ok(mapping)
    }

    async fn verify_dense(&self, tx: &mut Tx, schema: &TableSchema, expected: usize) -> Result<()> {
        let table = schema.name.as_str();
        let id = quote_ident(&schema.id_column);
        let quoted_table = quote_ident(table);

        let count: i64 = tx
            .fetch_scalar(
                table,
                "count renumbered rows",
                &format!("SELECT COUNT(*) FROM {quoted_table}"),
                &[],
            )
            .await?;
        let min: i64 = tx
            .fetch_scalar(
                table,
                "read the smallest renumbered id",
                &format!("SELECT CAST(COALESCE(MIN({id}), 0) AS BIGINT) FROM {quoted_table}"),
                &[],
            )
            .await?;
        let max: i64 = tx
            .fetch_scalar(
                table,
                "read the largest renumbered id",
                &format!("SELECT CAST(COALESCE(MAX({id}), 0) AS BIGINT) FROM {quoted_table}"),
                &[],
            )
            .await?;

        let expected = expected as i64;
        if count != expected || min != 1 || max != expected {
            return Err(MaintenanceError::Invariant {
                table: table.to_string(),
                message: format!(
                    "expected ids 1..{expected}, found {count} rows spanning {min}..{max}"
                ),
            });
        }

        log::debug!("Table {table} verified dense: 1..{expected}");
        Ok(())
    }
}
