//! Schema inspection: column discovery and id-column resolution.

use crate::error::{MaintenanceError, Result};
use crate::handle::{Backend, Param, Tx, quote_ident};

/// Columns of a table plus its resolved id column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<String>,
    /// Actual spelling of the id column as stored in the schema.
    pub id_column: String,
}

fn find_column<'a>(columns: &'a [String], name: &str) -> Option<&'a str> {
    columns
        .iter()
        .find(|column| column.eq_ignore_ascii_case(name))
        .map(String::as_str)
}

/// Ordered column names of `table`. Fails with `TableNotFound` if it has none.
pub async fn columns(tx: &mut Tx, table: &str) -> Result<Vec<String>> {
    let sql = match tx.backend() {
        Backend::Sqlite => "SELECT name FROM pragma_table_info(?) ORDER BY cid",
        Backend::Postgres => {
            "SELECT column_name::text FROM information_schema.columns \
             WHERE table_schema = current_schema() AND table_name = $1 \
             ORDER BY ordinal_position"
        }
    };

    let columns: Vec<String> = tx
        .fetch_scalars(table, "list columns", sql, &[Param::text(table)])
        .await?;

    if columns.is_empty() {
        return Err(MaintenanceError::TableNotFound {
            table: table.to_string(),
        });
    }
    Ok(columns)
}

/// Whether `table` has a column matching `id_column` case-insensitively.
pub async fn has_id_column(tx: &mut Tx, table: &str, id_column: &str) -> Result<bool> {
    let columns = columns(tx, table).await?;
    Ok(find_column(&columns, id_column).is_some())
}

/// Columns of `table` with `id_column` resolved.
pub async fn describe(tx: &mut Tx, table: &str, id_column: &str) -> Result<TableSchema> {
    let columns = columns(tx, table).await?;
    let id_column = find_column(&columns, id_column)
        .ok_or_else(|| MaintenanceError::ColumnNotFound {
            table: table.to_string(),
            column: id_column.to_string(),
        })?
        .to_string();

    Ok(TableSchema {
        name: table.to_string(),
        columns,
        id_column,
    })
}

/// `MAX(id)` of the table, 0 when empty.
pub async fn current_max_id(tx: &mut Tx, schema: &TableSchema) -> Result<i64> {
    let sql = format!(
        "SELECT CAST(COALESCE(MAX({}), 0) AS BIGINT) FROM {}",
        quote_ident(&schema.id_column),
        quote_ident(&schema.name)
    );
    tx.fetch_scalar(&schema.name, "read the current max id", &sql, &[])
        .await
}

/// User tables of the connected database, sorted by name.
pub async fn list_tables(tx: &mut Tx) -> Result<Vec<String>> {
    let sql = match tx.backend() {
        Backend::Sqlite => {
            "SELECT name FROM sqlite_master \
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name"
        }
        Backend::Postgres => {
            "SELECT table_name::text FROM information_schema.tables \
             WHERE table_schema = current_schema() AND table_type = 'BASE TABLE' \
             ORDER BY table_name"
        }
    };
    tx.fetch_scalars("*", "list tables", sql, &[]).await
}
