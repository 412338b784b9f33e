//! Autoincrement counter repair
//!
//! Each engine keeps its next-id bookkeeping somewhere else. A [`SequenceAdapter`]
//! knows where, and [`SequenceRepairer`] uses one to set the counter to the
//! table's current `MAX(id)` so the next insert receives `MAX(id) + 1`.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use common::config::SequenceBackend;
use serde::Serialize;

use crate::error::{MaintenanceError, Result};
use crate::handle::{Backend, Param, Tx, quote_ident};
use crate::schema::{self, TableSchema};

/// Reads and writes the autoincrement counter of a table.
#[async_trait]
pub trait SequenceAdapter: Send + Sync + Debug {
    fn name(&self) -> &'static str;

    /// Current counter value, `None` when the table has no tracked counter.
    async fn read(&self, tx: &mut Tx, table: &str, id_column: &str) -> Result<Option<i64>>;

    /// Set the counter so the next generated id is `value + 1`.
    ///
    /// Returns `false` when the table has no tracked counter and nothing was written.
    async fn write(&self, tx: &mut Tx, table: &str, id_column: &str, value: i64) -> Result<bool>;
}

/// SQLite keeps counters in `sqlite_sequence`, for AUTOINCREMENT tables only.
#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteSequence;

impl SqliteSequence {
    /// Stored name of `table` if it was declared with AUTOINCREMENT.
    async fn tracked_name(&self, tx: &mut Tx, table: &str) -> Result<Option<String>> {
        let declarations: Vec<String> = tx
            .fetch_scalars(
                table,
                "read the table declaration",
                "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ? COLLATE NOCASE",
                &[Param::text(table)],
            )
            .await?;
        if !declarations.iter().any(|sql| declares_autoincrement(sql)) {
            return Ok(None);
        }

        let names: Vec<String> = tx
            .fetch_scalars(
                table,
                "resolve the stored table name",
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ? COLLATE NOCASE",
                &[Param::text(table)],
            )
            .await?;
        Ok(names.into_iter().next())
    }
}

/// Whether a `CREATE TABLE` statement has a `PRIMARY KEY ... AUTOINCREMENT` column.
fn declares_autoincrement(sql: &str) -> bool {
    let words = bare_words(sql);
    words.iter().enumerate().any(|(index, word)| {
        if word != "AUTOINCREMENT" {
            return false;
        }
        // sort order and conflict clause may sit between KEY and AUTOINCREMENT
        let mut start = index;
        while start > 0
            && matches!(
                words[start - 1].as_str(),
                "ASC" | "DESC" | "ON" | "CONFLICT" | "ROLLBACK" | "ABORT" | "FAIL" | "IGNORE"
                    | "REPLACE"
            )
        {
            start -= 1;
        }
        start >= 2 && words[start - 1] == "KEY" && words[start - 2] == "PRIMARY"
    })
}

/// Upper-cased unquoted words of `sql`. Quoted strings and identifiers become `"`.
fn bare_words(sql: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut word = String::new();
    let mut chars = sql.chars();

    while let Some(c) = chars.next() {
        if c.is_alphanumeric() || c == '_' {
            word.push(c.to_ascii_uppercase());
            continue;
        }
        if !word.is_empty() {
            words.push(std::mem::take(&mut word));
        }
        let close = match c {
            '\'' | '"' | '`' => c,
            '[' => ']',
            _ => continue,
        };
        for c in chars.by_ref() {
            if c == close {
                break;
            }
        }
        words.push("\"".to_string());
    }
    if !word.is_empty() {
        words.push(word);
    }
    words
}

#[async_trait]
impl SequenceAdapter for SqliteSequence {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn read(&self, tx: &mut Tx, table: &str, _id_column: &str) -> Result<Option<i64>> {
        let Some(name) = self.tracked_name(tx, table).await? else {
            return Ok(None);
        };

        let values: Vec<i64> = tx
            .fetch_scalars(
                table,
                "read sqlite_sequence",
                "SELECT seq FROM sqlite_sequence WHERE name = ?",
                &[Param::Text(name)],
            )
            .await?;
        Ok(Some(values.into_iter().next().unwrap_or(0)))
    }

    async fn write(&self, tx: &mut Tx, table: &str, _id_column: &str, value: i64) -> Result<bool> {
        let Some(name) = self.tracked_name(tx, table).await? else {
            log::debug!("Table {table} is not AUTOINCREMENT, no sqlite_sequence entry to repair");
            return Ok(false);
        };

        let updated = tx
            .execute(
                table,
                "update sqlite_sequence",
                "UPDATE sqlite_sequence SET seq = ? WHERE name = ?",
                &[Param::Int(value), Param::Text(name.clone())],
            )
            .await?;

        if updated == 0 {
            tx.execute(
                table,
                "insert into sqlite_sequence",
                "INSERT INTO sqlite_sequence (name, seq) VALUES (?, ?)",
                &[Param::Text(name), Param::Int(value)],
            )
            .await?;
        }
        Ok(true)
    }
}

/// PostgreSQL serial and identity columns are backed by sequences.
#[derive(Debug, Default, Clone, Copy)]
pub struct PostgresSequence;

impl PostgresSequence {
    async fn sequence_name(&self, tx: &mut Tx, table: &str, id_column: &str) -> Result<Option<String>> {
        tx.fetch_scalar(
            table,
            "look up the serial sequence",
            "SELECT pg_get_serial_sequence($1, $2)",
            &[Param::Text(quote_ident(table)), Param::text(id_column)],
        )
        .await
    }
}

#[async_trait]
impl SequenceAdapter for PostgresSequence {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn read(&self, tx: &mut Tx, table: &str, id_column: &str) -> Result<Option<i64>> {
        let Some(sequence) = self.sequence_name(tx, table, id_column).await? else {
            return Ok(None);
        };

        // pg_get_serial_sequence returns an already quoted, qualified name
        let value = tx
            .fetch_scalar(
                table,
                "read the serial sequence",
                &format!(
                    "SELECT CASE WHEN is_called THEN last_value ELSE last_value - 1 END FROM {sequence}"
                ),
                &[],
            )
            .await?;
        Ok(Some(value))
    }

    async fn write(&self, tx: &mut Tx, table: &str, id_column: &str, value: i64) -> Result<bool> {
        let Some(sequence) = self.sequence_name(tx, table, id_column).await? else {
            log::debug!("Column {table}.{id_column} has no serial sequence to repair");
            return Ok(false);
        };

        // Sequences cannot hold 0; setval(seq, 1, false) hands out 1 next.
        let _: i64 = tx
            .fetch_scalar(
                table,
                "set the serial sequence",
                "SELECT setval($1::regclass, $2, $3)",
                &[
                    Param::Text(sequence),
                    Param::Int(value.max(1)),
                    Param::Bool(value > 0),
                ],
            )
            .await?;
        Ok(true)
    }
}

/// Engines that derive the next id from `MAX(id)` have nothing to repair.
#[derive(Debug, Default, Clone, Copy)]
pub struct DerivedSequence;

#[async_trait]
impl SequenceAdapter for DerivedSequence {
    fn name(&self) -> &'static str {
        "none"
    }

    async fn read(&self, _tx: &mut Tx, _table: &str, _id_column: &str) -> Result<Option<i64>> {
        Ok(None)
    }

    async fn write(&self, _tx: &mut Tx, _table: &str, _id_column: &str, _value: i64) -> Result<bool> {
        Ok(false)
    }
}

/// Adapter for the configured sequence backend on the connected engine.
pub fn adapter_for(sequence: SequenceBackend, backend: Backend) -> Result<Arc<dyn SequenceAdapter>> {
    match (sequence, backend) {
        (SequenceBackend::Auto, Backend::Sqlite) | (SequenceBackend::Sqlite, Backend::Sqlite) => {
            Ok(Arc::new(SqliteSequence))
        }
        (SequenceBackend::Auto, Backend::Postgres)
        | (SequenceBackend::Postgres, Backend::Postgres) => Ok(Arc::new(PostgresSequence)),
        (SequenceBackend::Derived, _) => Ok(Arc::new(DerivedSequence)),
        (sequence, backend) => Err(MaintenanceError::configuration(format!(
            "sequence adapter '{sequence}' cannot be used with a {backend} store"
        ))),
    }
}

/// What a repair did to one table's counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairOutcome {
    pub table: String,
    pub previous: Option<i64>,
    pub value: i64,
    pub tracked: bool,
}

#[derive(Debug, Clone)]
pub struct SequenceRepairer {
    adapter: Arc<dyn SequenceAdapter>,
}

impl SequenceRepairer {
    pub fn new(adapter: Arc<dyn SequenceAdapter>) -> Self {
        Self { adapter }
    }

    /// Set the counter of `schema`'s table to its current `MAX(id)`.
    pub async fn repair(&self, tx: &mut Tx, schema: &TableSchema) -> Result<RepairOutcome> {
        let table = schema.name.as_str();
        let value = schema::current_max_id(tx, schema).await?;
        let previous = self.adapter.read(tx, table, &schema.id_column).await?;
        let tracked = self
            .adapter
            .write(tx, table, &schema.id_column, value)
            .await?;

        if tracked {
            log::info!(
                "Repaired {} sequence of {table}: {} -> {value}",
                self.adapter.name(),
                previous.map_or_else(|| "unset".to_string(), |v| v.to_string())
            );
        } else {
            log::debug!("Table {table} has no tracked sequence, max id is {value}");
        }

        Ok(RepairOutcome {
            table: table.to_string(),
            previous,
            value,
            tracked,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::Store;

    async fn store() -> Store {
        let store = Store::in_memory().await.unwrap();
        for sql in [
            "CREATE TABLE tags (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT)",
            "CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT)",
        ] {
            store.execute(sql, &[]).await.unwrap();
        }
        store
    }

    async fn repair(store: &Store, table: &str) -> RepairOutcome {
        let repairer = SequenceRepairer::new(Arc::new(SqliteSequence));
        let mut tx = store.begin(table).await.unwrap();
        let schema = schema::describe(&mut tx, table, "id").await.unwrap();
        let outcome = repairer.repair(&mut tx, &schema).await;
        tx.finish(table, outcome).await.unwrap()
    }

    async fn insert_tag(store: &Store) -> i64 {
        store
            .execute("INSERT INTO tags (name) VALUES ('new')", &[])
            .await
            .unwrap();
        sqlx::query_scalar("SELECT MAX(id) FROM tags")
            .fetch_one(store.pool())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_sqlite_repair_lowers_the_counter() {
        let store = store().await;
        for _ in 0..10 {
            insert_tag(&store).await;
        }
        store.execute("DELETE FROM tags WHERE id > 3", &[]).await.unwrap();

        let outcome = repair(&store, "tags").await;
        assert_eq!(outcome.previous, Some(10));
        assert_eq!(outcome.value, 3);
        assert!(outcome.tracked);
        assert_eq!(insert_tag(&store).await, 4);

        // repeated repairs never duplicate the sqlite_sequence row
        repair(&store, "tags").await;
        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sqlite_sequence WHERE name = 'tags'")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[tokio::test]
    async fn test_sqlite_repair_of_empty_table_restarts_at_one() {
        let store = store().await;
        insert_tag(&store).await;
        insert_tag(&store).await;
        store.execute("DELETE FROM tags", &[]).await.unwrap();

        let outcome = repair(&store, "tags").await;
        assert_eq!(outcome.value, 0);
        assert_eq!(insert_tag(&store).await, 1);
    }

    #[tokio::test]
    async fn test_sqlite_repair_inserts_missing_counter_row() {
        let store = store().await;
        store
            .execute("INSERT INTO tags (id, name) VALUES (4, 'a')", &[])
            .await
            .unwrap();
        store.execute("DELETE FROM sqlite_sequence", &[]).await.unwrap();

        let outcome = repair(&store, "tags").await;
        assert_eq!(outcome.previous, Some(0));
        assert!(outcome.tracked);
        assert_eq!(insert_tag(&store).await, 5);
    }

    #[tokio::test]
    async fn test_plain_rowid_table_is_not_tracked() {
        let store = store().await;
        store
            .execute("INSERT INTO notes (id, body) VALUES (7, 'x')", &[])
            .await
            .unwrap();

        let outcome = repair(&store, "notes").await;
        assert_eq!(outcome.previous, None);
        assert_eq!(outcome.value, 7);
        assert!(!outcome.tracked);
    }

    #[tokio::test]
    async fn test_autoincrement_named_column_is_not_tracked() {
        let store = store().await;
        for sql in [
            "CREATE TABLE drafts (id INTEGER PRIMARY KEY, autoincrement_note TEXT \
             DEFAULT 'AUTOINCREMENT')",
            "INSERT INTO drafts (id) VALUES (3)",
        ] {
            store.execute(sql, &[]).await.unwrap();
        }

        let outcome = repair(&store, "drafts").await;
        assert_eq!(outcome.previous, None);
        assert!(!outcome.tracked);
        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sqlite_sequence WHERE name = 'drafts'")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(rows, 0);
    }

    #[test]
    fn test_declares_autoincrement() {
        assert!(declares_autoincrement(
            "CREATE TABLE tags (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT)"
        ));
        assert!(declares_autoincrement(
            "create table \"Tags\" (\"id\" integer primary key on conflict replace autoincrement)"
        ));
        assert!(!declares_autoincrement(
            "CREATE TABLE drafts (id INTEGER PRIMARY KEY, autoincrement_note TEXT)"
        ));
        assert!(!declares_autoincrement(
            "CREATE TABLE drafts (id INTEGER PRIMARY KEY, note TEXT DEFAULT 'PRIMARY KEY AUTOINCREMENT')"
        ));
        assert!(!declares_autoincrement(
            "CREATE TABLE drafts (id INTEGER PRIMARY KEY, \"AUTOINCREMENT\" TEXT)"
        ));
    }

    #[test]
    fn test_adapter_selection() {
        let adapter = adapter_for(SequenceBackend::Auto, Backend::Sqlite).unwrap();
        assert_eq!(adapter.name(), "sqlite");
        let adapter = adapter_for(SequenceBackend::Auto, Backend::Postgres).unwrap();
        assert_eq!(adapter.name(), "postgres");
        let adapter = adapter_for(SequenceBackend::Derived, Backend::Postgres).unwrap();
        assert_eq!(adapter.name(), "none");

        let err = adapter_for(SequenceBackend::Postgres, Backend::Sqlite).unwrap_err();
        assert!(matches!(err, MaintenanceError::Configuration(_)));
        let err = adapter_for(SequenceBackend::Sqlite, Backend::Postgres).unwrap_err();
        assert!(matches!(err, MaintenanceError::Configuration(_)));
    }
}
