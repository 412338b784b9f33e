//! Relational handle: pooled access to the store and transaction scoping.
//!
//! Every statement issued by the engine goes through [`Store`] or [`Tx`]. Driver
//! failures are turned into [`MaintenanceError::Storage`] carrying the table and the
//! intent of the failing statement.

use std::fmt;

use common::config::DatabaseConfig;
use serde::Serialize;
use sqlx::any::{AnyArguments, AnyPoolOptions, AnyRow, install_default_drivers};
use sqlx::query::{Query, QueryScalar};
use sqlx::{Any, AnyPool, FromRow, Transaction};

use crate::error::{MaintenanceError, Result, StorageContext};

/// Database engine behind a DSN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Sqlite,
    Postgres,
}

impl Backend {
    pub fn from_dsn(dsn: &str) -> Result<Self> {
        let dsn = dsn.trim();
        if dsn.starts_with("sqlite:") {
            Ok(Backend::Sqlite)
        } else if dsn.starts_with("postgres://") || dsn.starts_with("postgresql://") {
            Ok(Backend::Postgres)
        } else {
            Err(MaintenanceError::configuration(format!(
                "unsupported database DSN '{dsn}': expected sqlite: or postgres://"
            )))
        }
    }

    /// Bind placeholder for the 1-based parameter `index`.
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Backend::Sqlite => "?".to_string(),
            Backend::Postgres => format!("${index}"),
        }
    }

    /// Name of a connection-local temporary table, qualified so it never resolves
    /// to a permanent table of the same name.
    pub fn temp_table(self, name: &str) -> String {
        match self {
            Backend::Sqlite => format!("temp.{name}"),
            Backend::Postgres => format!("pg_temp.{name}"),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Sqlite => f.write_str("sqlite"),
            Backend::Postgres => f.write_str("postgres"),
        }
    }
}

/// Statement parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    Int(i64),
    Text(String),
    Bool(bool),
}

impl Param {
    pub fn text(value: &str) -> Self {
        Param::Text(value.to_string())
    }
}

/// Quote an identifier for use in generated SQL. Works for SQLite and PostgreSQL.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn is_sqlite_memory(dsn: &str) -> bool {
    dsn.contains(":memory:") || dsn.contains("mode=memory")
}

fn with_create_mode(dsn: &str) -> String {
    // Add mode=rwc to create database file if it doesn't exist
    if dsn.contains('?') {
        if dsn.contains("mode=") {
            dsn.to_string()
        } else {
            format!("{dsn}&mode=rwc")
        }
    } else {
        format!("{dsn}?mode=rwc")
    }
}

fn bind_query<'q>(sql: &'q str, params: &[Param]) -> Query<'q, Any, AnyArguments<'q>> {
    let mut query = sqlx::query(sql);
    for param in params {
        query = match param {
            Param::Int(value) => query.bind(*value),
            Param::Text(value) => query.bind(value.clone()),
            Param::Bool(value) => query.bind(*value),
        };
    }
    query
}

fn bind_scalar<'q, T>(sql: &'q str, params: &[Param]) -> QueryScalar<'q, Any, T, AnyArguments<'q>>
where
    (T,): for<'r> FromRow<'r, AnyRow>,
{
    let mut query = sqlx::query_scalar::<Any, T>(sql);
    for param in params {
        query = match param {
            Param::Int(value) => query.bind(*value),
            Param::Text(value) => query.bind(value.clone()),
            Param::Bool(value) => query.bind(*value),
        };
    }
    query
}

/// Pooled connection to the store.
#[derive(Debug, Clone)]
pub struct Store {
    pool: AnyPool,
    backend: Backend,
}

impl Store {
    /// Connect using the database section of the configuration.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let dsn = config.dsn.trim();
        let backend = Backend::from_dsn(dsn)?;
        install_default_drivers();

        let in_memory = backend == Backend::Sqlite && is_sqlite_memory(dsn);
        let url = match backend {
            Backend::Sqlite if !in_memory => with_create_mode(dsn),
            _ => dsn.to_string(),
        };

        let options = AnyPoolOptions::new().acquire_timeout(config.acquire_timeout);
        // Every connection to sqlite::memory: is a separate database, so keep exactly
        // one alive for the lifetime of the pool.
        let options = if in_memory {
            options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            options.max_connections(config.max_connections.max(1))
        };

        log::info!("Connecting to {backend} store");
        let pool = options.connect(&url).await.map_err(|e| {
            log::error!("Failed to connect to {backend} store: {e}");
            MaintenanceError::storage("*", "connect to the store", e)
        })?;
        log::info!("Database connection established successfully");

        Ok(Self { pool, backend })
    }

    /// Private in-memory SQLite store.
    pub async fn in_memory() -> Result<Self> {
        Self::connect(&DatabaseConfig::in_memory()).await
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    /// Run a single statement outside of any maintenance transaction.
    pub async fn execute(&self, sql: &str, params: &[Param]) -> Result<u64> {
        log::debug!("execute: {sql}");
        let result = bind_query(sql, params)
            .execute(&self.pool)
            .await
            .storage("*", "execute a statement")?;
        Ok(result.rows_affected())
    }

    /// Open a transaction scoped to the maintenance of `table`.
    ///
    /// Foreign-key checks are deferred to commit so a parent can be renumbered
    /// before its dependents are rewritten.
    pub async fn begin(&self, table: &str) -> Result<Tx> {
        let inner = self
            .pool
            .begin()
            .await
            .storage(table, "begin a transaction")?;
        let mut tx = Tx {
            inner,
            backend: self.backend,
        };

        let defer = match self.backend {
            Backend::Sqlite => "PRAGMA defer_foreign_keys = ON",
            Backend::Postgres => "SET CONSTRAINTS ALL DEFERRED",
        };
        tx.execute(table, "defer foreign key checks", defer, &[])
            .await?;

        Ok(tx)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// An open transaction. Dropping it without [`Tx::finish`] rolls back.
pub struct Tx {
    inner: Transaction<'static, Any>,
    backend: Backend,
}

impl fmt::Debug for Tx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tx").field("backend", &self.backend).finish()
    }
}

impl Tx {
    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub async fn execute(
        &mut self,
        table: &str,
        operation: &'static str,
        sql: &str,
        params: &[Param],
    ) -> Result<u64> {
        log::debug!("{table}: {operation}: {sql}");
        let result = bind_query(sql, params)
            .execute(&mut *self.inner)
            .await
            .storage(table, operation)?;
        Ok(result.rows_affected())
    }

    /// Fetch the first column of every returned row.
    pub async fn fetch_scalars<T>(
        &mut self,
        table: &str,
        operation: &'static str,
        sql: &str,
        params: &[Param],
    ) -> Result<Vec<T>>
    where
        T: Send + Unpin,
        (T,): for<'r> FromRow<'r, AnyRow>,
    {
        log::debug!("{table}: {operation}: {sql}");
        bind_scalar::<T>(sql, params)
            .fetch_all(&mut *self.inner)
            .await
            .storage(table, operation)
    }

    /// Fetch the first column of a statement returning exactly one row.
    pub async fn fetch_scalar<T>(
        &mut self,
        table: &str,
        operation: &'static str,
        sql: &str,
        params: &[Param],
    ) -> Result<T>
    where
        T: Send + Unpin,
        (T,): for<'r> FromRow<'r, AnyRow>,
    {
        log::debug!("{table}: {operation}: {sql}");
        bind_scalar::<T>(sql, params)
            .fetch_one(&mut *self.inner)
            .await
            .storage(table, operation)
    }

    /// Commit when `outcome` is `Ok`, roll back otherwise.
    pub async fn finish<T>(self, table: &str, outcome: Result<T>) -> Result<T> {
        match outcome {
            Ok(value) => {
                self.inner.commit().await.storage(table, "commit")?;
                Ok(value)
            }
            Err(err) => {
                if let Err(e) = self.inner.rollback().await {
                    log::error!("Failed to roll back transaction for table {table}: {e}");
                }
                Err(err)
            }
        }
    }

    /// Roll back regardless of `outcome`. Used by dry runs.
    pub async fn abandon<T>(self, table: &str, outcome: Result<T>) -> Result<T> {
        let rolled_back = self.inner.rollback().await.storage(table, "roll back");
        let value = outcome?;
        rolled_back?;
        Ok(value)
    }
}
