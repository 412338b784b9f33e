//! Error taxonomy for maintenance runs.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MaintenanceError>;

#[derive(Debug, Error)]
pub enum MaintenanceError {
    /// A connection or statement failed. Fatal to the current table's transaction.
    #[error("storage error on table '{table}' while trying to {operation}: {source}")]
    Storage {
        table: String,
        operation: &'static str,
        #[source]
        source: sqlx::Error,
    },

    #[error("table '{table}' does not exist")]
    TableNotFound { table: String },

    #[error("table '{table}' has no column '{column}'")]
    ColumnNotFound { table: String, column: String },

    #[error("id column '{column}' of table '{table}' holds duplicate value {id}")]
    DuplicateId {
        table: String,
        column: String,
        id: i64,
    },

    /// An inconsistent declaration detected before any mutation.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A post-condition of a rewrite did not hold; the transaction is rolled back.
    #[error("invariant violated on table '{table}': {message}")]
    Invariant { table: String, message: String },

    /// The run deadline passed before the table finished; its transaction is rolled back.
    #[error("table '{table}' did not finish within the run limit of {limit:?}, its changes were rolled back")]
    Timeout { table: String, limit: Duration },
}

/// Coarse classification reported alongside failed results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Storage,
    Schema,
    Configuration,
    Invariant,
    Timeout,
}

impl MaintenanceError {
    pub fn storage(table: &str, operation: &'static str, source: sqlx::Error) -> Self {
        MaintenanceError::Storage {
            table: table.to_string(),
            operation,
            source,
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        MaintenanceError::Configuration(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            MaintenanceError::Storage { .. } => ErrorKind::Storage,
            MaintenanceError::TableNotFound { .. }
            | MaintenanceError::ColumnNotFound { .. }
            | MaintenanceError::DuplicateId { .. } => ErrorKind::Schema,
            MaintenanceError::Configuration(_) => ErrorKind::Configuration,
            MaintenanceError::Invariant { .. } => ErrorKind::Invariant,
            MaintenanceError::Timeout { .. } => ErrorKind::Timeout,
        }
    }
}

/// Attach the failing statement's intent to driver errors.
pub trait StorageContext<T> {
    fn storage(self, table: &str, operation: &'static str) -> Result<T>;
}

impl<T> StorageContext<T> for std::result::Result<T, sqlx::Error> {
    fn storage(self, table: &str, operation: &'static str) -> Result<T> {
        self.map_err(|e| MaintenanceError::storage(table, operation, e))
    }
}
