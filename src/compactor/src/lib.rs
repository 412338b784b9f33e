//! densekey compaction engine
//!
//! Renumbers the primary key of relational tables to a dense `1..N` range and keeps
//! the database consistent around it:
//! - foreign keys in dependent tables are rewritten through the old-to-new mapping
//! - rows whose foreign key no longer resolves are dropped and reported
//! - autoincrement counters are reset to the new maximum
//!
//! Every table is processed in its own transaction; a failure rolls that table back
//! and is reported without stopping the rest of a run.

pub mod error;
pub mod handle;
pub mod mapping;
pub mod metrics;
pub mod orchestrator;
pub mod registry;
pub mod remap;
pub mod rewriter;
pub mod schema;
pub mod sequence;

// Re-export commonly used types
pub use error::{ErrorKind, MaintenanceError, Result};
pub use handle::{Backend, Param, Store, Tx};
pub use mapping::IdMapping;
pub use metrics::{MaintenanceMetrics, MetricsSummary};
pub use orchestrator::{
    CompactionResult, MaintenanceOrchestrator, MaintenanceReport, RepairResult, TableOutcome,
};
pub use registry::{CompactableTable, Registry, RegistryEntry, Relation};
pub use remap::{MappingTable, RelationReport};
pub use rewriter::TableRewriter;
pub use sequence::{
    DerivedSequence, PostgresSequence, SequenceAdapter, SequenceRepairer, SqliteSequence,
    adapter_for,
};
