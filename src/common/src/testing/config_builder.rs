//! Test configuration builder for creating test setups quickly.

use std::time::Duration;

use crate::config::{
    Configuration, DatabaseConfig, RelationConfig, SequenceBackend, TableConfig,
};

/// Builder for creating test configurations.
///
/// # Example
///
/// ```rust,ignore
/// use common::testing::TestConfigBuilder;
///
/// let config = TestConfigBuilder::new()
///     .in_memory()
///     .with_table("tags", &[("article_tags", "tag_id")])
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct TestConfigBuilder {
    config: Configuration,
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TestConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Configuration::default(),
        }
    }

    /// Use a private in-memory SQLite database.
    pub fn in_memory(mut self) -> Self {
        self.config.database = DatabaseConfig::in_memory();
        self
    }

    /// Set the database DSN.
    pub fn with_database_dsn(mut self, dsn: &str) -> Self {
        self.config.database.dsn = dsn.to_string();
        self
    }

    /// Select the sequence adapter.
    pub fn with_sequence(mut self, sequence: SequenceBackend) -> Self {
        self.config.maintenance.sequence = sequence;
        self
    }

    /// Append a registry entry keyed by `id`, with `(table, foreign_key)` relations.
    pub fn with_table(mut self, name: &str, relations: &[(&str, &str)]) -> Self {
        self.config.maintenance.tables.push(TableConfig {
            name: name.to_string(),
            id_column: "id".to_string(),
            relations: relations
                .iter()
                .map(|(table, foreign_key)| RelationConfig {
                    table: table.to_string(),
                    foreign_key: foreign_key.to_string(),
                    referenced_key: "id".to_string(),
                })
                .collect(),
        });
        self
    }

    /// Enable the admin API with the given bearer token.
    pub fn with_admin_key(mut self, key: &str) -> Self {
        self.config.admin.admin_key = Some(key.to_string());
        self
    }

    /// Bound admin-triggered runs.
    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.config.admin.run_timeout = timeout;
        self
    }

    pub fn build(self) -> Configuration {
        self.config
    }
}
