//! Which tables get compacted, and which relations reference them.

use std::fmt;
use std::str::FromStr;

use common::config::{RelationConfig, TableConfig};
use serde::Serialize;

use crate::error::MaintenanceError;

/// A table whose primary key is renumbered to `1..N`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactableTable {
    pub name: String,
    pub id_column: String,
}

impl CompactableTable {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id_column: "id".to_string(),
        }
    }

    pub fn with_id_column(mut self, id_column: impl Into<String>) -> Self {
        self.id_column = id_column.into();
        self
    }
}

/// `table.foreign_key` holds values of the compacted table's `referenced_key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Relation {
    pub table: String,
    pub foreign_key: String,
    pub referenced_key: String,
}

impl Relation {
    pub fn new(table: impl Into<String>, foreign_key: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            foreign_key: foreign_key.into(),
            referenced_key: "id".to_string(),
        }
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.table, self.foreign_key, self.referenced_key)
    }
}

/// Parses `table:fk` or `table:fk:pk`.
impl FromStr for Relation {
    type Err = MaintenanceError;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = spec.split(':').map(str::trim).collect();
        let invalid = || {
            MaintenanceError::configuration(format!(
                "invalid relation '{spec}': expected table:foreign_key[:referenced_key]"
            ))
        };

        if parts.iter().any(|part| part.is_empty()) {
            return Err(invalid());
        }

        match parts.as_slice() {
            [table, foreign_key] => Ok(Relation::new(*table, *foreign_key)),
            [table, foreign_key, referenced_key] => Ok(Relation {
                table: table.to_string(),
                foreign_key: foreign_key.to_string(),
                referenced_key: referenced_key.to_string(),
            }),
            _ => Err(invalid()),
        }
    }
}

impl From<&RelationConfig> for Relation {
    fn from(config: &RelationConfig) -> Self {
        Self {
            table: config.table.clone(),
            foreign_key: config.foreign_key.clone(),
            referenced_key: config.referenced_key.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    pub table: CompactableTable,
    pub relations: Vec<Relation>,
}

impl From<&TableConfig> for RegistryEntry {
    fn from(config: &TableConfig) -> Self {
        Self {
            table: CompactableTable::new(config.name.clone())
                .with_id_column(config.id_column.clone()),
            relations: config.relations.iter().map(Relation::from).collect(),
        }
    }
}

/// Ordered compaction plan: parents before the join tables referencing them.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Registry {
    entries: Vec<RegistryEntry>,
}

impl Registry {
    pub fn new(entries: Vec<RegistryEntry>) -> Self {
        Self { entries }
    }

    /// Blog tables: tags, then articles, then projects, each with the join-table
    /// column that references it.
    pub fn builtin() -> Self {
        Self::new(vec![
            RegistryEntry {
                table: CompactableTable::new("tags"),
                relations: vec![
                    Relation::new("article_tags", "tag_id"),
                    Relation::new("project_tags", "tag_id"),
                ],
            },
            RegistryEntry {
                table: CompactableTable::new("articles"),
                relations: vec![Relation::new("article_tags", "article_id")],
            },
            RegistryEntry {
                table: CompactableTable::new("projects"),
                relations: vec![Relation::new("project_tags", "project_id")],
            },
        ])
    }

    /// Registry declared in configuration, or the built-in one when none is.
    pub fn from_config(tables: &[TableConfig]) -> Self {
        if tables.is_empty() {
            Self::builtin()
        } else {
            Self::new(tables.iter().map(RegistryEntry::from).collect())
        }
    }

    pub fn entries(&self) -> &[RegistryEntry] {
        &self.entries
    }

    pub fn find(&self, table: &str) -> Option<&RegistryEntry> {
        self.entries
            .iter()
            .find(|entry| entry.table.name.eq_ignore_ascii_case(table))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_relation() {
        let relation: Relation = "article_tags:tag_id".parse().unwrap();
        assert_eq!(relation, Relation::new("article_tags", "tag_id"));

        let relation: Relation = "article_tags:tag_id:ID".parse().unwrap();
        assert_eq!(relation.referenced_key, "ID");
        assert_eq!(relation.to_string(), "article_tags:tag_id:ID");
    }

    #[test]
    fn test_parse_relation_rejects_malformed_specs() {
        for spec in ["article_tags", "article_tags:", ":tag_id", "a:b:c:d", ""] {
            let err = spec.parse::<Relation>().unwrap_err();
            assert!(
                matches!(err, MaintenanceError::Configuration(_)),
                "{spec} should be rejected"
            );
        }
    }

    #[test]
    fn test_builtin_order() {
        let registry = Registry::builtin();
        let names: Vec<&str> = registry
            .entries()
            .iter()
            .map(|entry| entry.table.name.as_str())
            .collect();
        assert_eq!(names, ["tags", "articles", "projects"]);

        let tags = registry.find("TAGS").unwrap();
        assert_eq!(tags.relations.len(), 2);
        assert!(registry.find("users").is_none());
    }

    #[test]
    fn test_from_config() {
        assert_eq!(Registry::from_config(&[]), Registry::builtin());

        let tables = vec![TableConfig {
            name: "skills".to_string(),
            id_column: "ID".to_string(),
            relations: vec![RelationConfig {
                table: "skill_links".to_string(),
                foreign_key: "skill_id".to_string(),
                referenced_key: "ID".to_string(),
            }],
        }];
        let registry = Registry::from_config(&tables);

        assert_eq!(registry.entries().len(), 1);
        let entry = &registry.entries()[0];
        assert_eq!(entry.table.id_column, "ID");
        assert_eq!(entry.relations[0].foreign_key, "skill_id");
    }
}
