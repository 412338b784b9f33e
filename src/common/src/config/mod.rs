use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};

/// Default configuration file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "densekey.toml";

fn default_id_column() -> String {
    "id".to_string()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Connection string of the store to maintain (SQLite or PostgreSQL DSN)
    pub dsn: String,
    /// Upper bound on pooled connections. In-memory SQLite always uses one.
    pub max_connections: u32,
    /// How long to wait for a pooled connection before giving up
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            dsn: String::from("sqlite://.data/blog.db"),
            max_connections: 1,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

impl DatabaseConfig {
    /// Create an in-memory database configuration, mostly useful for tests
    pub fn in_memory() -> Self {
        Self {
            dsn: String::from("sqlite::memory:"),
            ..Self::default()
        }
    }
}

/// Which autoincrement mechanism the sequence repairer should drive.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SequenceBackend {
    /// Pick the adapter matching the connected backend
    #[default]
    Auto,
    /// `sqlite_sequence` bookkeeping for AUTOINCREMENT tables
    Sqlite,
    /// Serial/identity sequences via `setval`
    Postgres,
    /// The engine derives the next id from `MAX(id)`; repair is a no-op
    #[serde(rename = "none", alias = "derived")]
    Derived,
}

impl std::fmt::Display for SequenceBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SequenceBackend::Auto => "auto",
            SequenceBackend::Sqlite => "sqlite",
            SequenceBackend::Postgres => "postgres",
            SequenceBackend::Derived => "none",
        };
        f.write_str(name)
    }
}

/// A dependent table whose foreign key points at a compacted table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationConfig {
    pub table: String,
    #[serde(alias = "fk")]
    pub foreign_key: String,
    #[serde(alias = "pk", default = "default_id_column")]
    pub referenced_key: String,
}

/// A table whose primary key is compacted, with the relations referencing it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableConfig {
    pub name: String,
    #[serde(default = "default_id_column")]
    pub id_column: String,
    #[serde(default)]
    pub relations: Vec<RelationConfig>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    /// Id column name used when a table does not declare its own
    pub id_column: String,
    /// Sequence adapter selection
    pub sequence: SequenceBackend,
    /// Compaction registry in run order. Empty means the built-in registry.
    #[serde(default)]
    pub tables: Vec<TableConfig>,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            id_column: default_id_column(),
            sequence: SequenceBackend::Auto,
            tables: Vec::new(),
        }
    }
}

/// Admin HTTP surface.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AdminConfig {
    /// Address the admin server binds to
    pub bind: String,
    /// Bearer token required by every admin endpoint. Unset disables them.
    #[serde(default)]
    pub admin_key: Option<String>,
    /// Upper bound on a single maintenance run triggered over HTTP
    #[serde(with = "humantime_serde")]
    pub run_timeout: Duration,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            bind: String::from("127.0.0.1:8088"),
            admin_key: None,
            run_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Configuration {
    /// Store holding the tables to maintain
    pub database: DatabaseConfig,
    /// Compaction and sequence repair settings
    pub maintenance: MaintenanceConfig,
    /// Admin HTTP surface settings
    pub admin: AdminConfig,
}

impl Configuration {
    /// Build the layered figment: defaults, TOML file, `DATABASE_URL`, then
    /// `DENSEKEY__` prefixed variables.
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Configuration::default()))
            .merge(Toml::file(path))
            .merge(
                Env::raw()
                    .only(&["DATABASE_URL"])
                    .map(|_| "database.dsn".into()),
            )
            .merge(Env::prefixed("DENSEKEY__").split("__"))
    }

    pub fn load() -> Result<Self, Box<figment::Error>> {
        Self::load_from_path(Path::new(DEFAULT_CONFIG_FILE))
    }

    pub fn load_from_path(path: &Path) -> Result<Self, Box<figment::Error>> {
        let config = Self::figment(path).extract().map_err(Box::new)?;

        Ok(config)
    }
}
