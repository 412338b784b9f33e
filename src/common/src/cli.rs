use clap::Parser;
use std::path::PathBuf;

/// Common CLI arguments shared across densekey binaries
#[derive(Parser, Debug, Clone, Default)]
pub struct CommonArgs {
    #[arg(long, global = true, help = "Configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(short, long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(short, long, global = true, help = "Enable quiet mode (minimal output)")]
    pub quiet: bool,
}

/// Utility functions for CLI operations
pub mod utils {
    use super::*;
    use crate::config::Configuration;
    use anyhow::{Context, Result};
    use std::net::SocketAddr;
    use tracing_subscriber::EnvFilter;

    /// Log level selected by the verbosity flags
    pub fn log_level(args: &CommonArgs) -> &'static str {
        if args.quiet {
            "warn"
        } else if args.verbose {
            "debug"
        } else {
            "info"
        }
    }

    /// Initialize logging based on CLI arguments.
    ///
    /// `RUST_LOG` wins over the flags. Output goes to stderr so JSON results on
    /// stdout stay machine-readable.
    pub fn init_logging(args: &CommonArgs) {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(log_level(args)));

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    /// Load configuration with optional override from CLI
    pub fn load_config(config_path: Option<&PathBuf>) -> Result<Configuration> {
        match config_path {
            Some(path) => {
                log::info!("Loading configuration from: {}", path.display());
                Configuration::load_from_path(path).context("Failed to load configuration")
            }
            None => Configuration::load().context("Failed to load configuration"),
        }
    }

    /// Display configuration in human-readable or JSON format
    pub fn display_config(config: &Configuration, json: bool) -> Result<()> {
        if json {
            let json = serde_json::to_string_pretty(config)
                .context("Failed to serialize configuration to JSON")?;
            println!("{json}");
        } else {
            println!("densekey configuration:");
            println!("=======================");
            println!("Database DSN: {}", config.database.dsn);
            println!("Max connections: {}", config.database.max_connections);
            println!("Acquire timeout: {:?}", config.database.acquire_timeout);
            println!("Default id column: {}", config.maintenance.id_column);
            println!("Sequence adapter: {}", config.maintenance.sequence);

            if config.maintenance.tables.is_empty() {
                println!("Registry: built-in (tags, articles, projects)");
            } else {
                println!("Registry:");
                for table in &config.maintenance.tables {
                    println!("  {} ({})", table.name, table.id_column);
                    for relation in &table.relations {
                        println!(
                            "    <- {}.{} references {}",
                            relation.table, relation.foreign_key, relation.referenced_key
                        );
                    }
                }
            }

            println!("Admin bind: {}", config.admin.bind);
            println!(
                "Admin API: {}",
                if config.admin.admin_key.is_some() {
                    "enabled"
                } else {
                    "disabled (no admin key)"
                }
            );
            println!("Admin run timeout: {:?}", config.admin.run_timeout);
        }
        Ok(())
    }

    /// Validate configuration and report any issues
    pub fn validate_config(config: &Configuration) -> Result<()> {
        log::info!("Validating configuration...");

        let dsn = config.database.dsn.trim();
        if dsn.is_empty() {
            anyhow::bail!("Database DSN cannot be empty");
        }

        if !(dsn.starts_with("sqlite:")
            || dsn.starts_with("postgres://")
            || dsn.starts_with("postgresql://"))
        {
            anyhow::bail!("Database DSN must be a sqlite: or postgres:// URL, got '{dsn}'");
        }

        if config.database.max_connections == 0 {
            anyhow::bail!("database.max_connections must be at least 1");
        }

        if config.maintenance.id_column.trim().is_empty() {
            anyhow::bail!("maintenance.id_column cannot be empty");
        }

        for table in &config.maintenance.tables {
            if table.name.trim().is_empty() || table.id_column.trim().is_empty() {
                anyhow::bail!("Registry tables need a name and an id column");
            }
            for relation in &table.relations {
                if relation.table.trim().is_empty()
                    || relation.foreign_key.trim().is_empty()
                    || relation.referenced_key.trim().is_empty()
                {
                    anyhow::bail!(
                        "Relation of table '{}' needs a table, a foreign key and a referenced key",
                        table.name
                    );
                }
            }
        }

        config
            .admin
            .bind
            .parse::<SocketAddr>()
            .with_context(|| format!("Invalid admin bind address '{}'", config.admin.bind))?;

        if matches!(config.admin.admin_key.as_deref(), Some(key) if key.trim().is_empty()) {
            anyhow::bail!("admin.admin_key cannot be empty when set");
        }

        log::info!("✅ Configuration validation passed");
        Ok(())
    }
}
