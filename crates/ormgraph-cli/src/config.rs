//! Command-line configuration.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use ormgraph_core::config::{DEFAULT_MAX_BATCH_SIZE, DEFAULT_NAMESPACE};
use ormgraph_core::{ContextConfig, EnvironmentConfig};

use crate::formatter::OutputFormat;

/// Default directory of the sled store.
pub const DEFAULT_DATA_PATH: &str = "./ormgraph-data";

/// ormgraph command-line tool
#[derive(Parser, Debug)]
#[command(name = "ormgraph")]
#[command(version, about = "Inspect ormgraph schemas and query sled-backed stores")]
pub struct Args {
    /// JSON schema catalog
    #[arg(short = 's', long)]
    pub schema: PathBuf,

    /// Directory of the sled store
    #[arg(short = 'd', long, default_value = DEFAULT_DATA_PATH)]
    pub data: PathBuf,

    /// Namespace type names are looked up in
    #[arg(short = 'n', long, default_value = DEFAULT_NAMESPACE)]
    pub namespace: String,

    /// Output format
    #[arg(long, default_value = "table", value_enum)]
    pub format: OutputFormat,

    /// Maximum statements per backend batch
    #[arg(long, default_value_t = DEFAULT_MAX_BATCH_SIZE)]
    pub batch_size: usize,

    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Validate the schema and print types in write order
    Check,

    /// Print the join tree and parameters of a query without running it
    Explain(QueryArgs),

    /// Run a query against the store
    Query(QueryArgs),

    /// Insert one entity
    Insert {
        /// Entity type name
        entity_type: String,

        /// Field assignment (`field=value`); references take the target key
        #[arg(long = "set", value_name = "FIELD=VALUE")]
        values: Vec<String>,
    },

    /// Delete one entity by primary key
    Delete {
        /// Entity type name
        entity_type: String,

        /// Primary key
        key: String,
    },
}

/// Query shape shared by `explain` and `query`.
#[derive(clap::Args, Debug, Clone)]
pub struct QueryArgs {
    /// Root entity type name
    pub entity_type: String,

    /// Relation path to fetch with the roots (`owner`, `area.parent`)
    #[arg(long = "join", value_name = "PATH")]
    pub joins: Vec<String>,

    /// Filter on the roots (`name=Ann`, `owner.name~A%`, `area=null`)
    #[arg(long = "where", value_name = "FILTER")]
    pub filters: Vec<String>,

    /// Order by a root field; prefix with `-` for descending
    #[arg(long)]
    pub order: Option<String>,
}

/// Resolved settings.
#[derive(Debug, Clone)]
pub struct CliConfig {
    /// Schema catalog file.
    pub schema_path: PathBuf,

    /// Store directory.
    pub data_path: PathBuf,

    /// Output format.
    pub format: OutputFormat,

    /// Environment settings.
    pub environment: EnvironmentConfig,
}

impl CliConfig {
    /// Create a configuration with defaults.
    pub fn new(schema_path: impl Into<PathBuf>) -> Self {
        Self {
            schema_path: schema_path.into(),
            data_path: PathBuf::from(DEFAULT_DATA_PATH),
            format: OutputFormat::Table,
            environment: EnvironmentConfig::new(DEFAULT_NAMESPACE),
        }
    }

    /// Set the store directory.
    pub fn with_data_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_path = path.into();
        self
    }

    /// Set the output format.
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Set the environment settings.
    pub fn with_environment(mut self, environment: EnvironmentConfig) -> Self {
        self.environment = environment;
        self
    }
}

impl Args {
    /// Convert command-line arguments to settings.
    pub fn into_config(self) -> (CliConfig, Command) {
        let context = ContextConfig::new().with_max_batch_size(self.batch_size);
        let config = CliConfig::new(self.schema)
            .with_data_path(self.data)
            .with_format(self.format)
            .with_environment(EnvironmentConfig::new(self.namespace).with_context(context));
        (config, self.command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_config() {
        let args = Args::parse_from([
            "ormgraph",
            "--schema",
            "catalog.json",
            "-n",
            "org",
            "--batch-size",
            "0",
            "query",
            "Account",
            "--where",
            "name=Ann",
            "--join",
            "projects",
        ]);
        let (config, command) = args.into_config();
        assert_eq!(config.schema_path, PathBuf::from("catalog.json"));
        assert_eq!(config.data_path, PathBuf::from(DEFAULT_DATA_PATH));
        assert_eq!(config.environment.namespace, "org");
        assert_eq!(config.environment.context.max_batch_size, 1);
        let Command::Query(query) = command else {
            panic!("expected query command");
        };
        assert_eq!(query.filters, vec!["name=Ann"]);
        assert_eq!(query.joins, vec!["projects"]);
    }
}
