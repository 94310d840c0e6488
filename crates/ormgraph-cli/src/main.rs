//! ormgraph command-line tool
//!
//! Validates schema catalogs, explains structural queries and reads or
//! writes entities in a sled-backed store.

mod commands;
mod config;
mod error;
mod formatter;
mod parse;

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::{Args, CliConfig, Command};
use error::Result;

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ormgraph_cli=info,ormgraph_core=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let (config, command) = Args::parse().into_config();
    match run(&config, command) {
        Ok(output) => println!("{}", output),
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

fn run(config: &CliConfig, command: Command) -> Result<String> {
    let definitions = Arc::new(commands::load_definitions(&config.schema_path)?);
    let formatter = formatter::create_formatter(config.format);

    match command {
        Command::Check => commands::check(&definitions, &*formatter),
        Command::Explain(args) => commands::explain(definitions, config, &args, &*formatter),
        Command::Query(args) => {
            let env = commands::open_environment(definitions, config)?;
            commands::query(&env, &args, &*formatter)
        }
        Command::Insert {
            entity_type,
            values,
        } => {
            let env = commands::open_environment(definitions, config)?;
            commands::insert(&env, &entity_type, &values, &*formatter)
        }
        Command::Delete { entity_type, key } => {
            let env = commands::open_environment(definitions, config)?;
            commands::delete(&env, &entity_type, &key, &*formatter)
        }
    }
}
