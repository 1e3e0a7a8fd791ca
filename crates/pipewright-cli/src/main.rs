//! Pipewright command-line entry point.
//!
//! Binary name: `pipewright`
//!
//! Parses CLI arguments, loads the engine configuration, initializes
//! tracing, then dispatches to the command handler.

mod cli;
mod state;

use std::path::Path;

use anyhow::Result;
use clap::Parser;

use cli::{Cli, Commands};
use pipewright_infra::config::{DEFAULT_CONFIG_FILE, load_engine_config, load_engine_config_strict};
use pipewright_types::config::EngineConfig;
use state::AppState;

fn main() -> Result<()> {
    let cli = Cli::parse();

    // An explicit --config must exist and parse; the default file is optional.
    let mut config: EngineConfig = match &cli.config {
        Some(path) => load_engine_config_strict(path)?,
        None => load_engine_config(Path::new(DEFAULT_CONFIG_FILE)),
    };

    match cli.verbose {
        0 => {}
        1 => config.logging.level = "info,pipewright_core=debug,pipewright_infra=debug".to_string(),
        _ => config.logging.level = "trace".to_string(),
    }
    if cli.json_logs {
        config.logging.json = true;
    }
    pipewright_observe::init_tracing(&config.logging)
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;

    match cli.command {
        Commands::Validate { file, schema } => {
            cli::validate::handle_validate(&file, schema.as_deref())?;
        }

        Commands::Graph { file } => {
            cli::graph::handle_graph(&file)?;
        }

        Commands::Run {
            file,
            pipeline,
            context,
            state,
        } => {
            let app = AppState::init(config)?;
            cli::run::handle_run(&file, pipeline.as_deref(), context.as_deref(), state, &app)?;
        }
    }

    Ok(())
}
