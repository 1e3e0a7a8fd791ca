//! CLI command definitions for the `pipewright` binary.
//!
//! Uses clap derive macros for argument parsing. Every command takes a
//! pipeline YAML file.

pub mod graph;
pub mod run;
pub mod validate;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use pipewright_types::pipeline::StepNode;

/// Validate, inspect and run YAML pipelines.
#[derive(Parser)]
#[command(name = "pipewright", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Engine configuration file (TOML). Defaults to ./pipewright.toml if present.
    #[arg(long, global = true, env = "PIPEWRIGHT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Detailed output (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check a pipeline file against the schema and its control-flow structure.
    Validate {
        /// Path to the pipeline YAML file.
        file: PathBuf,

        /// Validate against this JSON Schema instead of the bundled one.
        #[arg(long)]
        schema: Option<PathBuf>,
    },

    /// Print the control graph and any cycles.
    Graph {
        /// Path to the pipeline YAML file.
        file: PathBuf,
    },

    /// Execute pipelines against the configured context store.
    Run {
        /// Path to the pipeline YAML file.
        file: PathBuf,

        /// Run only this pipeline (default: every enabled pipeline).
        #[arg(long, short)]
        pipeline: Option<String>,

        /// Initial live context as a JSON object.
        #[arg(long)]
        context: Option<String>,

        /// Also print the execution-state tree.
        #[arg(long)]
        state: bool,
    },
}

/// Total number of steps, nested steps included.
pub fn count_steps(steps: &[StepNode]) -> usize {
    steps.iter().map(|step| 1 + count_steps(&step.steps)).sum()
}
