//! `pipewright validate`: schema, AST and control-graph checks.

use std::path::Path;

use anyhow::{Context, Result, bail};
use console::style;

use pipewright_core::pipeline::{ControlGraph, PipelineParser};

use super::count_steps;

pub fn handle_validate(file: &Path, schema: Option<&Path>) -> Result<()> {
    let yaml = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;

    let mut parser = match schema {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read schema {}", path.display()))?;
            let schema: serde_json::Value =
                serde_json::from_str(&raw).with_context(|| "Schema is not valid JSON")?;
            PipelineParser::with_schema(&schema)?
        }
        None => PipelineParser::new()?,
    };

    let document = parser.parse(&yaml)?;
    if !parser.validate(&document) {
        println!();
        for violation in parser.errors() {
            println!("  {} {violation}", style("x").red().bold());
        }
        println!();
        bail!("{} schema violation(s) in {}", parser.errors().len(), file.display());
    }

    let ast = parser.to_ast(&document)?;
    let graph = ControlGraph::build(&ast);
    let cycles = graph.detect_cycles();

    println!();
    for error in graph.errors() {
        println!("  {} {error}", style("x").red().bold());
    }
    for cycle in &cycles {
        println!(
            "  {} cycle: {} (bounded by executor.max_jumps)",
            style("!").yellow().bold(),
            cycle.join(" -> ")
        );
    }
    if graph.has_errors() {
        println!();
        bail!("{} structural error(s) in {}", graph.errors().len(), file.display());
    }

    let steps: usize = ast.pipelines.iter().map(|p| count_steps(&p.steps)).sum();
    println!(
        "  {} {} is valid: {} pipeline(s), {} step(s)",
        style("*").green().bold(),
        style(file.display()).cyan(),
        ast.pipelines.len(),
        steps
    );
    println!();
    Ok(())
}
