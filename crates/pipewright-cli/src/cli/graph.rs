//! `pipewright graph`: adjacency list and cycle report.

use std::path::Path;

use anyhow::Result;
use console::style;

use pipewright_core::pipeline::{ControlGraph, PipelineParser};

pub fn handle_graph(file: &Path) -> Result<()> {
    let ast = PipelineParser::new()?.load_file(file)?;
    let graph = ControlGraph::build(&ast);

    println!();
    for (node, successors) in graph.adjacency() {
        if successors.is_empty() {
            println!("  {}", style(node).cyan());
        } else {
            println!("  {} -> {}", style(node).cyan(), successors.join(", "));
        }
    }

    let cycles = graph.detect_cycles();
    println!();
    if cycles.is_empty() {
        println!("  {} no cycles", style("*").green().bold());
    } else {
        for cycle in &cycles {
            println!("  {} cycle: {}", style("!").yellow().bold(), cycle.join(" -> "));
        }
    }
    println!();
    Ok(())
}
