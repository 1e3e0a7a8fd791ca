//! `pipewright run`: execute pipelines and print the resulting context.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use console::style;
use serde_json::{Map, Value};

use pipewright_core::pipeline::{PipelineParser, PluginRegistry, StatefulExecutor};

use crate::state::AppState;

pub fn handle_run(
    file: &Path,
    pipeline: Option<&str>,
    context: Option<&str>,
    show_state: bool,
    state: &AppState,
) -> Result<()> {
    let initial = parse_initial_context(context)?;
    let ast = PipelineParser::new()?.load_file(file)?;

    // No plugins are bundled with the binary; only context steps can run.
    let plugins = Arc::new(PluginRegistry::new());
    let mut executor = StatefulExecutor::new(ast, Arc::clone(&state.context_service), plugins)
        .with_config(state.config.executor.clone())
        .with_context(initial);

    let result = match pipeline {
        Some(name) => executor.execute_pipeline(name),
        None => executor.execute_all(),
    };

    let mut output = Map::new();
    if let Ok(context) = &result {
        output.insert("context".to_string(), Value::Object(context.clone()));
    }
    if show_state {
        output.insert(
            "execution_state".to_string(),
            serde_json::to_value(executor.execution_states())?,
        );
    }

    if !output.is_empty() {
        println!("{}", serde_json::to_string_pretty(&output)?);
    }

    match result {
        Ok(_) => {
            eprintln!(
                "  {} {} pipeline run(s) completed",
                style("*").green().bold(),
                executor.execution_states().len()
            );
            Ok(())
        }
        Err(e) => Err(e).with_context(|| format!("Pipeline run failed for {}", file.display())),
    }
}

fn parse_initial_context(raw: Option<&str>) -> Result<Map<String, Value>> {
    let Some(raw) = raw else {
        return Ok(Map::new());
    };
    match serde_json::from_str::<Value>(raw).context("Invalid --context JSON")? {
        Value::Object(map) => Ok(map),
        other => bail!("--context must be a JSON object, got {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_context_defaults_to_empty() {
        assert!(parse_initial_context(None).unwrap().is_empty());
    }

    #[test]
    fn test_initial_context_must_be_object() {
        let map = parse_initial_context(Some(r#"{"items": [1, 2]}"#)).unwrap();
        assert_eq!(map["items"], serde_json::json!([1, 2]));
        assert!(parse_initial_context(Some("[1, 2]")).is_err());
        assert!(parse_initial_context(Some("{oops")).is_err());
    }
}
