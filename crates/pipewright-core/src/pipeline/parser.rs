//! YAML pipeline documents to validated AST.
//!
//! Parsing happens in three stages, each usable on its own:
//!
//! 1. [`PipelineParser::parse`] turns YAML into a JSON value.
//! 2. [`PipelineParser::validate`] checks it against the pipeline JSON
//!    Schema and collects every violation.
//! 3. [`PipelineParser::to_ast`] builds the typed [`RootNode`], dispatching
//!    each step on its `type` field (default `plugin`).
//!
//! [`PipelineParser::load`] runs all three and also rejects structural
//! errors reported by the control graph.

use std::collections::HashSet;
use std::path::Path;

use jsonschema::Validator;
use pipewright_types::error::SchemaViolation;
use pipewright_types::pipeline::{
    AppendContextStep, ConditionalStep, ContextOperationStep, ExecutionMode, JumpStep,
    LoadContextStep, PipelineNode, PluginStep, RootNode, SaveContextStep, SetContextStep,
    StepKind, StepNode,
};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use super::graph::ControlGraph;
use crate::context::validator::collect_violations;

/// JSON Schema bundled for pipeline documents.
pub const DEFAULT_PIPELINE_SCHEMA: &str = include_str!("../../schemas/pipeline.schema.json");

/// Step type used when a step has no `type` field.
pub const DEFAULT_STEP_TYPE: &str = "plugin";

fn join(items: &[impl ToString]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors that can occur while turning a document into an AST.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("malformed YAML: {0}")]
    Yaml(String),

    #[error("schema validation failed: {}", join(.0))]
    Schema(Vec<SchemaViolation>),

    #[error("step '{step}' has unknown type '{step_type}'")]
    UnknownStepType { step: String, step_type: String },

    #[error("invalid step '{step}': {message}")]
    InvalidStep { step: String, message: String },

    #[error("invalid pipeline structure: {0}")]
    Structure(String),

    #[error("failed to read pipeline file: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Raw document shapes
// ---------------------------------------------------------------------------

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct RawPipeline {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    steps: Vec<Value>,
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default)]
    execution_mode: ExecutionMode,
    #[serde(default)]
    schedule: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawStep {
    name: String,
    #[serde(default, rename = "type")]
    step_type: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    iterate: Option<String>,
    #[serde(default)]
    steps: Vec<Value>,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

// ---------------------------------------------------------------------------
// PipelineParser
// ---------------------------------------------------------------------------

/// Parses and validates pipeline documents.
pub struct PipelineParser {
    schema: Validator,
    errors: Vec<SchemaViolation>,
}

impl PipelineParser {
    /// A parser using the bundled pipeline schema.
    pub fn new() -> Result<Self, ParseError> {
        let schema: Value = serde_json::from_str(DEFAULT_PIPELINE_SCHEMA)
            .map_err(|e| ParseError::Structure(format!("bundled schema is not JSON: {e}")))?;
        Self::with_schema(&schema)
    }

    /// A parser validating against an externally supplied schema.
    pub fn with_schema(schema: &Value) -> Result<Self, ParseError> {
        let schema = jsonschema::validator_for(schema).map_err(|e| {
            ParseError::Schema(vec![SchemaViolation {
                path: String::new(),
                message: format!("invalid pipeline schema: {e}"),
            }])
        })?;
        Ok(Self {
            schema,
            errors: Vec::new(),
        })
    }

    /// Violations collected by the last [`validate`](Self::validate) call.
    pub fn errors(&self) -> &[SchemaViolation] {
        &self.errors
    }

    /// Parse YAML text into a JSON value.
    pub fn parse(&self, yaml: &str) -> Result<Value, ParseError> {
        serde_yaml_ng::from_str::<Value>(yaml).map_err(|e| ParseError::Yaml(e.to_string()))
    }

    /// Validate a parsed document, recording every violation in
    /// [`errors`](Self::errors). Returns whether the document is valid.
    pub fn validate(&mut self, document: &Value) -> bool {
        self.errors = collect_violations(&self.schema, document);
        for violation in &self.errors {
            tracing::debug!(path = %violation.path, message = %violation.message, "schema violation");
        }
        self.errors.is_empty()
    }

    /// Build the AST from a (validated) document.
    pub fn to_ast(&self, document: &Value) -> Result<RootNode, ParseError> {
        let pipelines = document
            .get("pipelines")
            .and_then(Value::as_array)
            .ok_or_else(|| ParseError::Structure("missing 'pipelines' list".to_string()))?;

        let mut names = HashSet::new();
        let mut root = RootNode::default();
        for raw in pipelines {
            let pipeline = pipeline_from_value(raw)?;
            if !names.insert(pipeline.name.clone()) {
                return Err(ParseError::Structure(format!(
                    "duplicate pipeline name '{}'",
                    pipeline.name
                )));
            }
            root.pipelines.push(pipeline);
        }
        Ok(root)
    }

    /// Parse, validate, build the AST and check its structure.
    pub fn load(&mut self, yaml: &str) -> Result<RootNode, ParseError> {
        let document = self.parse(yaml)?;
        if !self.validate(&document) {
            return Err(ParseError::Schema(self.errors.clone()));
        }
        let ast = self.to_ast(&document)?;

        let graph = ControlGraph::build(&ast);
        if graph.has_errors() {
            return Err(ParseError::Structure(join(graph.errors())));
        }

        tracing::info!(pipelines = ast.pipelines.len(), "pipeline document loaded");
        Ok(ast)
    }

    pub fn load_file(&mut self, path: &Path) -> Result<RootNode, ParseError> {
        let yaml = std::fs::read_to_string(path)?;
        self.load(&yaml)
    }
}

impl std::fmt::Debug for PipelineParser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineParser")
            .field("errors", &self.errors)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// AST construction
// ---------------------------------------------------------------------------

fn pipeline_from_value(value: &Value) -> Result<PipelineNode, ParseError> {
    let raw: RawPipeline = serde_json::from_value(value.clone())
        .map_err(|e| ParseError::Structure(format!("invalid pipeline: {e}")))?;
    let steps = raw
        .steps
        .iter()
        .map(step_from_value)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(PipelineNode {
        name: raw.name,
        description: raw.description,
        steps,
        enabled: raw.enabled,
        execution_mode: raw.execution_mode,
        schedule: raw.schedule,
    })
}

fn payload<T: DeserializeOwned>(step: &str, rest: Map<String, Value>) -> Result<T, ParseError> {
    serde_json::from_value(Value::Object(rest)).map_err(|e| ParseError::InvalidStep {
        step: step.to_string(),
        message: e.to_string(),
    })
}

fn step_from_value(value: &Value) -> Result<StepNode, ParseError> {
    let raw: RawStep = serde_json::from_value(value.clone()).map_err(|e| {
        let step = value
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("<unnamed>");
        ParseError::InvalidStep {
            step: step.to_string(),
            message: e.to_string(),
        }
    })?;

    let name = raw.name;
    let step_type = raw.step_type.as_deref().unwrap_or(DEFAULT_STEP_TYPE);
    let kind = match step_type {
        "plugin" => {
            let plugin: PluginStep = payload(&name, raw.rest)?;
            if plugin.plugin.is_none() && raw.iterate.is_none() {
                return Err(ParseError::InvalidStep {
                    step: name,
                    message: "plugin step needs 'plugin' unless it iterates".to_string(),
                });
            }
            StepKind::Plugin(plugin)
        }
        "conditional" => StepKind::Conditional(payload::<ConditionalStep>(&name, raw.rest)?),
        "jump" => StepKind::Jump(payload::<JumpStep>(&name, raw.rest)?),
        "set_context" => StepKind::SetContext(payload::<SetContextStep>(&name, raw.rest)?),
        "load_context" => StepKind::LoadContext(payload::<LoadContextStep>(&name, raw.rest)?),
        "append_context" => {
            StepKind::AppendContext(payload::<AppendContextStep>(&name, raw.rest)?)
        }
        "save_context" => StepKind::SaveContext(payload::<SaveContextStep>(&name, raw.rest)?),
        "context_operation" => {
            StepKind::ContextOperation(payload::<ContextOperationStep>(&name, raw.rest)?)
        }
        "break" => StepKind::Break,
        "continue" => StepKind::Continue,
        other => {
            return Err(ParseError::UnknownStepType {
                step: name,
                step_type: other.to_string(),
            });
        }
    };

    if raw.iterate.is_some() && matches!(kind, StepKind::Jump(_) | StepKind::Break | StepKind::Continue) {
        return Err(ParseError::InvalidStep {
            step: name,
            message: format!("'{}' steps cannot iterate", kind.type_name()),
        });
    }

    let steps = raw
        .steps
        .iter()
        .map(step_from_value)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(StepNode {
        name,
        description: raw.description,
        iterate: raw.iterate,
        kind,
        steps,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipewright_types::context::MergeStrategy;
    use pipewright_types::pipeline::ContextOperation;
    use serde_json::json;

    const SAMPLE: &str = r#"
pipelines:
  - name: ingest
    description: Fetch and record jobs
    schedule: "0 * * * *"
    steps:
      - name: fetch
        plugin: Http.Fetch
        config:
          url: https://example.invalid/jobs
        output_key: response
      - name: per_job
        iterate: context.response.jobs
        steps:
          - name: record
            type: append_context
            path: jobs.seen
            value: "${ context.item }"
          - name: skip_rest
            type: conditional
            condition: context.item == 'stop'
            steps:
              - { name: stop, type: break }
      - name: snap
        type: context_operation
        operation: merge
        namespace: jobs
        values: { last: done }
        strategy: keep
        output_key: conflicts
  - name: disabled
    enabled: false
    steps: []
"#;

    fn parser() -> PipelineParser {
        PipelineParser::new().unwrap()
    }

    #[test]
    fn test_load_builds_typed_ast() {
        let ast = parser().load(SAMPLE).unwrap();
        assert_eq!(ast.pipelines.len(), 2);

        let ingest = ast.pipeline("ingest").unwrap();
        assert!(ingest.enabled);
        assert_eq!(ingest.schedule.as_deref(), Some("0 * * * *"));
        assert_eq!(ingest.steps.len(), 3);

        match &ingest.steps[0].kind {
            StepKind::Plugin(p) => {
                assert_eq!(p.plugin_ref(), Some((Some("Http"), "Fetch")));
                assert_eq!(p.config["url"], json!("https://example.invalid/jobs"));
                assert_eq!(p.output_key.as_deref(), Some("response"));
            }
            other => panic!("expected plugin step, got {other:?}"),
        }

        let per_job = &ingest.steps[1];
        assert!(per_job.is_iterative());
        assert_eq!(per_job.type_name(), "plugin");
        assert_eq!(per_job.steps.len(), 2);
        assert_eq!(per_job.steps[1].steps[0].type_name(), "break");

        match &ingest.steps[2].kind {
            StepKind::ContextOperation(op) => {
                assert_eq!(op.output_key.as_deref(), Some("conflicts"));
                match &op.operation {
                    ContextOperation::Merge { namespace, strategy, values } => {
                        assert_eq!(namespace, "jobs");
                        assert_eq!(*strategy, MergeStrategy::Keep);
                        assert_eq!(values["last"], json!("done"));
                    }
                    other => panic!("expected merge, got {other:?}"),
                }
            }
            other => panic!("expected context_operation, got {other:?}"),
        }

        assert!(!ast.pipeline("disabled").unwrap().enabled);
    }

    #[test]
    fn test_malformed_yaml() {
        let err = parser().parse("pipelines: [unclosed").unwrap_err();
        assert!(matches!(err, ParseError::Yaml(_)));
    }

    #[test]
    fn test_validate_collects_all_violations() {
        let mut parser = parser();
        let document = parser
            .parse(
                r#"
pipelines:
  - name: bad
    execution_mode: parallel
    steps:
      - name: j
        type: jump
      - type: set_context
        path: nodot
        value: 1
"#,
            )
            .unwrap();
        assert!(!parser.validate(&document));
        let paths: Vec<&str> = parser.errors().iter().map(|v| v.path.as_str()).collect();
        assert!(paths.contains(&"/pipelines/0/execution_mode"), "got {paths:?}");
        assert!(paths.iter().any(|p| p.starts_with("/pipelines/0/steps/0")), "got {paths:?}");
        assert!(paths.iter().any(|p| p.starts_with("/pipelines/0/steps/1")), "got {paths:?}");
    }

    #[test]
    fn test_load_reports_schema_error() {
        let err = parser().load("pipelines: 5").unwrap_err();
        match err {
            ParseError::Schema(violations) => assert!(!violations.is_empty()),
            other => panic!("expected schema error, got {other:?}"),
        }
    }

    #[test]
    fn test_to_ast_unknown_step_type() {
        let document = json!({
            "pipelines": [{ "name": "p", "steps": [{ "name": "s", "type": "teleport" }] }]
        });
        let err = parser().to_ast(&document).unwrap_err();
        assert!(matches!(
            err,
            ParseError::UnknownStepType { ref step, ref step_type } if step == "s" && step_type == "teleport"
        ));
    }

    #[test]
    fn test_plugin_step_requires_plugin_unless_iterating() {
        let document = json!({
            "pipelines": [{ "name": "p", "steps": [{ "name": "s" }] }]
        });
        assert!(matches!(
            parser().to_ast(&document).unwrap_err(),
            ParseError::InvalidStep { .. }
        ));
    }

    #[test]
    fn test_nested_steps_converted_for_any_type() {
        let document = json!({
            "pipelines": [{ "name": "p", "steps": [{
                "name": "outer",
                "type": "set_context",
                "path": "ns.k",
                "value": 1,
                "steps": [{ "name": "inner", "type": "continue" }]
            }]}]
        });
        let ast = parser().to_ast(&document).unwrap();
        assert_eq!(ast.pipelines[0].steps[0].steps[0].name, "inner");
    }

    #[test]
    fn test_duplicate_step_names_rejected_on_load() {
        let err = parser()
            .load(
                r#"
pipelines:
  - name: p
    steps:
      - { name: a, type: set_context, path: ns.a, value: 1 }
      - { name: a, type: set_context, path: ns.b, value: 2 }
"#,
            )
            .unwrap_err();
        assert!(matches!(err, ParseError::Structure(ref msg) if msg.contains("duplicate step 'a'")));
    }

    #[test]
    fn test_duplicate_pipeline_names_rejected() {
        let document = json!({
            "pipelines": [{ "name": "p", "steps": [] }, { "name": "p", "steps": [] }]
        });
        assert!(matches!(
            parser().to_ast(&document).unwrap_err(),
            ParseError::Structure(_)
        ));
    }

    #[test]
    fn test_custom_schema() {
        let schema = json!({
            "type": "object",
            "required": ["pipelines", "owner"]
        });
        let mut parser = PipelineParser::with_schema(&schema).unwrap();
        let document = parser.parse("pipelines: []").unwrap();
        assert!(!parser.validate(&document));
        let document = parser.parse("pipelines: []\nowner: ops").unwrap();
        assert!(parser.validate(&document));
    }

    #[test]
    fn test_load_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("pipeline.yaml");
        std::fs::write(&path, SAMPLE).unwrap();
        let ast = parser().load_file(&path).unwrap();
        assert_eq!(ast.pipelines.len(), 2);

        let missing = parser().load_file(&dir.path().join("missing.yaml")).unwrap_err();
        assert!(matches!(missing, ParseError::Io(_)));
    }
}
