//! Pipeline AST types for Pipewright.
//!
//! `RootNode` is the typed form of a pipeline YAML document. The parser in
//! `pipewright-core` builds it from a validated document; the control graph
//! and the executor only ever see these types, never raw YAML.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::context::MergeStrategy;

// ---------------------------------------------------------------------------
// Root / pipeline
// ---------------------------------------------------------------------------

/// A parsed pipeline document: one or more named pipelines.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RootNode {
    pub pipelines: Vec<PipelineNode>,
}

impl RootNode {
    /// Find a pipeline by name.
    pub fn pipeline(&self, name: &str) -> Option<&PipelineNode> {
        self.pipelines.iter().find(|p| p.name == name)
    }
}

/// A single named pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineNode {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub steps: Vec<StepNode>,
    pub enabled: bool,
    pub execution_mode: ExecutionMode,
    /// Schedule expression, carried for external schedulers. The executor
    /// does not interpret it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
}

/// How the steps of a pipeline are run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Sequential,
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// One step of a pipeline.
///
/// Fields shared by every step type live here; the type-specific payload is
/// in `kind`. `steps` holds nested steps for any kind: the loop body of an
/// iterating step, the guarded block of a conditional, or a plain group that
/// runs after the step's own action.
#[derive(Debug, Clone, Serialize)]
pub struct StepNode {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Expression producing the list to iterate over.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iterate: Option<String>,
    #[serde(flatten)]
    pub kind: StepKind,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<StepNode>,
}

impl StepNode {
    /// Discriminator string as it appears in YAML.
    pub fn type_name(&self) -> &'static str {
        self.kind.type_name()
    }

    pub fn is_iterative(&self) -> bool {
        self.iterate.is_some()
    }
}

/// Type-specific step payload, tagged by `type` in YAML.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    Plugin(PluginStep),
    Conditional(ConditionalStep),
    Jump(JumpStep),
    SetContext(SetContextStep),
    LoadContext(LoadContextStep),
    AppendContext(AppendContextStep),
    SaveContext(SaveContextStep),
    ContextOperation(ContextOperationStep),
    Break,
    Continue,
}

impl StepKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            StepKind::Plugin(_) => "plugin",
            StepKind::Conditional(_) => "conditional",
            StepKind::Jump(_) => "jump",
            StepKind::SetContext(_) => "set_context",
            StepKind::LoadContext(_) => "load_context",
            StepKind::AppendContext(_) => "append_context",
            StepKind::SaveContext(_) => "save_context",
            StepKind::ContextOperation(_) => "context_operation",
            StepKind::Break => "break",
            StepKind::Continue => "continue",
        }
    }
}

/// Invoke a plugin resolved through the plugin manager.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginStep {
    /// `"Type.Name"` or a bare `"Name"`. Optional only for iterate containers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub config: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_key: Option<String>,
}

impl PluginStep {
    /// Split the plugin reference into `(Some(type), name)` or `(None, name)`.
    pub fn plugin_ref(&self) -> Option<(Option<&str>, &str)> {
        let reference = self.plugin.as_deref()?;
        Some(match reference.split_once('.') {
            Some((plugin_type, name)) => (Some(plugin_type), name),
            None => (None, reference),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionalStep {
    pub condition: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JumpStep {
    pub target: String,
    /// Jump only when this evaluates truthy. Unconditional when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetContextStep {
    pub path: String,
    pub value: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadContextStep {
    pub path: String,
    /// Live-context key to load into. Defaults to the key part of `path`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendContextStep {
    pub path: String,
    pub value: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveContextStep {
    /// Dotted live-context path (`context.` prefix optional).
    pub source: String,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextOperationStep {
    #[serde(flatten)]
    pub operation: ContextOperation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_key: Option<String>,
}

/// A direct call into the context service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum ContextOperation {
    Merge {
        namespace: String,
        values: Map<String, Value>,
        #[serde(default)]
        strategy: MergeStrategy,
    },
    Snapshot {
        namespace: String,
    },
    Restore {
        /// Snapshot id, either a number or a `${ expr }` string.
        snapshot_id: Value,
    },
    Delete {
        namespace: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key: Option<String>,
    },
    SaveToStorage {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        namespace: Option<String>,
    },
    LoadFromStorage {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        namespace: Option<String>,
    },
    DeleteFromStorage {
        namespace: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step(name: &str, kind: StepKind) -> StepNode {
        StepNode {
            name: name.to_string(),
            description: None,
            iterate: None,
            kind,
            steps: vec![],
        }
    }

    #[test]
    fn test_plugin_ref_splits_type_and_name() {
        let qualified = PluginStep {
            plugin: Some("AI.Summarizer".to_string()),
            ..Default::default()
        };
        assert_eq!(qualified.plugin_ref(), Some((Some("AI"), "Summarizer")));

        let bare = PluginStep {
            plugin: Some("Summarizer".to_string()),
            ..Default::default()
        };
        assert_eq!(bare.plugin_ref(), Some((None, "Summarizer")));

        assert_eq!(PluginStep::default().plugin_ref(), None);
    }

    #[test]
    fn test_step_serializes_with_type_tag() {
        let node = step(
            "store",
            StepKind::SetContext(SetContextStep {
                path: "jobs.status".to_string(),
                value: json!("queued"),
            }),
        );
        let value = serde_json::to_value(&node).unwrap();
        assert_eq!(value["type"], "set_context");
        assert_eq!(value["path"], "jobs.status");
        assert!(value.get("steps").is_none());
    }

    #[test]
    fn test_unit_variants_serialize_as_bare_type() {
        let value = serde_json::to_value(step("stop", StepKind::Break)).unwrap();
        assert_eq!(value["type"], "break");
        assert_eq!(value["name"], "stop");
    }

    #[test]
    fn test_context_operation_deserializes_from_tag() {
        let op: ContextOperationStep = serde_json::from_value(json!({
            "operation": "merge",
            "namespace": "jobs",
            "values": { "a": 1 },
            "strategy": "keep",
            "output_key": "conflicts"
        }))
        .unwrap();
        match op.operation {
            ContextOperation::Merge { namespace, strategy, .. } => {
                assert_eq!(namespace, "jobs");
                assert_eq!(strategy, MergeStrategy::Keep);
            }
            other => panic!("unexpected operation: {other:?}"),
        }
        assert_eq!(op.output_key.as_deref(), Some("conflicts"));
    }

    #[test]
    fn test_root_finds_pipeline_by_name() {
        let root = RootNode {
            pipelines: vec![PipelineNode {
                name: "ingest".to_string(),
                description: None,
                steps: vec![],
                enabled: true,
                execution_mode: ExecutionMode::Sequential,
                schedule: None,
            }],
        };
        assert!(root.pipeline("ingest").is_some());
        assert!(root.pipeline("missing").is_none());
    }
}
