//! Execution-state tree exported to visualizers.
//!
//! The tree mirrors the pipeline AST: one node per step, nested steps as
//! `children`, and an `iterations` record on iterating steps. The executor
//! is the only writer; everything else reads the serialized form:
//!
//! ```json
//! { "name": "...", "status": "running", "start_time": "...", "end_time": null,
//!   "error": null, "children": [ ... ], "iterations": { "count": 3, ... } }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pipeline::{PipelineNode, StepNode};

/// Lifecycle of a step (and of a single iteration).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

/// Per-element bookkeeping for an iterating step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub count: usize,
    pub statuses: Vec<StepStatus>,
    pub labels: Vec<String>,
}

impl IterationRecord {
    /// Reset for a fresh pass over `labels.len()` elements.
    pub fn start(&mut self, labels: Vec<String>) {
        self.count = labels.len();
        self.statuses = vec![StepStatus::Pending; labels.len()];
        self.labels = labels;
    }

    pub fn set_status(&mut self, index: usize, status: StepStatus) {
        if let Some(slot) = self.statuses.get_mut(index) {
            *slot = status;
        }
    }
}

/// One node of the execution-state tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStateNode {
    pub name: String,
    pub status: StepStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ExecutionStateNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iterations: Option<IterationRecord>,
}

impl ExecutionStateNode {
    fn pending(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: StepStatus::Pending,
            start_time: None,
            end_time: None,
            error: None,
            children: Vec::new(),
            iterations: None,
        }
    }

    /// Build the all-pending tree for a pipeline.
    pub fn for_pipeline(pipeline: &PipelineNode) -> Self {
        let mut root = Self::pending(&pipeline.name);
        root.children = pipeline.steps.iter().map(Self::for_step).collect();
        root
    }

    fn for_step(step: &StepNode) -> Self {
        let mut node = Self::pending(&step.name);
        node.children = step.steps.iter().map(Self::for_step).collect();
        if step.is_iterative() {
            node.iterations = Some(IterationRecord::default());
        }
        node
    }

    /// Follow a path of child indices from this node.
    pub fn node(&self, path: &[usize]) -> Option<&ExecutionStateNode> {
        path.iter()
            .try_fold(self, |node, &index| node.children.get(index))
    }

    pub fn node_mut(&mut self, path: &[usize]) -> Option<&mut ExecutionStateNode> {
        path.iter()
            .try_fold(self, |node, &index| node.children.get_mut(index))
    }

    pub fn mark_running(&mut self) {
        self.status = StepStatus::Running;
        self.start_time = Some(Utc::now());
        self.end_time = None;
        self.error = None;
    }

    pub fn mark_completed(&mut self) {
        self.status = StepStatus::Completed;
        self.end_time = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = StepStatus::Failed;
        self.end_time = Some(Utc::now());
        self.error = Some(error.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{ExecutionMode, PluginStep, StepKind};

    fn step(name: &str, iterate: Option<&str>, steps: Vec<StepNode>) -> StepNode {
        StepNode {
            name: name.to_string(),
            description: None,
            iterate: iterate.map(String::from),
            kind: StepKind::Plugin(PluginStep::default()),
            steps,
        }
    }

    fn pipeline() -> PipelineNode {
        PipelineNode {
            name: "ingest".to_string(),
            description: None,
            steps: vec![
                step("fetch", None, vec![]),
                step("each", Some("context.items"), vec![step("inner", None, vec![])]),
            ],
            enabled: true,
            execution_mode: ExecutionMode::Sequential,
            schedule: None,
        }
    }

    #[test]
    fn test_tree_mirrors_pipeline() {
        let tree = ExecutionStateNode::for_pipeline(&pipeline());
        assert_eq!(tree.name, "ingest");
        assert_eq!(tree.children.len(), 2);
        assert_eq!(tree.node(&[1, 0]).unwrap().name, "inner");
        assert!(tree.node(&[1]).unwrap().iterations.is_some());
        assert!(tree.node(&[0]).unwrap().iterations.is_none());
        assert!(tree.node(&[5]).is_none());
    }

    #[test]
    fn test_status_transitions_record_times() {
        let mut tree = ExecutionStateNode::for_pipeline(&pipeline());
        let node = tree.node_mut(&[0]).unwrap();
        node.mark_running();
        assert_eq!(node.status, StepStatus::Running);
        assert!(node.start_time.is_some());
        node.mark_failed("boom");
        assert_eq!(node.status, StepStatus::Failed);
        assert_eq!(node.error.as_deref(), Some("boom"));
        assert!(node.end_time.is_some());
    }

    #[test]
    fn test_serialized_shape_matches_export_format() {
        let mut tree = ExecutionStateNode::for_pipeline(&pipeline());
        tree.node_mut(&[1])
            .unwrap()
            .iterations
            .as_mut()
            .unwrap()
            .start(vec!["a".to_string(), "b".to_string()]);

        let value = serde_json::to_value(&tree).unwrap();
        assert_eq!(value["status"], "pending");
        assert!(value["start_time"].is_null());
        assert_eq!(value["children"][1]["iterations"]["count"], 2);
        assert_eq!(value["children"][1]["iterations"]["statuses"][0], "pending");
        assert!(value["children"][0].get("children").is_none());
    }
}
