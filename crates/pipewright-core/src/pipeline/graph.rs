//! Control graph built from the pipeline AST, and static cycle detection.
//!
//! Nodes are qualified step names: `pipeline::step` at the top level and
//! `pipeline::step::child` for nested steps, so names stay unique across
//! pipelines and loop bodies. Edges:
//!
//! - step *i* to step *i+1* within a block,
//! - a step with nested steps to its first nested step,
//! - a `jump` step to its target within the same block.
//!
//! Jumps are the only way to close a cycle.

use std::collections::{HashMap, HashSet};

use petgraph::graph::{DiGraph, NodeIndex};
use pipewright_types::pipeline::{RootNode, StepKind, StepNode};

/// Separator between the segments of a qualified step name.
pub const SCOPE_SEPARATOR: &str = "::";

/// Structural problems found while building the graph.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("duplicate step '{step}' in '{scope}'")]
    DuplicateStep { scope: String, step: String },

    #[error("step '{step}' in '{scope}' jumps to unknown step '{target}'")]
    UnknownJumpTarget {
        scope: String,
        step: String,
        target: String,
    },

    #[error("cycle detected: {}", .0.join(" -> "))]
    CycleDetected(Vec<String>),
}

/// How one step reaches the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    Sequence,
    Body,
    Jump,
}

/// Directed step-transition graph for every pipeline in an AST.
#[derive(Debug, Default)]
pub struct ControlGraph {
    graph: DiGraph<String, EdgeKind>,
    index: HashMap<String, NodeIndex>,
    errors: Vec<String>,
}

impl ControlGraph {
    /// Build the graph. Structural errors are collected, never raised.
    pub fn build(ast: &RootNode) -> Self {
        let mut graph = Self::default();
        for pipeline in &ast.pipelines {
            graph.add_block(&pipeline.name, &pipeline.steps);
        }
        tracing::debug!(
            nodes = graph.graph.node_count(),
            edges = graph.graph.edge_count(),
            errors = graph.errors.len(),
            "control graph built"
        );
        graph
    }

    fn node(&mut self, name: &str) -> NodeIndex {
        if let Some(&idx) = self.index.get(name) {
            return idx;
        }
        let idx = self.graph.add_node(name.to_string());
        self.index.insert(name.to_string(), idx);
        idx
    }

    fn report(&mut self, error: GraphError) {
        self.errors.push(error.to_string());
    }

    fn add_block(&mut self, scope: &str, steps: &[StepNode]) {
        let mut seen = HashSet::new();
        let nodes: Vec<NodeIndex> = steps
            .iter()
            .map(|step| {
                if !seen.insert(step.name.as_str()) {
                    self.report(GraphError::DuplicateStep {
                        scope: scope.to_string(),
                        step: step.name.clone(),
                    });
                }
                self.node(&qualify(scope, &step.name))
            })
            .collect();

        for (i, step) in steps.iter().enumerate() {
            if let Some(&next) = nodes.get(i + 1) {
                self.graph.add_edge(nodes[i], next, EdgeKind::Sequence);
            }

            if let StepKind::Jump(jump) = &step.kind {
                match steps.iter().position(|s| s.name == jump.target) {
                    Some(target) => {
                        self.graph.add_edge(nodes[i], nodes[target], EdgeKind::Jump);
                    }
                    None => self.report(GraphError::UnknownJumpTarget {
                        scope: scope.to_string(),
                        step: step.name.clone(),
                        target: jump.target.clone(),
                    }),
                }
            }

            if !step.steps.is_empty() {
                let inner_scope = qualify(scope, &step.name);
                let first = self.node(&qualify(&inner_scope, &step.steps[0].name));
                self.graph.add_edge(nodes[i], first, EdgeKind::Body);
                self.add_block(&inner_scope, &step.steps);
            }
        }
    }

    /// Structural errors (duplicates, unknown jump targets) as display strings.
    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    fn sorted_successors(&self, idx: NodeIndex) -> Vec<NodeIndex> {
        let mut next: Vec<NodeIndex> = self.graph.neighbors(idx).collect();
        next.sort();
        next.dedup();
        next
    }

    /// Successors of a qualified node, in insertion order.
    pub fn successors(&self, name: &str) -> Vec<&str> {
        self.index
            .get(name)
            .map(|&idx| {
                self.sorted_successors(idx)
                    .into_iter()
                    .map(|n| self.graph[n].as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The adjacency list, nodes in insertion order.
    pub fn adjacency(&self) -> Vec<(&str, Vec<&str>)> {
        self.graph
            .node_indices()
            .map(|idx| {
                let name = self.graph[idx].as_str();
                (name, self.successors(name))
            })
            .collect()
    }

    /// Every cycle found by a depth-first search with a recursion stack.
    ///
    /// Each cycle is the path slice from the revisited node back to itself,
    /// e.g. `["p::a", "p::b", "p::a"]`.
    pub fn detect_cycles(&self) -> Vec<Vec<String>> {
        let mut visited = HashSet::new();
        let mut stack = Vec::new();
        let mut cycles = Vec::new();
        for idx in self.graph.node_indices() {
            if !visited.contains(&idx) {
                self.dfs(idx, &mut visited, &mut stack, &mut cycles);
            }
        }
        cycles
    }

    fn dfs(
        &self,
        idx: NodeIndex,
        visited: &mut HashSet<NodeIndex>,
        stack: &mut Vec<NodeIndex>,
        cycles: &mut Vec<Vec<String>>,
    ) {
        visited.insert(idx);
        stack.push(idx);
        for next in self.sorted_successors(idx) {
            if let Some(pos) = stack.iter().position(|&n| n == next) {
                let mut cycle: Vec<String> =
                    stack[pos..].iter().map(|&n| self.graph[n].clone()).collect();
                cycle.push(self.graph[next].clone());
                cycles.push(cycle);
            } else if !visited.contains(&next) {
                self.dfs(next, visited, stack, cycles);
            }
        }
        stack.pop();
    }

    /// Cycles whose nodes belong to `pipeline`.
    pub fn cycles_in(&self, pipeline: &str) -> Vec<Vec<String>> {
        let prefix = format!("{pipeline}{SCOPE_SEPARATOR}");
        self.detect_cycles()
            .into_iter()
            .filter(|cycle| cycle.first().is_some_and(|n| n.starts_with(&prefix)))
            .collect()
    }
}

/// Qualify `name` with its enclosing scope.
pub fn qualify(scope: &str, name: &str) -> String {
    format!("{scope}{SCOPE_SEPARATOR}{name}")
}
