//! Pipeline definition, analysis and execution.
//!
//! - [`parser`] turns YAML into a validated [`RootNode`](pipewright_types::pipeline::RootNode).
//! - [`graph`] builds the control graph and finds cycles.
//! - [`expression`] evaluates conditions, iterate sources and `${ }` templates.
//! - [`executor`] runs pipelines against the context store.
//! - [`plugin`] is the contract plugin implementations fulfil.

pub mod executor;
pub mod expression;
pub mod graph;
pub mod parser;
pub mod plugin;

pub use executor::{ExecutionError, LoopFrame, StatefulExecutor};
pub use expression::{ExpressionError, ExpressionEvaluator};
pub use graph::{ControlGraph, GraphError};
pub use parser::{ParseError, PipelineParser};
pub use plugin::{Plugin, PluginError, PluginManager, PluginRegistry};
