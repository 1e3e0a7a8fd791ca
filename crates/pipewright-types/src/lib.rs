//! Shared domain types for Pipewright.
//!
//! This crate contains the types every other crate agrees on: the pipeline
//! AST, the execution-state tree, context store records (paths, snapshots,
//! metrics, binary descriptors), access policies, audit entries, engine
//! configuration, and the error enums that cross crate boundaries.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod audit;
pub mod binary;
pub mod config;
pub mod context;
pub mod error;
pub mod execution;
pub mod pipeline;
pub mod policy;
