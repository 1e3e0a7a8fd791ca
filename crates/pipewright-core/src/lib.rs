//! Core engine for Pipewright.
//!
//! Holds the pipeline parser, control graph, expression evaluator and
//! stateful executor, plus the context store service with its permission,
//! audit, validation and persistence layers. Storage backends that touch
//! the filesystem live in `pipewright-infra`; this crate only defines the
//! traits they implement and in-memory versions for tests.

pub mod context;
pub mod pipeline;
