//! Infrastructure layer for Pipewright.
//!
//! Contains implementations of the storage ports defined in `pipewright-core`:
//! filesystem JSON persistence, chunked binary object storage, and the JSONL
//! audit sink. Also loads the engine configuration from TOML.

pub mod audit;
pub mod config;
pub mod storage;
