//! The governed context store and its collaborators.
//!
//! [`ContextService`] composes a [`PermissionManager`], a
//! [`ContextValidator`], an [`AuditLogger`], a [`PersistenceManager`] and an
//! optional [`BinaryStorageBackend`]. Storage ports are defined here;
//! filesystem adapters live in `pipewright-infra`.

pub mod audit;
pub mod permissions;
pub mod persistence;
pub mod service;
pub mod validator;

pub use audit::{AuditLogger, AuditSink};
pub use permissions::PermissionManager;
pub use persistence::{
    BinaryStorageBackend, MemoryBackend, MemoryBinaryStorage, PersistenceBackend,
    PersistenceManager,
};
pub use service::{ContextService, SetOptions};
pub use validator::ContextValidator;
