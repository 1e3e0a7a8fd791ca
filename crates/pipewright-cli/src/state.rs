//! Application state wiring the context store to its infra adapters.

use std::sync::Arc;

use anyhow::{Context, Result};

use pipewright_core::context::{AuditLogger, ContextService, PermissionManager};
use pipewright_infra::audit::JsonlAuditSink;
use pipewright_infra::storage::{FilesystemBackend, FilesystemBinaryStorage};
use pipewright_types::config::EngineConfig;

/// Services shared by the commands that execute pipelines.
#[derive(Clone)]
pub struct AppState {
    pub config: EngineConfig,
    pub context_service: Arc<ContextService>,
}

impl AppState {
    /// Build the context store from configuration: permission policies,
    /// audit ring plus optional JSONL sink, filesystem persistence and
    /// binary storage.
    pub fn init(config: EngineConfig) -> Result<Self> {
        let permissions = PermissionManager::from_config(&config.permissions)
            .context("Invalid permission policy")?;

        let mut audit = AuditLogger::new(config.audit.max_entries);
        if let Some(path) = &config.audit.log_path {
            let sink = JsonlAuditSink::open(path)
                .with_context(|| format!("Failed to open audit log {}", path.display()))?;
            audit = audit.with_sink(Box::new(sink));
        }

        let storage = &config.storage;
        let context_service = ContextService::new()
            .with_permissions(permissions)
            .with_audit(audit)
            .with_persistence(Box::new(FilesystemBackend::new(&storage.base_path)))
            .with_binary_storage(Box::new(
                FilesystemBinaryStorage::new(&storage.binary_path)
                    .with_chunk_size(storage.chunk_size_bytes),
            ))
            .with_inline_threshold(storage.inline_threshold_bytes);

        tracing::debug!(
            base_path = %storage.base_path.display(),
            binary_path = %storage.binary_path.display(),
            permissions = config.permissions.enabled,
            "context store initialized"
        );

        Ok(Self {
            config,
            context_service: Arc::new(context_service),
        })
    }
}
