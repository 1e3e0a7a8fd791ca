//! Engine configuration types for Pipewright.
//!
//! `EngineConfig` is the top-level `pipewright.toml`. Every section and field
//! has a default so a missing or partial file still yields a usable engine.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::policy::Policy;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub storage: StorageConfig,
    pub permissions: PermissionsConfig,
    pub audit: AuditConfig,
    pub executor: ExecutorConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory for JSON persistence (`<base_path>/<namespace>/<key>.json`).
    pub base_path: PathBuf,
    /// Root directory for binary objects (`<binary_path>/<namespace>/<key>`).
    pub binary_path: PathBuf,
    /// Payloads smaller than this are stored inline as base64.
    pub inline_threshold_bytes: usize,
    /// Read/write chunk size when streaming binary objects.
    pub chunk_size_bytes: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("./data/context"),
            binary_path: PathBuf::from("./data/binary"),
            inline_threshold_bytes: 64 * 1024,
            chunk_size_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionsConfig {
    /// When false every check passes.
    pub enabled: bool,
    pub policies: Vec<Policy>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Optional JSONL file every entry is appended to.
    pub log_path: Option<PathBuf>,
    /// Size of the in-memory entry buffer used by queries.
    pub max_entries: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            log_path: None,
            max_entries: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Upper bound on jumps taken during one pipeline run.
    pub max_jumps: u32,
    /// Role the executor uses for context store access.
    pub actor: String,
    /// Refuse to run pipelines whose control graph contains a cycle.
    pub reject_cycles: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_jumps: 1000,
            actor: "pipeline".to_string(),
            reject_cycles: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{Action, PolicyEffect};

    #[test]
    fn test_default_values() {
        let config = EngineConfig::default();
        assert_eq!(config.storage.inline_threshold_bytes, 65_536);
        assert_eq!(config.executor.max_jumps, 1000);
        assert_eq!(config.executor.actor, "pipeline");
        assert!(!config.permissions.enabled);
        assert!(config.audit.log_path.is_none());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_deserialize_empty_uses_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config.audit.max_entries, 10_000);
        assert!(config.permissions.policies.is_empty());
    }

    #[test]
    fn test_deserialize_partial_sections() {
        let toml_str = r#"
[storage]
base_path = "/var/lib/pipewright"

[permissions]
enabled = true

[[permissions.policies]]
role = "pipeline"
resource_pattern = "jobs\\..*"
actions = ["read", "write"]
effect = "allow"

[executor]
max_jumps = 5
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.storage.base_path, PathBuf::from("/var/lib/pipewright"));
        assert_eq!(config.storage.chunk_size_bytes, 65_536);
        assert!(config.permissions.enabled);
        assert_eq!(config.permissions.policies.len(), 1);
        assert_eq!(config.permissions.policies[0].actions, vec![Action::Read, Action::Write]);
        assert_eq!(config.permissions.policies[0].effect, PolicyEffect::Allow);
        assert_eq!(config.executor.max_jumps, 5);
        assert_eq!(config.executor.actor, "pipeline");
    }
}
