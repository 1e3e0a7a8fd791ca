//! Context store types for Pipewright.
//!
//! These types model the namespaced key/value context, its snapshots and
//! per-key performance counters, and the actor identity every access is
//! checked against.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Role used when no explicit actor is configured.
pub const SYSTEM_ROLE: &str = "system";

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

/// Who is performing a context operation.
///
/// `bypass` skips the permission check; the operation is still audited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub role: String,
    #[serde(default)]
    pub bypass: bool,
}

impl Actor {
    /// An actor whose access is checked against the policy set.
    pub fn new(role: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            bypass: false,
        }
    }

    /// The internal system actor. Never permission-checked.
    pub fn system() -> Self {
        Self {
            role: SYSTEM_ROLE.to_string(),
            bypass: true,
        }
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.role)
    }
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

/// A `"namespace.key"` address into the context store.
///
/// The namespace is everything before the first dot; the key is the rest
/// and may itself contain dots.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextPath {
    pub namespace: String,
    pub key: String,
}

impl ContextPath {
    /// Parse `"namespace.key"`. Returns `None` if either part is empty.
    pub fn parse(path: &str) -> Option<Self> {
        let (namespace, key) = path.split_once('.')?;
        if namespace.is_empty() || key.is_empty() {
            return None;
        }
        Some(Self {
            namespace: namespace.to_string(),
            key: key.to_string(),
        })
    }

    /// The permission resource string for this path.
    pub fn resource(&self) -> String {
        format!("{}.{}", self.namespace, self.key)
    }
}

impl fmt::Display for ContextPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.namespace, self.key)
    }
}

// ---------------------------------------------------------------------------
// Merge
// ---------------------------------------------------------------------------

/// How `merge_context` resolves keys present on both sides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Incoming value replaces the stored one; the stored one is reported.
    #[default]
    Overwrite,
    /// Stored value is kept; the incoming one is reported.
    Keep,
    /// Object values are merged one level deep; anything else overwrites.
    Merge,
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

/// An immutable copy of one namespace's state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: u64,
    pub namespace: String,
    pub state: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Observational counters for a single key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyMetrics {
    pub access_count: u64,
    pub size_bytes: usize,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

impl KeyMetrics {
    pub fn new(size_bytes: usize) -> Self {
        let now = Utc::now();
        Self {
            access_count: 0,
            size_bytes,
            created_at: now,
            last_accessed: now,
            last_modified: now,
        }
    }
}

/// Observational counters for a namespace and each of its keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceMetrics {
    pub access_count: u64,
    pub size_bytes: usize,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub keys: HashMap<String, KeyMetrics>,
}

impl NamespaceMetrics {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            access_count: 0,
            size_bytes: 0,
            created_at: now,
            last_accessed: now,
            keys: HashMap::new(),
        }
    }
}

impl Default for NamespaceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_path_splits_on_first_dot() {
        let path = ContextPath::parse("jobs.status.detail").unwrap();
        assert_eq!(path.namespace, "jobs");
        assert_eq!(path.key, "status.detail");
        assert_eq!(path.resource(), "jobs.status.detail");
    }

    #[test]
    fn test_context_path_rejects_missing_parts() {
        assert!(ContextPath::parse("jobs").is_none());
        assert!(ContextPath::parse(".status").is_none());
        assert!(ContextPath::parse("jobs.").is_none());
    }

    #[test]
    fn test_system_actor_bypasses() {
        let actor = Actor::system();
        assert!(actor.bypass);
        assert_eq!(actor.role, SYSTEM_ROLE);
        assert!(!Actor::new("pipeline").bypass);
    }

    #[test]
    fn test_merge_strategy_defaults_to_overwrite() {
        assert_eq!(MergeStrategy::default(), MergeStrategy::Overwrite);
        let parsed: MergeStrategy = serde_json::from_str("\"merge\"").unwrap();
        assert_eq!(parsed, MergeStrategy::Merge);
    }
}
