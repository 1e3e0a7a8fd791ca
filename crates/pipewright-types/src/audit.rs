//! Audit trail types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// One append-only audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g. `"create"`, `"update"`, `"read"`, `"delete"`, `"snapshot"`.
    pub operation: String,
    /// e.g. `"context"`, `"namespace"`, `"snapshot"`, `"storage"`.
    pub entity_type: String,
    pub entity_id: String,
    pub actor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl AuditEntry {
    pub fn new(operation: &str, entity_type: &str, entity_id: &str, actor: &str) -> Self {
        Self {
            id: Uuid::now_v7(),
            timestamp: Utc::now(),
            operation: operation.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            actor: actor.to_string(),
            old_value: None,
            new_value: None,
            metadata: Map::new(),
        }
    }

    pub fn with_values(mut self, old_value: Option<Value>, new_value: Option<Value>) -> Self {
        self.old_value = old_value;
        self.new_value = new_value;
        self
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// Filter for reading back audit entries. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub operation: Option<String>,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub actor: Option<String>,
    pub since: Option<DateTime<Utc>>,
    /// Keep only the newest `limit` matches.
    pub limit: Option<usize>,
}

impl AuditQuery {
    pub fn matches(&self, entry: &AuditEntry) -> bool {
        fn field_matches(filter: &Option<String>, value: &str) -> bool {
            filter.as_deref().is_none_or(|f| f == value)
        }

        field_matches(&self.operation, &entry.operation)
            && field_matches(&self.entity_type, &entry.entity_type)
            && field_matches(&self.entity_id, &entry.entity_id)
            && field_matches(&self.actor, &entry.actor)
            && self.since.is_none_or(|since| entry.timestamp >= since)
    }
}
