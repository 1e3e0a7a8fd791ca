//! Append-only audit trail for context operations.
//!
//! Entries are kept in a bounded in-memory ring for queries and, when a sink
//! is attached, forwarded to it (the infra crate provides a JSONL file sink).
//! Sink failures are logged and never fail the audited operation.

use std::collections::VecDeque;
use std::sync::Mutex;

use pipewright_types::audit::{AuditEntry, AuditQuery};

/// Durable destination for audit entries.
pub trait AuditSink: Send + Sync {
    fn append(&self, entry: &AuditEntry) -> std::io::Result<()>;
}

/// Thread-safe audit logger.
pub struct AuditLogger {
    max_entries: usize,
    entries: Mutex<VecDeque<AuditEntry>>,
    sink: Option<Box<dyn AuditSink>>,
}

impl AuditLogger {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries: max_entries.max(1),
            entries: Mutex::new(VecDeque::new()),
            sink: None,
        }
    }

    pub fn with_sink(mut self, sink: Box<dyn AuditSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Record one entry.
    pub fn log(&self, entry: AuditEntry) {
        tracing::debug!(
            operation = %entry.operation,
            entity_type = %entry.entity_type,
            entity_id = %entry.entity_id,
            actor = %entry.actor,
            "audit"
        );

        if let Some(sink) = &self.sink {
            if let Err(e) = sink.append(&entry) {
                tracing::error!(error = %e, entity_id = %entry.entity_id, "failed to write audit entry");
            }
        }

        let mut entries = self.entries.lock().expect("audit lock poisoned");
        if entries.len() == self.max_entries {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Entries matching `query`, oldest first. `limit` keeps the newest matches.
    pub fn query(&self, query: &AuditQuery) -> Vec<AuditEntry> {
        let entries = self.entries.lock().expect("audit lock poisoned");
        let mut matched: Vec<AuditEntry> = entries
            .iter()
            .filter(|e| query.matches(e))
            .cloned()
            .collect();
        if let Some(limit) = query.limit {
            let excess = matched.len().saturating_sub(limit);
            matched.drain(..excess);
        }
        matched
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("audit lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for AuditLogger {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl std::fmt::Debug for AuditLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLogger")
            .field("max_entries", &self.max_entries)
            .field("len", &self.len())
            .field("has_sink", &self.sink.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use serde_json::json;

    struct RecordingSink(Arc<Mutex<Vec<String>>>);

    impl AuditSink for RecordingSink {
        fn append(&self, entry: &AuditEntry) -> std::io::Result<()> {
            self.0.lock().unwrap().push(entry.entity_id.clone());
            Ok(())
        }
    }

    struct FailingSink;

    impl AuditSink for FailingSink {
        fn append(&self, _entry: &AuditEntry) -> std::io::Result<()> {
            Err(std::io::Error::other("disk full"))
        }
    }

    #[test]
    fn test_log_and_query_by_operation() {
        let logger = AuditLogger::new(100);
        logger.log(AuditEntry::new("create", "context", "jobs.a", "pipeline"));
        logger.log(
            AuditEntry::new("update", "context", "jobs.a", "pipeline")
                .with_values(Some(json!(1)), Some(json!(2))),
        );
        logger.log(AuditEntry::new("read", "context", "jobs.b", "web"));

        let updates = logger.query(&AuditQuery {
            operation: Some("update".to_string()),
            ..Default::default()
        });
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].old_value, Some(json!(1)));
        assert_eq!(updates[0].new_value, Some(json!(2)));

        let by_web = logger.query(&AuditQuery {
            actor: Some("web".to_string()),
            ..Default::default()
        });
        assert_eq!(by_web.len(), 1);
        assert_eq!(by_web[0].entity_id, "jobs.b");
    }

    #[test]
    fn test_ring_buffer_drops_oldest() {
        let logger = AuditLogger::new(2);
        for i in 0..3 {
            logger.log(AuditEntry::new("create", "context", &format!("ns.k{i}"), "a"));
        }
        let all = logger.query(&AuditQuery::default());
        let ids: Vec<_> = all.iter().map(|e| e.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["ns.k1", "ns.k2"]);
    }

    #[test]
    fn test_limit_keeps_newest() {
        let logger = AuditLogger::new(10);
        for i in 0..5 {
            logger.log(AuditEntry::new("read", "context", &format!("ns.k{i}"), "a"));
        }
        let last_two = logger.query(&AuditQuery {
            limit: Some(2),
            ..Default::default()
        });
        assert_eq!(last_two.len(), 2);
        assert_eq!(last_two[1].entity_id, "ns.k4");
    }

    #[test]
    fn test_sink_receives_entries() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let logger = AuditLogger::new(10).with_sink(Box::new(RecordingSink(seen.clone())));
        logger.log(AuditEntry::new("delete", "namespace", "jobs", "a"));
        assert_eq!(*seen.lock().unwrap(), vec!["jobs".to_string()]);
    }

    #[test]
    fn test_sink_failure_does_not_lose_entry() {
        let logger = AuditLogger::new(10).with_sink(Box::new(FailingSink));
        logger.log(AuditEntry::new("create", "context", "ns.k", "a"));
        assert_eq!(logger.len(), 1);
    }
}
