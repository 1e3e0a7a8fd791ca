//! The context store: a namespaced, access-controlled, audited key/value
//! space shared by pipeline steps and plugins.
//!
//! All namespace data and metrics sit behind one mutex; snapshot history
//! sits behind a second. The two are never held at the same time.
//! Permission checks and audit writes happen outside both locks.

use std::collections::{BTreeMap, HashMap};
use std::io::{Cursor, Read};
use std::sync::Mutex;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use pipewright_types::audit::AuditEntry;
use pipewright_types::binary::{BinaryDescriptor, BinaryMetadata, DataLocation, StorageReference};
use pipewright_types::context::{Actor, MergeStrategy, NamespaceMetrics, KeyMetrics, Snapshot};
use pipewright_types::error::{ContextError, StorageBackendError};
use pipewright_types::policy::Action;
use serde_json::{Map, Value, json};

use super::audit::AuditLogger;
use super::permissions::PermissionManager;
use super::persistence::{BinaryStorageBackend, PersistenceBackend, PersistenceManager};
use super::validator::ContextValidator;

/// Default size below which binary payloads are stored inline.
pub const DEFAULT_INLINE_THRESHOLD: usize = 64 * 1024;

/// Options for [`ContextService::set_context`].
#[derive(Debug, Clone)]
pub struct SetOptions {
    /// Replace an existing value. When false an existing key is left alone.
    pub overwrite: bool,
    /// Validate the value against this registered schema first.
    pub schema_id: Option<String>,
}

impl Default for SetOptions {
    fn default() -> Self {
        Self {
            overwrite: true,
            schema_id: None,
        }
    }
}

impl SetOptions {
    pub fn no_overwrite() -> Self {
        Self {
            overwrite: false,
            ..Self::default()
        }
    }

    pub fn with_schema(schema_id: impl Into<String>) -> Self {
        Self {
            schema_id: Some(schema_id.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Default)]
struct StoreState {
    data: BTreeMap<String, Map<String, Value>>,
    metrics: HashMap<String, NamespaceMetrics>,
}

impl StoreState {
    fn record_write(&mut self, namespace: &str, key: &str, value: &Value) {
        let size = value_size(value);
        let now = Utc::now();
        let ns = self.metrics.entry(namespace.to_string()).or_default();
        let entry = ns
            .keys
            .entry(key.to_string())
            .or_insert_with(|| KeyMetrics::new(size));
        entry.size_bytes = size;
        entry.last_modified = now;
        entry.access_count += 1;
        ns.access_count += 1;
        ns.last_accessed = now;
        ns.size_bytes = ns.keys.values().map(|k| k.size_bytes).sum();
    }

    fn record_read(&mut self, namespace: &str, key: Option<&str>) {
        let now = Utc::now();
        let Some(ns) = self.metrics.get_mut(namespace) else {
            return;
        };
        ns.access_count += 1;
        ns.last_accessed = now;
        if let Some(entry) = key.and_then(|k| ns.keys.get_mut(k)) {
            entry.access_count += 1;
            entry.last_accessed = now;
        }
    }

    fn remove_key_metrics(&mut self, namespace: &str, key: &str) {
        if let Some(ns) = self.metrics.get_mut(namespace) {
            ns.keys.remove(key);
            ns.size_bytes = ns.keys.values().map(|k| k.size_bytes).sum();
        }
    }

    /// Replace a namespace wholesale, rebuilding its metrics.
    fn replace_namespace(&mut self, namespace: &str, values: Map<String, Value>) {
        self.metrics.remove(namespace);
        for (key, value) in &values {
            self.record_write(namespace, key, value);
        }
        self.data.insert(namespace.to_string(), values);
    }
}

fn value_size(value: &Value) -> usize {
    serde_json::to_vec(value).map(|v| v.len()).unwrap_or(0)
}

fn namespace_resource(namespace: &str) -> String {
    format!("{namespace}.*")
}

fn referenced_object(value: &Value) -> Option<StorageReference> {
    if !BinaryDescriptor::is_descriptor(value) {
        return None;
    }
    serde_json::from_value::<BinaryDescriptor>(value.clone())
        .ok()
        .filter(|d| d.data_location == DataLocation::Referenced)
        .and_then(|d| d.storage_reference)
}

/// Namespaced key/value store with permissions, validation, audit,
/// snapshots, binary payloads and durable persistence.
pub struct ContextService {
    state: Mutex<StoreState>,
    history: Mutex<BTreeMap<u64, Snapshot>>,
    permissions: PermissionManager,
    validator: ContextValidator,
    audit: AuditLogger,
    persistence: Option<PersistenceManager>,
    binary_storage: Option<Box<dyn BinaryStorageBackend>>,
    inline_threshold: usize,
}

impl Default for ContextService {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextService {
    /// A store with permissions disabled and no durable backends.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            history: Mutex::new(BTreeMap::new()),
            permissions: PermissionManager::disabled(),
            validator: ContextValidator::new(),
            audit: AuditLogger::default(),
            persistence: None,
            binary_storage: None,
            inline_threshold: DEFAULT_INLINE_THRESHOLD,
        }
    }

    pub fn with_permissions(mut self, permissions: PermissionManager) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn with_validator(mut self, validator: ContextValidator) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_audit(mut self, audit: AuditLogger) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_persistence(mut self, backend: Box<dyn PersistenceBackend>) -> Self {
        self.persistence = Some(PersistenceManager::new(backend));
        self
    }

    pub fn with_binary_storage(mut self, storage: Box<dyn BinaryStorageBackend>) -> Self {
        self.binary_storage = Some(storage);
        self
    }

    pub fn with_inline_threshold(mut self, bytes: usize) -> Self {
        self.inline_threshold = bytes;
        self
    }

    pub fn permissions(&self) -> &PermissionManager {
        &self.permissions
    }

    pub fn validator(&self) -> &ContextValidator {
        &self.validator
    }

    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    fn lock_state(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.state.lock().expect("context state lock poisoned")
    }

    fn lock_history(&self) -> std::sync::MutexGuard<'_, BTreeMap<u64, Snapshot>> {
        self.history.lock().expect("snapshot history lock poisoned")
    }

    /// Check access for `actor`, auditing a denial before returning it.
    fn authorize(
        &self,
        actor: &Actor,
        operation: &str,
        resource: &str,
        action: Action,
    ) -> Result<(), ContextError> {
        if actor.bypass {
            return Ok(());
        }
        self.permissions
            .require_permission(&actor.role, resource, action)
            .map_err(|e| {
                self.audit.log(
                    AuditEntry::new(operation, "context", resource, &actor.role)
                        .with_meta("denied", true)
                        .with_meta("action", action.to_string()),
                );
                ContextError::from(e)
            })
    }

    fn persistence(&self) -> Result<&PersistenceManager, ContextError> {
        self.persistence
            .as_ref()
            .ok_or(ContextError::BackendUnavailable("persistence"))
    }

    fn binary_storage(&self) -> Result<&dyn BinaryStorageBackend, ContextError> {
        self.binary_storage
            .as_deref()
            .ok_or(ContextError::BackendUnavailable("binary storage"))
    }

    /// Store `value` without permission or schema checks. Returns the old value
    /// and whether the write happened.
    fn write_value(
        &self,
        namespace: &str,
        key: &str,
        value: &Value,
        overwrite: bool,
    ) -> (Option<Value>, bool) {
        let mut state = self.lock_state();
        let old = state
            .data
            .get(namespace)
            .and_then(|ns| ns.get(key))
            .cloned();
        if old.is_some() && !overwrite {
            return (old, false);
        }
        state
            .data
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value.clone());
        state.record_write(namespace, key, value);
        (old, true)
    }

    fn delete_objects(&self, references: Vec<StorageReference>) -> Result<(), ContextError> {
        if references.is_empty() {
            return Ok(());
        }
        let storage = self.binary_storage()?;
        for reference in references {
            storage.delete(&reference.namespace, &reference.key)?;
            tracing::debug!(
                namespace = %reference.namespace,
                key = %reference.key,
                "deleted referenced binary object"
            );
        }
        Ok(())
    }

    /// Delete the object `old` referenced when `new` no longer references it.
    /// The write that replaced `old` has already succeeded, so failures are
    /// logged rather than returned.
    fn release_replaced(&self, old: Option<&Value>, new: &Value) {
        let Some(reference) = old.and_then(referenced_object) else {
            return;
        };
        if referenced_object(new).as_ref() == Some(&reference) {
            return;
        }
        if let Err(e) = self.delete_objects(vec![reference.clone()]) {
            tracing::warn!(
                namespace = %reference.namespace,
                key = %reference.key,
                error = %e,
                "failed to release replaced binary object"
            );
        }
    }

    /// Record a failed operation. Permission denials are already audited by
    /// [`Self::authorize`].
    fn audit_failure(
        &self,
        operation: &str,
        entity_type: &str,
        resource: &str,
        actor: &Actor,
        error: &ContextError,
    ) {
        if matches!(error, ContextError::PermissionDenied(_)) {
            return;
        }
        tracing::debug!(operation, resource, error = %error, "context operation failed");
        self.audit.log(
            AuditEntry::new(operation, entity_type, resource, &actor.role)
                .with_meta("success", false)
                .with_meta("error", error.to_string()),
        );
    }

    /// Resolve the persistence backend, auditing its absence.
    fn persistence_for(
        &self,
        operation: &str,
        resource: &str,
        actor: &Actor,
    ) -> Result<&PersistenceManager, ContextError> {
        self.persistence().inspect_err(|e| {
            self.audit_failure(operation, "storage", resource, actor, e);
        })
    }

    // -----------------------------------------------------------------------
    // Key/value CRUD
    // -----------------------------------------------------------------------

    /// Store a value. Returns `false` when `overwrite` is off and the key exists.
    pub fn set_context(
        &self,
        actor: &Actor,
        namespace: &str,
        key: &str,
        value: Value,
        options: SetOptions,
    ) -> Result<bool, ContextError> {
        let resource = format!("{namespace}.{key}");
        self.authorize(actor, "set", &resource, Action::Write)?;

        if let Some(schema_id) = &options.schema_id {
            if let Err(e) = self.validator.validate_context(&value, schema_id) {
                self.audit.log(
                    AuditEntry::new("set", "context", &resource, &actor.role)
                        .with_values(None, Some(value))
                        .with_meta("schema_id", schema_id.as_str())
                        .with_meta("success", false)
                        .with_meta("error", e.to_string()),
                );
                return Err(e.into());
            }
        }

        let (old, written) = self.write_value(namespace, key, &value, options.overwrite);
        if !written {
            tracing::debug!(namespace, key, "key exists and overwrite is off");
            self.audit.log(
                AuditEntry::new("set", "context", &resource, &actor.role)
                    .with_values(old, Some(value))
                    .with_meta("skipped", true),
            );
            return Ok(false);
        }

        self.release_replaced(old.as_ref(), &value);
        let operation = if old.is_some() { "update" } else { "create" };
        tracing::debug!(namespace, key, operation, "context value stored");
        self.audit.log(
            AuditEntry::new(operation, "context", &resource, &actor.role)
                .with_values(old, Some(value)),
        );
        Ok(true)
    }

    pub fn get_context(
        &self,
        actor: &Actor,
        namespace: &str,
        key: &str,
    ) -> Result<Option<Value>, ContextError> {
        let resource = format!("{namespace}.{key}");
        self.authorize(actor, "read", &resource, Action::Read)?;

        let value = {
            let mut state = self.lock_state();
            let value = state
                .data
                .get(namespace)
                .and_then(|ns| ns.get(key))
                .cloned();
            if value.is_some() {
                state.record_read(namespace, Some(key));
            }
            value
        };

        self.audit.log(
            AuditEntry::new("read", "context", &resource, &actor.role)
                .with_meta("exists", value.is_some()),
        );
        Ok(value)
    }

    /// Every key/value pair of a namespace.
    pub fn get_namespace(
        &self,
        actor: &Actor,
        namespace: &str,
    ) -> Result<Option<Map<String, Value>>, ContextError> {
        self.authorize(actor, "read", &namespace_resource(namespace), Action::Read)?;

        let values = {
            let mut state = self.lock_state();
            let values = state.data.get(namespace).cloned();
            if values.is_some() {
                state.record_read(namespace, None);
            }
            values
        };

        self.audit.log(
            AuditEntry::new("read", "namespace", namespace, &actor.role)
                .with_meta("exists", values.is_some()),
        );
        Ok(values)
    }

    /// Delete one key, or with `key = None` the whole namespace and its
    /// metrics. Referenced binary objects held by removed values are deleted
    /// from binary storage too.
    pub fn delete_context(
        &self,
        actor: &Actor,
        namespace: &str,
        key: Option<&str>,
    ) -> Result<bool, ContextError> {
        let (resource, entity_type) = match key {
            Some(key) => (format!("{namespace}.{key}"), "context"),
            None => (namespace_resource(namespace), "namespace"),
        };
        self.authorize(actor, "delete", &resource, Action::Delete)?;

        let removed: Option<Value> = {
            let mut state = self.lock_state();
            match key {
                Some(key) => {
                    let removed = state
                        .data
                        .get_mut(namespace)
                        .and_then(|ns| ns.remove(key));
                    if removed.is_some() {
                        state.remove_key_metrics(namespace, key);
                    }
                    removed
                }
                None => {
                    state.metrics.remove(namespace);
                    state.data.remove(namespace).map(Value::Object)
                }
            }
        };

        let existed = removed.is_some();
        let references: Vec<StorageReference> = match (&removed, key) {
            (Some(Value::Object(values)), None) => values.values().filter_map(referenced_object).collect(),
            (Some(value), Some(_)) => referenced_object(value).into_iter().collect(),
            _ => Vec::new(),
        };

        tracing::debug!(namespace, key, existed, "context delete");
        self.audit.log(
            AuditEntry::new("delete", entity_type, &resource, &actor.role)
                .with_values(removed, None)
                .with_meta("exists", existed),
        );

        self.delete_objects(references)?;
        Ok(existed)
    }

    pub fn key_exists(&self, actor: &Actor, namespace: &str, key: &str) -> Result<bool, ContextError> {
        let resource = format!("{namespace}.{key}");
        self.authorize(actor, "exists", &resource, Action::Read)?;
        let exists = self
            .lock_state()
            .data
            .get(namespace)
            .is_some_and(|ns| ns.contains_key(key));
        self.audit.log(
            AuditEntry::new("exists", "context", &resource, &actor.role).with_meta("exists", exists),
        );
        Ok(exists)
    }

    /// Append `value` to the list at namespace/key, creating the list when
    /// absent. Returns the new length.
    pub fn append_context(
        &self,
        actor: &Actor,
        namespace: &str,
        key: &str,
        value: Value,
    ) -> Result<usize, ContextError> {
        let resource = format!("{namespace}.{key}");
        self.authorize(actor, "append", &resource, Action::Write)?;

        let appended = {
            let mut state = self.lock_state();
            let old = state
                .data
                .get(namespace)
                .and_then(|ns| ns.get(key))
                .cloned();
            match &old {
                Some(existing) if !existing.is_array() => Err(ContextError::NotAList {
                    namespace: namespace.to_string(),
                    key: key.to_string(),
                }),
                _ => {
                    let mut list = match &old {
                        Some(Value::Array(items)) => items.clone(),
                        _ => Vec::new(),
                    };
                    list.push(value);
                    let new = Value::Array(list);
                    state
                        .data
                        .entry(namespace.to_string())
                        .or_default()
                        .insert(key.to_string(), new.clone());
                    state.record_write(namespace, key, &new);
                    Ok((old, new))
                }
            }
        };
        let (old, new) = appended.inspect_err(|e| {
            self.audit_failure("append", "context", &resource, actor, e);
        })?;

        let len = new.as_array().map_or(0, Vec::len);
        let operation = if old.is_some() { "update" } else { "create" };
        self.audit.log(
            AuditEntry::new(operation, "context", &resource, &actor.role)
                .with_values(old, Some(new))
                .with_meta("append", true),
        );
        Ok(len)
    }

    /// Merge `values` into a namespace. Returns the conflicting values that
    /// did not survive: the prior values for `overwrite` and `merge`, the
    /// rejected incoming values for `keep`.
    pub fn merge_context(
        &self,
        actor: &Actor,
        namespace: &str,
        values: Map<String, Value>,
        strategy: MergeStrategy,
    ) -> Result<Map<String, Value>, ContextError> {
        for key in values.keys() {
            self.authorize(actor, "merge", &format!("{namespace}.{key}"), Action::Write)?;
        }

        let mut conflicts = Map::new();
        let mut written = Vec::new();
        {
            let mut state = self.lock_state();
            let ns = state.data.entry(namespace.to_string()).or_default();
            for (key, incoming) in &values {
                let merged = match ns.get(key) {
                    None => incoming.clone(),
                    Some(existing) => match strategy {
                        MergeStrategy::Keep => {
                            conflicts.insert(key.clone(), incoming.clone());
                            continue;
                        }
                        MergeStrategy::Overwrite => {
                            conflicts.insert(key.clone(), existing.clone());
                            incoming.clone()
                        }
                        MergeStrategy::Merge => {
                            conflicts.insert(key.clone(), existing.clone());
                            match (existing, incoming) {
                                (Value::Object(current), Value::Object(update)) => {
                                    let mut merged = current.clone();
                                    merged.extend(update.clone());
                                    Value::Object(merged)
                                }
                                _ => incoming.clone(),
                            }
                        }
                    },
                };
                ns.insert(key.clone(), merged.clone());
                written.push((key.clone(), merged));
            }
            for (key, value) in &written {
                state.record_write(namespace, key, value);
            }
        }
        for (key, value) in &written {
            self.release_replaced(conflicts.get(key), value);
        }

        tracing::debug!(namespace, ?strategy, conflicts = conflicts.len(), "context merge");
        self.audit.log(
            AuditEntry::new("merge", "namespace", namespace, &actor.role)
                .with_values(Some(Value::Object(conflicts.clone())), Some(Value::Object(values)))
                .with_meta("strategy", json!(strategy)),
        );
        Ok(conflicts)
    }

    // -----------------------------------------------------------------------
    // Snapshots
    // -----------------------------------------------------------------------

    /// Copy a namespace into history. Ids start at 1 and only grow.
    pub fn snapshot_context(&self, actor: &Actor, namespace: &str) -> Result<u64, ContextError> {
        self.authorize(actor, "snapshot", &namespace_resource(namespace), Action::Read)?;

        let state = self
            .lock_state()
            .data
            .get(namespace)
            .cloned()
            .unwrap_or_default();

        let id = {
            let mut history = self.lock_history();
            let id = history.len() as u64 + 1;
            history.insert(
                id,
                Snapshot {
                    id,
                    namespace: namespace.to_string(),
                    state,
                    created_at: Utc::now(),
                },
            );
            id
        };

        tracing::info!(namespace, snapshot_id = id, "snapshot created");
        self.audit.log(
            AuditEntry::new("snapshot", "snapshot", &id.to_string(), &actor.role)
                .with_meta("namespace", namespace),
        );
        Ok(id)
    }

    /// Replace the snapshot's namespace with the captured state. Returns
    /// `false` for an unknown snapshot id.
    pub fn restore_context(&self, actor: &Actor, snapshot_id: u64) -> Result<bool, ContextError> {
        let Some(snapshot) = self.lock_history().get(&snapshot_id).cloned() else {
            tracing::warn!(snapshot_id, "restore of unknown snapshot");
            self.audit.log(
                AuditEntry::new("restore", "snapshot", &snapshot_id.to_string(), &actor.role)
                    .with_meta("found", false),
            );
            return Ok(false);
        };

        self.authorize(
            actor,
            "restore",
            &namespace_resource(&snapshot.namespace),
            Action::Write,
        )?;

        let previous = {
            let mut state = self.lock_state();
            let previous = state.data.get(&snapshot.namespace).cloned();
            state.replace_namespace(&snapshot.namespace, snapshot.state.clone());
            previous
        };

        tracing::info!(namespace = %snapshot.namespace, snapshot_id, "snapshot restored");
        self.audit.log(
            AuditEntry::new("restore", "snapshot", &snapshot_id.to_string(), &actor.role)
                .with_values(
                    previous.map(Value::Object),
                    Some(Value::Object(snapshot.state)),
                )
                .with_meta("namespace", snapshot.namespace)
                .with_meta("found", true),
        );
        Ok(true)
    }

    pub fn snapshot(&self, snapshot_id: u64) -> Option<Snapshot> {
        self.lock_history().get(&snapshot_id).cloned()
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    pub fn list_namespaces(&self) -> Vec<String> {
        self.lock_state().data.keys().cloned().collect()
    }

    pub fn list_keys(&self, actor: &Actor, namespace: &str) -> Result<Vec<String>, ContextError> {
        self.authorize(actor, "list", &namespace_resource(namespace), Action::Read)?;
        Ok(self
            .lock_state()
            .data
            .get(namespace)
            .map(|ns| ns.keys().cloned().collect())
            .unwrap_or_default())
    }

    pub fn get_metrics(&self, namespace: &str) -> Option<NamespaceMetrics> {
        self.lock_state().metrics.get(namespace).cloned()
    }

    // -----------------------------------------------------------------------
    // Binary payloads
    // -----------------------------------------------------------------------

    /// Store a binary payload and record its descriptor under namespace/key.
    ///
    /// Payloads shorter than the inline threshold are kept inline as base64;
    /// anything larger is streamed to the binary storage backend without
    /// being buffered whole.
    pub fn save_binary_data(
        &self,
        actor: &Actor,
        namespace: &str,
        key: &str,
        reader: &mut dyn Read,
        metadata: BinaryMetadata,
    ) -> Result<BinaryDescriptor, ContextError> {
        let resource = format!("{namespace}.{key}");
        self.authorize(actor, "save_binary", &resource, Action::Write)?;

        let (descriptor, descriptor_value, size) = self
            .store_binary(namespace, key, reader, metadata)
            .inspect_err(|e| self.audit_failure("save_binary", "binary", &resource, actor, e))?;

        let (old, _) = self.write_value(namespace, key, &descriptor_value, true);
        self.release_replaced(old.as_ref(), &descriptor_value);
        tracing::debug!(namespace, key, size, "binary payload stored");
        self.audit.log(
            AuditEntry::new(
                if old.is_some() { "update" } else { "create" },
                "binary",
                &resource,
                &actor.role,
            )
            .with_meta("format", descriptor.metadata.format.as_str())
            .with_meta("data_location", json!(descriptor.data_location))
            .with_meta("size_bytes", size),
        );
        Ok(descriptor)
    }

    /// Build and validate the descriptor, streaming large payloads to binary
    /// storage. Returns the descriptor, its JSON form and the payload size.
    fn store_binary(
        &self,
        namespace: &str,
        key: &str,
        reader: &mut dyn Read,
        metadata: BinaryMetadata,
    ) -> Result<(BinaryDescriptor, Value, u64), ContextError> {
        let mut head = Vec::new();
        Read::take(&mut *reader, self.inline_threshold as u64)
            .read_to_end(&mut head)
            .map_err(StorageBackendError::from)?;
        let inline = head.len() < self.inline_threshold;

        let descriptor = if inline {
            BinaryDescriptor::inline(BASE64.encode(&head), metadata)
        } else {
            BinaryDescriptor::referenced(
                StorageReference {
                    namespace: namespace.to_string(),
                    key: key.to_string(),
                },
                metadata,
            )
        };

        let descriptor_value = serde_json::to_value(&descriptor)
            .map_err(|e| ContextError::Serialization(e.to_string()))?;
        let schema_id = self
            .validator
            .register_binary_data_schema(&descriptor.metadata.format)?;
        self.validator.validate_context(&descriptor_value, &schema_id)?;

        let mut size = head.len() as u64;
        if !inline {
            let storage = self.binary_storage()?;
            let mut stream = Cursor::new(head).chain(reader);
            size = storage.save_stream(namespace, key, &mut stream)?;
        }
        Ok((descriptor, descriptor_value, size))
    }

    fn read_descriptor(
        &self,
        actor: &Actor,
        namespace: &str,
        key: &str,
    ) -> Result<BinaryDescriptor, ContextError> {
        let value = self
            .get_context(actor, namespace, key)?
            .ok_or_else(|| ContextError::NotFound {
                namespace: namespace.to_string(),
                key: key.to_string(),
            })?;
        if !BinaryDescriptor::is_descriptor(&value) {
            return Err(ContextError::InvalidDescriptor(format!(
                "{namespace}.{key} does not hold a binary descriptor"
            )));
        }
        let descriptor: BinaryDescriptor = serde_json::from_value(value)
            .map_err(|e| ContextError::InvalidDescriptor(e.to_string()))?;
        if !descriptor.is_consistent() {
            return Err(ContextError::InvalidDescriptor(format!(
                "{namespace}.{key} has inconsistent data location"
            )));
        }
        Ok(descriptor)
    }

    fn decode_inline(descriptor: &BinaryDescriptor) -> Result<Vec<u8>, ContextError> {
        let data = descriptor.data.as_deref().unwrap_or_default();
        BASE64
            .decode(data)
            .map_err(|e| ContextError::InvalidDescriptor(format!("bad base64 payload: {e}")))
    }

    /// Read a binary payload fully into memory.
    pub fn load_binary_data(
        &self,
        actor: &Actor,
        namespace: &str,
        key: &str,
    ) -> Result<Vec<u8>, ContextError> {
        let loaded = self.read_descriptor(actor, namespace, key).and_then(|descriptor| {
            match (descriptor.data_location, &descriptor.storage_reference) {
                (DataLocation::Referenced, Some(reference)) => Ok(self
                    .binary_storage()?
                    .load(&reference.namespace, &reference.key)?),
                _ => Self::decode_inline(&descriptor),
            }
        });
        loaded.inspect_err(|e| {
            self.audit_failure("load_binary", "binary", &format!("{namespace}.{key}"), actor, e);
        })
    }

    /// Open a streaming reader over a binary payload.
    pub fn open_binary_data(
        &self,
        actor: &Actor,
        namespace: &str,
        key: &str,
    ) -> Result<Box<dyn Read + Send>, ContextError> {
        let opened = self.read_descriptor(actor, namespace, key).and_then(
            |descriptor| -> Result<Box<dyn Read + Send>, ContextError> {
                match (descriptor.data_location, &descriptor.storage_reference) {
                    (DataLocation::Referenced, Some(reference)) => Ok(self
                        .binary_storage()?
                        .open(&reference.namespace, &reference.key)?),
                    _ => Ok(Box::new(Cursor::new(Self::decode_inline(&descriptor)?))),
                }
            },
        );
        opened.inspect_err(|e| {
            self.audit_failure("open_binary", "binary", &format!("{namespace}.{key}"), actor, e);
        })
    }

    // -----------------------------------------------------------------------
    // Durable persistence
    // -----------------------------------------------------------------------

    /// Mirror one namespace, or every namespace with `None`, into the
    /// persistence backend. Persisted keys and namespaces that no longer
    /// exist in memory are removed. I/O failures yield `Ok(false)` and are
    /// logged.
    pub fn save_to_storage(&self, actor: &Actor, namespace: Option<&str>) -> Result<bool, ContextError> {
        let persistence = self.persistence_for("save", namespace.unwrap_or("*"), actor)?;
        let mut namespaces: BTreeMap<String, Map<String, Value>> = {
            let state = self.lock_state();
            match namespace {
                Some(ns) => BTreeMap::from([(
                    ns.to_string(),
                    state.data.get(ns).cloned().unwrap_or_default(),
                )]),
                None => state.data.clone(),
            }
        };
        if namespace.is_none() {
            for ns in persistence.list_namespaces() {
                namespaces.entry(ns).or_default();
            }
        }
        for ns in namespaces.keys() {
            self.authorize(actor, "save_to_storage", &namespace_resource(ns), Action::Read)?;
        }

        let ok = namespaces
            .iter()
            .fold(true, |ok, (ns, values)| persistence.sync_namespace(ns, values) && ok);

        tracing::info!(namespace, count = namespaces.len(), ok, "context saved to storage");
        self.audit.log(
            AuditEntry::new("save", "storage", namespace.unwrap_or("*"), &actor.role)
                .with_meta("namespaces", namespaces.len())
                .with_meta("success", ok),
        );
        Ok(ok)
    }

    /// Load one namespace, or every persisted namespace with `None`. Loaded
    /// keys overwrite in-memory keys; other in-memory keys are kept.
    pub fn load_from_storage(&self, actor: &Actor, namespace: Option<&str>) -> Result<bool, ContextError> {
        let persistence = self.persistence_for("load", namespace.unwrap_or("*"), actor)?;
        let targets: Vec<String> = match namespace {
            Some(ns) => vec![ns.to_string()],
            None => persistence.list_namespaces(),
        };
        for ns in &targets {
            self.authorize(actor, "load_from_storage", &namespace_resource(ns), Action::Write)?;
        }

        let mut ok = true;
        let mut loaded = 0usize;
        for ns in &targets {
            let Some(values) = persistence.load_namespace(ns) else {
                ok = false;
                continue;
            };
            let mut state = self.lock_state();
            for (key, value) in &values {
                state.record_write(ns, key, value);
            }
            state.data.entry(ns.clone()).or_default().extend(values);
            loaded += 1;
        }

        tracing::info!(namespace, loaded, ok, "context loaded from storage");
        self.audit.log(
            AuditEntry::new("load", "storage", namespace.unwrap_or("*"), &actor.role)
                .with_meta("namespaces", loaded)
                .with_meta("success", ok),
        );
        Ok(ok)
    }

    /// Remove persisted data for a namespace or one key. The in-memory store
    /// is untouched.
    pub fn delete_from_storage(
        &self,
        actor: &Actor,
        namespace: &str,
        key: Option<&str>,
    ) -> Result<bool, ContextError> {
        let resource = match key {
            Some(key) => format!("{namespace}.{key}"),
            None => namespace_resource(namespace),
        };
        let persistence = self.persistence_for("delete", &resource, actor)?;
        self.authorize(actor, "delete_from_storage", &resource, Action::Delete)?;

        let ok = persistence.delete(namespace, key);
        self.audit.log(
            AuditEntry::new("delete", "storage", &resource, &actor.role).with_meta("success", ok),
        );
        Ok(ok)
    }
}

impl std::fmt::Debug for ContextService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextService")
            .field("namespaces", &self.list_namespaces())
            .field("permissions_enabled", &self.permissions.is_enabled())
            .field("has_persistence", &self.persistence.is_some())
            .field("has_binary_storage", &self.binary_storage.is_some())
            .field("inline_threshold", &self.inline_threshold)
            .finish()
    }
}
