//! Durable storage ports for the context store.
//!
//! Two backends sit behind the context service:
//!
//! - [`PersistenceBackend`] stores JSON values per namespace and key. The
//!   [`PersistenceManager`] wraps it and degrades every failure to
//!   `false`/`None` plus an error log.
//! - [`BinaryStorageBackend`] streams raw byte objects. Its failures are
//!   surfaced to the caller.
//!
//! In-memory implementations live here; filesystem adapters live in
//! `pipewright-infra`.

use std::collections::{BTreeMap, HashMap};
use std::io::{Cursor, Read};
use std::sync::{Arc, Mutex};

use pipewright_types::error::{PersistenceError, StorageBackendError};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Ports
// ---------------------------------------------------------------------------

/// JSON persistence keyed by namespace and key.
pub trait PersistenceBackend: Send + Sync {
    fn save(&self, namespace: &str, key: &str, data: &Value) -> Result<(), PersistenceError>;

    /// Load one key, or with `key = None` every key of the namespace as an
    /// object. `Ok(None)` when nothing is stored.
    fn load(&self, namespace: &str, key: Option<&str>) -> Result<Option<Value>, PersistenceError>;

    /// Delete one key, or the whole namespace. `Ok(false)` when nothing existed.
    fn delete(&self, namespace: &str, key: Option<&str>) -> Result<bool, PersistenceError>;

    fn list_namespaces(&self) -> Result<Vec<String>, PersistenceError>;
}

/// Raw byte object storage with streaming reads and writes.
pub trait BinaryStorageBackend: Send + Sync {
    /// Consume `reader` into the object at namespace/key. Returns bytes written.
    fn save_stream(
        &self,
        namespace: &str,
        key: &str,
        reader: &mut dyn Read,
    ) -> Result<u64, StorageBackendError>;

    /// Open a streaming reader over a stored object.
    fn open(&self, namespace: &str, key: &str) -> Result<Box<dyn Read + Send>, StorageBackendError>;

    fn load(&self, namespace: &str, key: &str) -> Result<Vec<u8>, StorageBackendError> {
        let mut buf = Vec::new();
        self.open(namespace, key)?.read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn delete(&self, namespace: &str, key: &str) -> Result<bool, StorageBackendError>;

    fn exists(&self, namespace: &str, key: &str) -> bool;
}

// ---------------------------------------------------------------------------
// PersistenceManager
// ---------------------------------------------------------------------------

/// Failure-tolerant facade over a [`PersistenceBackend`].
pub struct PersistenceManager {
    backend: Box<dyn PersistenceBackend>,
}

impl PersistenceManager {
    pub fn new(backend: Box<dyn PersistenceBackend>) -> Self {
        Self { backend }
    }

    pub fn save(&self, namespace: &str, key: &str, data: &Value) -> bool {
        match self.backend.save(namespace, key, data) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(namespace, key, error = %e, "failed to persist context value");
                false
            }
        }
    }

    /// Persist every key of a namespace. True only if every key was written.
    pub fn save_namespace(&self, namespace: &str, values: &Map<String, Value>) -> bool {
        values
            .iter()
            .fold(true, |ok, (key, value)| self.save(namespace, key, value) && ok)
    }

    /// Make the persisted namespace match `values`: write every key, then
    /// delete persisted keys missing from `values`. An empty map removes the
    /// namespace. True only if every write and delete succeeded.
    pub fn sync_namespace(&self, namespace: &str, values: &Map<String, Value>) -> bool {
        if values.is_empty() {
            return match self.backend.delete(namespace, None) {
                Ok(_) => true,
                Err(e) => {
                    tracing::error!(namespace, error = %e, "failed to remove persisted namespace");
                    false
                }
            };
        }

        let mut ok = self.save_namespace(namespace, values);
        let stale: Vec<String> = match self.backend.load(namespace, None) {
            Ok(Some(Value::Object(persisted))) => persisted
                .keys()
                .filter(|key| !values.contains_key(*key))
                .cloned()
                .collect(),
            Ok(_) => Vec::new(),
            Err(e) => {
                tracing::error!(namespace, error = %e, "failed to list persisted keys");
                ok = false;
                Vec::new()
            }
        };
        for key in &stale {
            if let Err(e) = self.backend.delete(namespace, Some(key)) {
                tracing::error!(namespace, key, error = %e, "failed to remove stale persisted key");
                ok = false;
            }
        }
        if !stale.is_empty() {
            tracing::debug!(namespace, removed = stale.len(), "pruned stale persisted keys");
        }
        ok
    }

    pub fn load(&self, namespace: &str, key: &str) -> Option<Value> {
        self.backend
            .load(namespace, Some(key))
            .unwrap_or_else(|e| {
                tracing::error!(namespace, key, error = %e, "failed to load persisted value");
                None
            })
    }

    pub fn load_namespace(&self, namespace: &str) -> Option<Map<String, Value>> {
        match self.backend.load(namespace, None) {
            Ok(Some(Value::Object(map))) => Some(map),
            Ok(Some(other)) => {
                tracing::error!(namespace, kind = ?other, "persisted namespace is not an object");
                None
            }
            Ok(None) => None,
            Err(e) => {
                tracing::error!(namespace, error = %e, "failed to load persisted namespace");
                None
            }
        }
    }

    pub fn delete(&self, namespace: &str, key: Option<&str>) -> bool {
        self.backend.delete(namespace, key).unwrap_or_else(|e| {
            tracing::error!(namespace, key, error = %e, "failed to delete persisted data");
            false
        })
    }

    pub fn list_namespaces(&self) -> Vec<String> {
        self.backend.list_namespaces().unwrap_or_else(|e| {
            tracing::error!(error = %e, "failed to list persisted namespaces");
            Vec::new()
        })
    }
}

impl std::fmt::Debug for PersistenceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceManager").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// In-memory backends
// ---------------------------------------------------------------------------

/// JSON persistence held in process memory. Useful for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    data: Mutex<BTreeMap<String, Map<String, Value>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PersistenceBackend for MemoryBackend {
    fn save(&self, namespace: &str, key: &str, data: &Value) -> Result<(), PersistenceError> {
        self.data
            .lock()
            .expect("memory backend lock poisoned")
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), data.clone());
        Ok(())
    }

    fn load(&self, namespace: &str, key: Option<&str>) -> Result<Option<Value>, PersistenceError> {
        let data = self.data.lock().expect("memory backend lock poisoned");
        let Some(ns) = data.get(namespace) else {
            return Ok(None);
        };
        Ok(match key {
            Some(key) => ns.get(key).cloned(),
            None => Some(Value::Object(ns.clone())),
        })
    }

    fn delete(&self, namespace: &str, key: Option<&str>) -> Result<bool, PersistenceError> {
        let mut data = self.data.lock().expect("memory backend lock poisoned");
        Ok(match key {
            Some(key) => data
                .get_mut(namespace)
                .is_some_and(|ns| ns.remove(key).is_some()),
            None => data.remove(namespace).is_some(),
        })
    }

    fn list_namespaces(&self) -> Result<Vec<String>, PersistenceError> {
        Ok(self
            .data
            .lock()
            .expect("memory backend lock poisoned")
            .keys()
            .cloned()
            .collect())
    }
}

/// Binary object storage held in process memory.
#[derive(Debug, Default)]
pub struct MemoryBinaryStorage {
    objects: Mutex<HashMap<(String, String), Arc<Vec<u8>>>>,
}

impl MemoryBinaryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Reader over a shared in-memory object.
struct SharedBytes(Arc<Vec<u8>>);

impl AsRef<[u8]> for SharedBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl BinaryStorageBackend for MemoryBinaryStorage {
    fn save_stream(
        &self,
        namespace: &str,
        key: &str,
        reader: &mut dyn Read,
    ) -> Result<u64, StorageBackendError> {
        let mut buf = Vec::new();
        let written = reader.read_to_end(&mut buf)? as u64;
        self.objects
            .lock()
            .expect("binary storage lock poisoned")
            .insert((namespace.to_string(), key.to_string()), Arc::new(buf));
        Ok(written)
    }

    fn open(&self, namespace: &str, key: &str) -> Result<Box<dyn Read + Send>, StorageBackendError> {
        let object = self
            .objects
            .lock()
            .expect("binary storage lock poisoned")
            .get(&(namespace.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| StorageBackendError::NotFound {
                namespace: namespace.to_string(),
                key: key.to_string(),
            })?;
        Ok(Box::new(Cursor::new(SharedBytes(object))))
    }

    fn delete(&self, namespace: &str, key: &str) -> Result<bool, StorageBackendError> {
        Ok(self
            .objects
            .lock()
            .expect("binary storage lock poisoned")
            .remove(&(namespace.to_string(), key.to_string()))
            .is_some())
    }

    fn exists(&self, namespace: &str, key: &str) -> bool {
        self.objects
            .lock()
            .expect("binary storage lock poisoned")
            .contains_key(&(namespace.to_string(), key.to_string()))
    }
}
