//! Filesystem JSON persistence.
//!
//! Implements `PersistenceBackend` from `pipewright-core` with one directory
//! per namespace and one file per key:
//!
//! ```text
//! {base_path}/
//!   my_ns-<digest>/
//!     _namespace                  {"namespace": "my.ns"}
//!     status_detail-<digest>.json {"key": "status.detail", "value": ...}
//!     status_detail-<digest>.json {"key": "status_detail", "value": ...}
//! ```
//!
//! On-disk names are the sanitized name plus a digest of the original (see
//! [`storage_name`]), so `status.detail` and `status_detail` land in separate
//! files. Each key file records the original key next to the value and each
//! namespace directory records its original namespace in `_namespace`, so
//! loads and listings return original names.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use pipewright_core::context::PersistenceBackend;
use pipewright_types::error::PersistenceError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tempfile::NamedTempFile;

use super::{remove_if_exists, storage_name};

const EXTENSION: &str = "json";

/// Marker file naming the namespace a directory holds. It has no extension,
/// so key listings never pick it up.
const NAMESPACE_MARKER: &str = "_namespace";

#[derive(Serialize, Deserialize)]
struct StoredValue {
    key: String,
    value: Value,
}

#[derive(Serialize, Deserialize)]
struct NamespaceMarker {
    namespace: String,
}

/// JSON persistence rooted at a base directory.
#[derive(Debug, Clone)]
pub struct FilesystemBackend {
    base_path: PathBuf,
}

impl FilesystemBackend {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn namespace_dir(&self, namespace: &str) -> Result<PathBuf, PersistenceError> {
        let name = storage_name(namespace)
            .ok_or_else(|| PersistenceError::InvalidName(namespace.to_string()))?;
        Ok(self.base_path.join(name))
    }

    fn key_path(&self, namespace: &str, key: &str) -> Result<PathBuf, PersistenceError> {
        let file = storage_name(key).ok_or_else(|| PersistenceError::InvalidName(key.to_string()))?;
        Ok(self.namespace_dir(namespace)?.join(format!("{file}.{EXTENSION}")))
    }

    /// Write `value` as pretty JSON to `path` through a temp file in `dir`.
    fn write_atomic<T: Serialize>(dir: &Path, path: &Path, value: &T) -> Result<(), PersistenceError> {
        let mut tmp = NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, value)?;
        tmp.flush()?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, PersistenceError> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Every `*.json` file directly inside `dir`, sorted.
    fn json_files(dir: &Path) -> Result<Vec<PathBuf>, PersistenceError> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut files = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == EXTENSION) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

impl PersistenceBackend for FilesystemBackend {
    fn save(&self, namespace: &str, key: &str, data: &Value) -> Result<(), PersistenceError> {
        let path = self.key_path(namespace, key)?;
        let dir = self.namespace_dir(namespace)?;
        fs::create_dir_all(&dir)?;

        let marker = dir.join(NAMESPACE_MARKER);
        if !marker.is_file() {
            let namespace = NamespaceMarker {
                namespace: namespace.to_string(),
            };
            Self::write_atomic(&dir, &marker, &namespace)?;
        }

        let stored = StoredValue {
            key: key.to_string(),
            value: data.clone(),
        };
        Self::write_atomic(&dir, &path, &stored)?;

        tracing::debug!(namespace, key, path = %path.display(), "persisted context value");
        Ok(())
    }

    fn load(&self, namespace: &str, key: Option<&str>) -> Result<Option<Value>, PersistenceError> {
        if let Some(key) = key {
            let path = self.key_path(namespace, key)?;
            return Ok(Self::read_json::<StoredValue>(&path)?.map(|stored| stored.value));
        }

        let dir = self.namespace_dir(namespace)?;
        if !dir.is_dir() {
            return Ok(None);
        }
        let mut values = Map::new();
        for path in Self::json_files(&dir)? {
            if let Some(stored) = Self::read_json::<StoredValue>(&path)? {
                values.insert(stored.key, stored.value);
            }
        }
        Ok(Some(Value::Object(values)))
    }

    fn delete(&self, namespace: &str, key: Option<&str>) -> Result<bool, PersistenceError> {
        if let Some(key) = key {
            let path = self.key_path(namespace, key)?;
            return Ok(remove_if_exists(&path)?);
        }

        let dir = self.namespace_dir(namespace)?;
        let mut removed = false;
        for path in Self::json_files(&dir)? {
            removed |= remove_if_exists(&path)?;
        }
        remove_if_exists(&dir.join(NAMESPACE_MARKER))?;
        // Leave the directory alone if anything else lives there.
        if dir.is_dir() && fs::remove_dir(&dir).is_ok() {
            removed = true;
        }
        Ok(removed)
    }

    fn list_namespaces(&self) -> Result<Vec<String>, PersistenceError> {
        let entries = match fs::read_dir(&self.base_path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut namespaces = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            match Self::read_json::<NamespaceMarker>(&entry.path().join(NAMESPACE_MARKER))? {
                Some(marker) => namespaces.push(marker.namespace),
                None => tracing::debug!(
                    dir = %entry.path().display(),
                    "skipping directory without namespace marker"
                ),
            }
        }
        namespaces.sort();
        Ok(namespaces)
    }
}
