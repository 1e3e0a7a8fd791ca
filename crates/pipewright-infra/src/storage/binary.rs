//! Filesystem binary object storage.
//!
//! Objects live at `{root}/{namespace}/{key}`. Writes stream the source in
//! fixed-size chunks into a temp file beside the destination, then rename it
//! into place. Only the basename of a namespace or key is used.

use std::fs::{self, File};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use pipewright_core::context::BinaryStorageBackend;
use pipewright_types::error::StorageBackendError;
use tempfile::NamedTempFile;

use super::{basename, remove_if_exists};

/// Chunk size used when none is configured.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Binary object storage rooted at a directory.
#[derive(Debug, Clone)]
pub struct FilesystemBinaryStorage {
    root: PathBuf,
    chunk_size: usize,
}

impl FilesystemBinaryStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Set the streaming chunk size. Zero falls back to the default.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = if chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            chunk_size
        };
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, namespace: &str, key: &str) -> Result<PathBuf, StorageBackendError> {
        let namespace = basename(namespace)
            .ok_or_else(|| StorageBackendError::InvalidName(namespace.to_string()))?;
        let key = basename(key).ok_or_else(|| StorageBackendError::InvalidName(key.to_string()))?;
        Ok(self.root.join(namespace).join(key))
    }

    fn not_found(namespace: &str, key: &str) -> StorageBackendError {
        StorageBackendError::NotFound {
            namespace: namespace.to_string(),
            key: key.to_string(),
        }
    }
}

impl BinaryStorageBackend for FilesystemBinaryStorage {
    fn save_stream(
        &self,
        namespace: &str,
        key: &str,
        reader: &mut dyn Read,
    ) -> Result<u64, StorageBackendError> {
        let path = self.object_path(namespace, key)?;
        let dir = path
            .parent()
            .ok_or_else(|| StorageBackendError::InvalidName(namespace.to_string()))?;
        fs::create_dir_all(dir)?;

        let mut tmp = NamedTempFile::new_in(dir)?;
        let mut chunk = vec![0u8; self.chunk_size];
        let mut written = 0u64;
        loop {
            let n = match reader.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            tmp.write_all(&chunk[..n])?;
            written += n as u64;
        }
        tmp.flush()?;
        tmp.persist(&path).map_err(|e| e.error)?;

        tracing::debug!(namespace, key, bytes = written, "binary object stored");
        Ok(written)
    }

    fn open(&self, namespace: &str, key: &str) -> Result<Box<dyn Read + Send>, StorageBackendError> {
        let path = self.object_path(namespace, key)?;
        match File::open(&path) {
            Ok(file) => Ok(Box::new(BufReader::with_capacity(self.chunk_size, file))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(Self::not_found(namespace, key)),
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&self, namespace: &str, key: &str) -> Result<bool, StorageBackendError> {
        let path = self.object_path(namespace, key)?;
        Ok(remove_if_exists(&path)?)
    }

    fn exists(&self, namespace: &str, key: &str) -> bool {
        self.object_path(namespace, key)
            .map(|path| path.is_file())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn storage(chunk_size: usize) -> (TempDir, FilesystemBinaryStorage) {
        let tmp = TempDir::new().unwrap();
        let storage = FilesystemBinaryStorage::new(tmp.path().join("binary")).with_chunk_size(chunk_size);
        (tmp, storage)
    }

    #[test]
    fn test_stream_larger_than_chunk() {
        let (_tmp, storage) = storage(7);
        let payload: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let written = storage
            .save_stream("media", "clip.bin", &mut Cursor::new(payload.clone()))
            .unwrap();
        assert_eq!(written, 1000);
        assert!(storage.exists("media", "clip.bin"));
        assert_eq!(storage.load("media", "clip.bin").unwrap(), payload);
    }

    #[test]
    fn test_open_missing_object() {
        let (_tmp, storage) = storage(16);
        assert!(matches!(
            storage.open("media", "nothing"),
            Err(StorageBackendError::NotFound { .. })
        ));
        assert!(!storage.exists("media", "nothing"));
    }

    #[test]
    fn test_delete() {
        let (_tmp, storage) = storage(16);
        storage
            .save_stream("media", "a.bin", &mut Cursor::new(b"abc".to_vec()))
            .unwrap();
        assert!(storage.delete("media", "a.bin").unwrap());
        assert!(!storage.delete("media", "a.bin").unwrap());
        assert!(!storage.exists("media", "a.bin"));
    }

    #[test]
    fn test_traversal_uses_basename() {
        let (tmp, storage) = storage(16);
        storage
            .save_stream("../../outside", "../../evil.bin", &mut Cursor::new(b"x".to_vec()))
            .unwrap();
        assert!(tmp.path().join("binary/outside/evil.bin").is_file());
        assert!(matches!(
            storage.save_stream("media", "..", &mut Cursor::new(Vec::new())),
            Err(StorageBackendError::InvalidName(_))
        ));
    }

    #[test]
    fn test_zero_chunk_size_uses_default() {
        let (_tmp, storage) = storage(0);
        assert_eq!(storage.chunk_size, DEFAULT_CHUNK_SIZE);
    }
}
