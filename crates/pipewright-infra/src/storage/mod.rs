//! Filesystem storage adapters.
//!
//! Both adapters write through a temp file in the destination directory and
//! an atomic rename, so readers never observe a partial file.

use std::io;
use std::path::Path;

use sha2::{Digest, Sha256};

pub mod binary;
pub mod filesystem;

pub use binary::FilesystemBinaryStorage;
pub use filesystem::FilesystemBackend;

/// Hex digits of the name digest kept in on-disk names.
const DIGEST_CHARS: usize = 16;

/// Reduce a namespace or key to `[A-Za-z0-9_-]`, replacing anything else
/// with `_`. Returns `None` for empty names and for `.` or `..`.
pub fn sanitize_name(name: &str) -> Option<String> {
    if name.is_empty() || name == "." || name == ".." {
        return None;
    }
    Some(
        name.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect(),
    )
}

/// On-disk name for a namespace or key: the sanitized name followed by a
/// digest of the original, so distinct names never share a file.
pub fn storage_name(name: &str) -> Option<String> {
    let stem = sanitize_name(name)?;
    let digest = format!("{:x}", Sha256::digest(name.as_bytes()));
    Some(format!("{stem}-{}", &digest[..DIGEST_CHARS]))
}

/// The final path component of `name`, rejecting `.`, `..` and empty names.
pub fn basename(name: &str) -> Option<&str> {
    Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
}

/// Remove a file, reporting whether it existed.
pub(crate) fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_keeps_safe_characters() {
        assert_eq!(sanitize_name("jobs-2024_a").as_deref(), Some("jobs-2024_a"));
        assert_eq!(sanitize_name("status.detail").as_deref(), Some("status_detail"));
    }

    #[test]
    fn test_sanitize_neutralizes_traversal() {
        assert_eq!(sanitize_name("../etc/passwd").as_deref(), Some("___etc_passwd"));
        assert_eq!(sanitize_name(".."), None);
        assert_eq!(sanitize_name("."), None);
        assert_eq!(sanitize_name(""), None);
    }

    #[test]
    fn test_sanitize_accepts_underscore_names() {
        assert_eq!(sanitize_name("_").as_deref(), Some("_"));
        assert_eq!(sanitize_name("__").as_deref(), Some("__"));
        assert_eq!(sanitize_name("..."), Some("___".to_string()));
    }

    #[test]
    fn test_storage_name_distinguishes_colliding_names() {
        let dotted = storage_name("status.detail").unwrap();
        let underscored = storage_name("status_detail").unwrap();
        assert_ne!(dotted, underscored);
        assert!(dotted.starts_with("status_detail-"));
        assert_eq!(dotted.len(), "status_detail-".len() + DIGEST_CHARS);
        assert_eq!(storage_name("status.detail").unwrap(), dotted);
        assert_eq!(storage_name(".."), None);
    }

    #[test]
    fn test_basename() {
        assert_eq!(basename("../../secret.bin"), Some("secret.bin"));
        assert_eq!(basename("photo.png"), Some("photo.png"));
        assert_eq!(basename(".."), None);
        assert_eq!(basename(""), None);
    }
}
