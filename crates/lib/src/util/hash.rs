//! Hashing utilities for cache keys and content verification.
//!
//! - `ContentHash`: a full 64-character SHA-256 hex digest
//! - `hash_directory()`: deterministic hashing of a filtered directory tree
//! - `hash_file()` / `hash_bytes()`: single file and byte hashing

use std::fs;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

/// A full 64-character SHA-256 hash.
///
/// # Format
///
/// Lowercase hexadecimal. [`ContentHash::to_digest`] renders the OCI form
/// (`sha256:<hex>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub String);

impl ContentHash {
  pub fn to_digest(&self) -> String {
    format!("sha256:{}", self.0)
  }
}

impl std::fmt::Display for ContentHash {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Error during directory hashing.
#[derive(Debug, thiserror::Error)]
pub enum DirHashError {
  #[error("failed to walk directory: {message}")]
  WalkDir { message: String },

  #[error("failed to read file {path}: {message}")]
  ReadFile { path: String, message: String },

  #[error("failed to read symlink {path}: {message}")]
  ReadSymlink { path: String, message: String },
}

/// Compute a deterministic hash of a directory's contents.
///
/// The hash covers file contents, directory structure and symlink targets, but not
/// timestamps or permissions. `keep` receives each path relative to `path` and decides
/// whether the entry (and, for directories, everything below it) is included.
///
/// # Example
///
/// ```ignore
/// let hash = hash_directory(&root, |rel| !rel.starts_with(".git"))?;
/// ```
pub fn hash_directory(path: &Path, keep: impl Fn(&Path) -> bool) -> Result<ContentHash, DirHashError> {
  let mut entries: Vec<(String, String)> = Vec::new();

  let walker = WalkDir::new(path).sort_by_file_name().into_iter().filter_entry(|e| {
    match e.path().strip_prefix(path) {
      Ok(rel) if rel.as_os_str().is_empty() => true,
      Ok(rel) => keep(rel),
      Err(_) => true,
    }
  });

  for entry in walker {
    let entry = entry.map_err(|e| DirHashError::WalkDir { message: e.to_string() })?;
    let entry_path = entry.path();

    let rel_path = entry_path
      .strip_prefix(path)
      .unwrap_or(entry_path)
      .to_string_lossy()
      .to_string();

    if rel_path.is_empty() {
      continue;
    }

    let file_type = entry.file_type();
    let entry_hash = if file_type.is_file() {
      let content_hash = hash_file(entry_path)?;
      format!("F:{}:{}", rel_path, content_hash.0)
    } else if file_type.is_dir() {
      format!("D:{}", rel_path)
    } else if file_type.is_symlink() {
      let target = fs::read_link(entry_path).map_err(|e| DirHashError::ReadSymlink {
        path: entry_path.display().to_string(),
        message: e.to_string(),
      })?;
      let target_hash = hash_bytes(target.to_string_lossy().as_bytes());
      format!("L:{}:{}", rel_path, target_hash.0)
    } else {
      // Sockets, devices and fifos never reach the daemon.
      continue;
    };

    entries.push((rel_path, entry_hash));
  }

  entries.sort_by(|a, b| a.0.cmp(&b.0));

  let mut hasher = Sha256::new();
  for (_, entry_hash) in entries {
    hasher.update(entry_hash.as_bytes());
    hasher.update(b"\n");
  }

  Ok(ContentHash(format!("{:x}", hasher.finalize())))
}

/// Hash a file's contents.
pub fn hash_file(path: &Path) -> Result<ContentHash, DirHashError> {
  let mut file = fs::File::open(path).map_err(|e| DirHashError::ReadFile {
    path: path.display().to_string(),
    message: e.to_string(),
  })?;

  let mut hasher = Sha256::new();
  let mut buffer = [0u8; 8192];

  loop {
    let bytes_read = file.read(&mut buffer).map_err(|e| DirHashError::ReadFile {
      path: path.display().to_string(),
      message: e.to_string(),
    })?;
    if bytes_read == 0 {
      break;
    }
    hasher.update(&buffer[..bytes_read]);
  }

  Ok(ContentHash(format!("{:x}", hasher.finalize())))
}

/// Hash arbitrary bytes.
pub fn hash_bytes(data: &[u8]) -> ContentHash {
  let mut hasher = Sha256::new();
  hasher.update(data);
  ContentHash(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::fs;
  use tempfile::tempdir;

  fn keep_all(_: &Path) -> bool {
    true
  }

  #[test]
  fn hash_empty_directory() {
    let temp = tempdir().unwrap();
    let hash = hash_directory(temp.path(), keep_all).unwrap();
    assert_eq!(hash.0.len(), 64);
  }

  #[test]
  fn hash_is_deterministic() {
    let temp = tempdir().unwrap();
    fs::write(temp.path().join("a.txt"), "content a").unwrap();
    fs::write(temp.path().join("b.txt"), "content b").unwrap();

    let hash1 = hash_directory(temp.path(), keep_all).unwrap();
    let hash2 = hash_directory(temp.path(), keep_all).unwrap();

    assert_eq!(hash1, hash2);
  }

  #[test]
  fn hash_changes_with_content() {
    let temp = tempdir().unwrap();
    fs::write(temp.path().join("file.txt"), "original").unwrap();
    let hash1 = hash_directory(temp.path(), keep_all).unwrap();

    fs::write(temp.path().join("file.txt"), "modified").unwrap();
    let hash2 = hash_directory(temp.path(), keep_all).unwrap();

    assert_ne!(hash1, hash2);
  }

  #[test]
  fn hash_respects_filter() {
    let temp = tempdir().unwrap();
    fs::write(temp.path().join("file.txt"), "content").unwrap();
    let hash1 = hash_directory(temp.path(), keep_all).unwrap();

    fs::create_dir(temp.path().join(".git")).unwrap();
    fs::write(temp.path().join(".git/HEAD"), "ref: refs/heads/main").unwrap();

    let hash2 = hash_directory(temp.path(), |rel| !rel.starts_with(".git")).unwrap();
    assert_eq!(hash1, hash2);
  }

  #[test]
  fn same_content_different_structure_different_hash() {
    let temp1 = tempdir().unwrap();
    fs::write(temp1.path().join("file.txt"), "content").unwrap();

    let temp2 = tempdir().unwrap();
    fs::create_dir(temp2.path().join("subdir")).unwrap();
    fs::write(temp2.path().join("subdir/file.txt"), "content").unwrap();

    let hash1 = hash_directory(temp1.path(), keep_all).unwrap();
    let hash2 = hash_directory(temp2.path(), keep_all).unwrap();

    assert_ne!(hash1, hash2);
  }

  #[test]
  fn hash_bytes_matches_hash_file() {
    let temp = tempdir().unwrap();
    let file_path = temp.path().join("test.txt");
    fs::write(&file_path, "hello world").unwrap();

    assert_eq!(hash_file(&file_path).unwrap(), hash_bytes(b"hello world"));
    assert_eq!(
      hash_bytes(b"hello world").to_digest(),
      "sha256:b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
    );
  }
}
