//! Filesystem fixtures for tests.

use std::fs;
use std::path::Path;

/// Creates `size` bytes at `dir/name` without writing them (sparse where supported).
pub fn write_sized(dir: &Path, name: &str, size: u64) {
  let path = dir.join(name);
  if let Some(parent) = path.parent() {
    fs::create_dir_all(parent).unwrap();
  }
  fs::File::create(&path).unwrap().set_len(size).unwrap();
}

/// Writes every `(relative path, contents)` pair under `root`, creating directories.
pub fn write_tree(root: &Path, files: &[(&str, &str)]) {
  for (rel, contents) in files {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
      fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, contents).unwrap();
  }
}
