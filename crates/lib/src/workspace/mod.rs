//! Local content shipped to the daemon.
//!
//! A [`LocalContents`] names a directory inside a caller's module. [`LocalView`] is the
//! filtered, read-only view of that directory the daemon would receive: version control,
//! editor and cache directories are excluded, as is the host-only devhost file.
//!
//! # Submodules
//!
//! - [`guard`] - rejects content sets that are implausibly large

pub mod guard;

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use walkdir::WalkDir;

use crate::consts::{BASE_EXCLUDE_PATTERNS, DEVHOST_FILENAME};
use crate::util::hash::{ContentHash, DirHashError, hash_directory};

pub use guard::SizeGuard;

/// Errors produced while inspecting local content.
#[derive(Debug, Error)]
pub enum WorkspaceError {
  #[error("failed to walk {path}: {message}")]
  Walk { path: PathBuf, message: String },

  #[error("failed to digest local contents: {0}")]
  Digest(#[from] DirHashError),

  #[error(
    "the workspace snapshot of {name:?} is unexpectedly large ({total} vs max expected {limit});\n\
     this is likely a problem with the way that workspace contents are filtered.\n\n\
     {description}\n\n\
     If you don't think this is an actual issue, please re-run with --skip-workspace-size-check."
  )]
  TooLarge {
    name: String,
    total: String,
    limit: String,
    description: String,
    largest: Vec<FileSize>,
  },
}

/// A module (package root) on the caller's machine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Module {
  /// Logical module name, e.g. `github.com/acme/app`.
  pub name: String,
  /// Absolute path of the module root.
  pub root: PathBuf,
}

impl Module {
  pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
    Self {
      name: name.into(),
      root: root.into(),
    }
  }
}

/// A directory inside a module that must be visible to the daemon during a solve.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LocalContents {
  pub module: Module,
  /// Path relative to the module root.
  pub path: String,
  /// Whether the caller wants rebuilds when the contents change.
  pub observe_changes: bool,
}

impl LocalContents {
  pub fn new(module: Module, path: impl Into<String>) -> Self {
    Self {
      module,
      path: path.into(),
      observe_changes: false,
    }
  }

  pub fn observing_changes(mut self) -> Self {
    self.observe_changes = true;
    self
  }

  /// Logical name: used as cache-key component and daemon-side mount name.
  pub fn name(&self) -> String {
    Path::new(&self.module.name).join(&self.path).to_string_lossy().to_string()
  }

  /// Absolute host path of the directory.
  pub fn abs_path(&self) -> PathBuf {
    self.module.root.join(&self.path)
  }

  /// Patterns graph authors must pass along with the local source.
  pub fn exclude_patterns() -> Vec<String> {
    BASE_EXCLUDE_PATTERNS
      .iter()
      .copied()
      .chain(std::iter::once(DEVHOST_FILENAME))
      .map(str::to_string)
      .collect()
  }

  pub fn view(&self) -> LocalView {
    LocalView::new(self.abs_path())
  }
}

/// A regular file and its size, relative to the view root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSize {
  pub path: String,
  pub size: u64,
}

/// Filtered, read-only view of a local directory.
#[derive(Debug, Clone)]
pub struct LocalView {
  root: PathBuf,
  excludes: Vec<String>,
}

impl LocalView {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self {
      root: root.into(),
      excludes: LocalContents::exclude_patterns(),
    }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  /// Whether `rel` (relative to the root) survives filtering.
  pub fn includes(&self, rel: &Path) -> bool {
    !self.excludes.iter().any(|pattern| matches_pattern(rel, pattern))
  }

  /// All regular files in the view, sorted by path.
  pub fn files(&self) -> Result<Vec<FileSize>, WorkspaceError> {
    let mut files = Vec::new();

    let walker = WalkDir::new(&self.root)
      .sort_by_file_name()
      .into_iter()
      .filter_entry(|e| match e.path().strip_prefix(&self.root) {
        Ok(rel) if rel.as_os_str().is_empty() => true,
        Ok(rel) => self.includes(rel),
        Err(_) => true,
      });

    for entry in walker {
      let entry = entry.map_err(|e| WorkspaceError::Walk {
        path: self.root.clone(),
        message: e.to_string(),
      })?;

      if !entry.file_type().is_file() {
        continue;
      }

      let metadata = entry.metadata().map_err(|e| WorkspaceError::Walk {
        path: entry.path().to_path_buf(),
        message: e.to_string(),
      })?;

      let rel = entry.path().strip_prefix(&self.root).unwrap_or(entry.path());
      files.push(FileSize {
        path: rel.to_string_lossy().to_string(),
        size: metadata.len(),
      });
    }

    Ok(files)
  }

  pub fn total_size(&self) -> Result<u64, WorkspaceError> {
    Ok(self.files()?.iter().map(|f| f.size).sum())
  }

  /// The `n` largest files, biggest first. Ties are broken by path.
  pub fn largest_files(&self, n: usize) -> Result<Vec<FileSize>, WorkspaceError> {
    let mut files = self.files()?;
    files.sort_by(|a, b| b.size.cmp(&a.size).then_with(|| a.path.cmp(&b.path)));
    files.truncate(n);
    Ok(files)
  }

  /// Content digest of the filtered view.
  pub fn digest(&self) -> Result<ContentHash, WorkspaceError> {
    Ok(hash_directory(&self.root, |rel| self.includes(rel))?)
  }
}

/// A single-component pattern matches that component anywhere in the path; a
/// multi-component pattern matches any contiguous run of components.
fn matches_pattern(rel: &Path, pattern: &str) -> bool {
  let components: Vec<&str> = rel
    .components()
    .filter_map(|c| match c {
      Component::Normal(s) => s.to_str(),
      _ => None,
    })
    .collect();
  let wanted: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();

  if wanted.is_empty() || wanted.len() > components.len() {
    return false;
  }

  components.windows(wanted.len()).any(|w| w == wanted.as_slice())
}
