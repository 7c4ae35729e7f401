use std::path::{Path, PathBuf};

use async_trait::async_trait;
use walkdir::WalkDir;

use super::{ExportError, Exporter};
use crate::action::RunningAction;
use crate::cleanup::Cleanups;
use crate::daemon::{ExportEntry, ExportOutput, SolveResponse};

/// Read-only view of an exported directory tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsView {
  root: PathBuf,
}

impl FsView {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn read(&self, rel: impl AsRef<Path>) -> Result<Vec<u8>, ExportError> {
    Ok(std::fs::read(self.root.join(rel))?)
  }

  /// Relative paths of every regular file, sorted.
  pub fn files(&self) -> Result<Vec<PathBuf>, ExportError> {
    let mut files = Vec::new();
    for entry in WalkDir::new(&self.root).sort_by_file_name() {
      let entry = entry.map_err(|e| ExportError::Io(std::io::Error::other(e.to_string())))?;
      if entry.file_type().is_file() {
        if let Ok(rel) = entry.path().strip_prefix(&self.root) {
          files.push(rel.to_path_buf());
        }
      }
    }
    Ok(files)
  }
}

/// Exports the build result into a local directory.
#[derive(Debug, Default)]
pub struct FilesystemExporter {
  output: Option<PathBuf>,
}

impl FilesystemExporter {
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl Exporter for FilesystemExporter {
  type Artifact = FsView;

  async fn prepare(&mut self, cleanups: &mut Cleanups) -> Result<(), ExportError> {
    let staged = tempfile::Builder::new().prefix("solvent-fs-").tempdir()?;
    self.output = Some(staged.path().to_path_buf());
    cleanups.keep(staged);
    Ok(())
  }

  fn exports(&self) -> Vec<ExportEntry> {
    let mut entry = ExportEntry::new("local");
    if let Some(dir) = &self.output {
      entry = entry.output(ExportOutput::Dir(dir.clone()));
    }
    vec![entry]
  }

  async fn provide(&self, _action: &RunningAction, _response: &SolveResponse) -> Result<FsView, ExportError> {
    let dir = self.output.clone().ok_or(ExportError::NotPrepared)?;
    Ok(FsView::new(dir))
  }
}
