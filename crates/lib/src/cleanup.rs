//! Scoped release of staging resources.
//!
//! Resources kept on a [`Cleanups`] scope stay alive until [`Cleanups::run`] is called or
//! the scope is dropped, whichever comes first. They are then released in reverse order.

use std::path::Path;

use tempfile::{TempDir, TempPath};
use tracing::{debug, warn};

/// A staged resource that is removed when released.
pub trait Staged: Send + 'static {
  fn path(&self) -> &Path;

  fn release(self: Box<Self>) -> std::io::Result<()>;
}

impl Staged for TempPath {
  fn path(&self) -> &Path {
    self
  }

  fn release(self: Box<Self>) -> std::io::Result<()> {
    (*self).close()
  }
}

impl Staged for TempDir {
  fn path(&self) -> &Path {
    TempDir::path(self)
  }

  fn release(self: Box<Self>) -> std::io::Result<()> {
    (*self).close()
  }
}

#[derive(Default)]
pub struct Cleanups {
  staged: Vec<Box<dyn Staged>>,
}

impl Cleanups {
  pub fn new() -> Self {
    Self::default()
  }

  /// Keeps `resource` alive for the lifetime of the scope.
  pub fn keep<S: Staged>(&mut self, resource: S) {
    self.staged.push(Box::new(resource));
  }

  pub fn len(&self) -> usize {
    self.staged.len()
  }

  pub fn is_empty(&self) -> bool {
    self.staged.is_empty()
  }

  /// Releases everything now. Failures are logged, not returned.
  pub fn run(mut self) {
    self.release_all();
  }

  fn release_all(&mut self) {
    while let Some(resource) = self.staged.pop() {
      let label = resource.path().display().to_string();
      match resource.release() {
        Ok(()) => debug!(resource = %label, "released"),
        Err(e) => warn!(resource = %label, error = %e, "failed to release"),
      }
    }
  }
}

impl Drop for Cleanups {
  fn drop(&mut self) {
    self.release_all();
  }
}

impl std::fmt::Debug for Cleanups {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let pending: Vec<&Path> = self.staged.iter().map(|s| s.path()).collect();
    f.debug_struct("Cleanups").field("pending", &pending).finish()
  }
}
