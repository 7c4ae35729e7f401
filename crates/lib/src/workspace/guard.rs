//! Workspace size guard.
//!
//! Catches accidental inclusion of unfiltered large directories before anything is
//! shipped to the daemon.

use tracing::debug;

use super::{FileSize, LocalView, WorkspaceError};
use crate::consts::{LARGEST_FILES_REPORTED, MAX_WORKSPACE_SIZE};
use crate::util::format_bytes;

#[derive(Debug, Clone, Copy)]
pub struct SizeGuard {
  limit: u64,
}

impl Default for SizeGuard {
  fn default() -> Self {
    Self::new(MAX_WORKSPACE_SIZE)
  }
}

impl SizeGuard {
  pub fn new(limit: u64) -> Self {
    Self { limit }
  }

  pub fn limit(&self) -> u64 {
    self.limit
  }

  /// Returns the total size when it does not exceed the limit. A set totalling exactly
  /// the limit passes.
  pub fn check(&self, name: &str, view: &LocalView) -> Result<u64, WorkspaceError> {
    let total = view.total_size()?;
    debug!(local = %name, total, limit = self.limit, "estimated workspace size");

    if total <= self.limit {
      return Ok(total);
    }

    Err(self.too_large(name, view, total))
  }

  fn too_large(&self, name: &str, view: &LocalView, total: u64) -> WorkspaceError {
    let (description, largest) = match view.largest_files(LARGEST_FILES_REPORTED) {
      Ok(largest) => (describe_largest(&largest), largest),
      Err(_) => (
        "Wasn't able to compute the largest files in the workspace.".to_string(),
        Vec::new(),
      ),
    };

    WorkspaceError::TooLarge {
      name: name.to_string(),
      total: format_bytes(total),
      limit: format_bytes(self.limit),
      description,
      largest,
    }
  }
}

fn describe_largest(files: &[FileSize]) -> String {
  let lines: Vec<String> = files
    .iter()
    .map(|f| format!("    {} ({})", f.path, format_bytes(f.size)))
    .collect();

  format!(
    "  The top {} largest files in the workspace are:\n\n{}",
    lines.len(),
    lines.join("\n")
  )
}
