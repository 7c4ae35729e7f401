//! Cache key derivation.
//!
//! Every field is written as `label-length, label, value-length, value` (lengths as
//! big-endian u64), so two distinct requests can never collide by concatenation.

use std::path::PathBuf;

use tracing::trace;

use super::SolveRequest;
use crate::consts::CACHE_KEY_VERSION;
use crate::util::hash::hash_bytes;
use crate::workspace::WorkspaceError;

/// How local contents participate in the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyMode {
  /// Each local ref is a named dependency; the output is non-deterministic.
  Observe,
  /// The digest of each local ref is folded into the key bytes.
  PreDigest,
}

impl KeyMode {
  pub fn from_pre_digest(pre_digest: bool) -> Self {
    if pre_digest { Self::PreDigest } else { Self::Observe }
  }
}

/// A local content set the computation depends on, tracked outside the key bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedDependency {
  /// `local{k}:contents`
  pub name: String,
  pub path: PathBuf,
  pub observe_changes: bool,
}

/// Everything that identifies a request to the compute graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inputs {
  pub key: Vec<u8>,
  pub dependencies: Vec<NamedDependency>,
  pub non_deterministic: bool,
}

impl Inputs {
  /// Hex SHA-256 of the key bytes.
  pub fn digest(&self) -> String {
    hash_bytes(&self.key).0
  }

  /// Appends one more length-prefixed field to the key.
  pub fn extend(&mut self, label: &str, value: &[u8]) {
    let mut w = KeyWriter {
      buf: std::mem::take(&mut self.key),
    };
    w.field(label, value);
    self.key = w.buf;
  }
}

#[derive(Default)]
struct KeyWriter {
  buf: Vec<u8>,
}

impl KeyWriter {
  fn field(&mut self, label: &str, value: &[u8]) {
    self.buf.extend_from_slice(&(label.len() as u64).to_be_bytes());
    self.buf.extend_from_slice(label.as_bytes());
    self.buf.extend_from_slice(&(value.len() as u64).to_be_bytes());
    self.buf.extend_from_slice(value);
  }
}

/// Derives the cache key of `req`.
///
/// In [`KeyMode::PreDigest`] the filtered contents of every local ref are digested, which
/// walks the filesystem.
pub fn cache_key(req: &SolveRequest, mode: KeyMode) -> Result<Inputs, WorkspaceError> {
  let mut w = KeyWriter::default();

  w.field("version", CACHE_KEY_VERSION.to_string().as_bytes());
  w.field(
    "graph",
    req.definition.as_ref().map(|d| d.as_bytes()).unwrap_or_default(),
  );

  for (name, def) in &req.frontend_inputs {
    w.field(&format!("input:{name}"), def.as_bytes());
  }

  w.field("frontend", req.frontend.as_deref().unwrap_or_default().as_bytes());
  for (key, value) in &req.frontend_opts {
    w.field("frontend-opt", format!("{key}={value}").as_bytes());
  }

  let mut dependencies = Vec::new();

  match mode {
    KeyMode::Observe => {
      for (k, local) in req.local_dirs.iter().enumerate() {
        dependencies.push(NamedDependency {
          name: format!("local{k}:contents"),
          path: local.abs_path(),
          observe_changes: local.observe_changes,
        });
        w.field(&format!("local{k}:path"), local.path.as_bytes());
      }
    }
    KeyMode::PreDigest => {
      for local in &req.local_dirs {
        let digest = local.view().digest()?;
        let label = format!("local-contents:{}:{}", local.module.root.display(), local.path);
        w.field(&label, format!("{}\n", digest.to_digest()).as_bytes());
      }
    }
  }

  let inputs = Inputs {
    key: w.buf,
    dependencies,
    non_deterministic: mode == KeyMode::Observe && !req.local_dirs.is_empty(),
  };

  trace!(digest = %inputs.digest(), ?mode, "derived cache key");
  Ok(inputs)
}
