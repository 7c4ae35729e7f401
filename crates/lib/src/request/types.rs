use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use crate::platform::Platform;
use crate::util::hash::hash_bytes;
use crate::workspace::LocalContents;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
  #[error("request has neither a build graph nor a frontend")]
  Empty,

  #[error("frontend inputs were given without a frontend")]
  InputsWithoutFrontend,

  #[error("local contents {0:?} were added more than once")]
  DuplicateLocal(String),

  #[error("failed to describe request: {0}")]
  Explain(String),
}

/// A serialized build graph. Opaque to this crate.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Definition {
  bytes: Vec<u8>,
}

impl Definition {
  pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
    Self { bytes: bytes.into() }
  }

  pub fn as_bytes(&self) -> &[u8] {
    &self.bytes
  }

  /// `sha256:<hex>` of the serialized bytes.
  pub fn digest(&self) -> String {
    hash_bytes(&self.bytes).to_digest()
  }
}

/// An immutable request to solve a build graph (or a frontend) into an artifact.
#[derive(Debug, Clone)]
pub struct SolveRequest {
  pub definition: Option<Definition>,
  pub frontend: Option<String>,
  pub frontend_opts: BTreeMap<String, String>,
  pub frontend_inputs: BTreeMap<String, Definition>,
  pub local_dirs: Vec<LocalContents>,
  pub target_platform: Platform,
  /// Human readable origin of the request. Never affects the output.
  pub source_label: String,
}

impl SolveRequest {
  /// Daemon-side mount name to host directory.
  pub fn local_dir_mappings(&self) -> BTreeMap<String, PathBuf> {
    self
      .local_dirs
      .iter()
      .map(|local| (local.name(), local.abs_path()))
      .collect()
  }

  /// Pretty JSON description of what the request would send to the daemon.
  pub fn explain(&self) -> Result<String, RequestError> {
    #[derive(Serialize)]
    struct Local<'a> {
      name: String,
      path: &'a str,
      observe_changes: bool,
    }

    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    struct Explained<'a> {
      source_label: &'a str,
      platform: String,
      frontend: Option<&'a str>,
      frontend_opt: &'a BTreeMap<String, String>,
      definition: Option<String>,
      inputs: BTreeMap<&'a str, String>,
      local_dirs: Vec<Local<'a>>,
    }

    let explained = Explained {
      source_label: &self.source_label,
      platform: self.target_platform.to_string(),
      frontend: self.frontend.as_deref(),
      frontend_opt: &self.frontend_opts,
      definition: self.definition.as_ref().map(Definition::digest),
      inputs: self
        .frontend_inputs
        .iter()
        .map(|(name, def)| (name.as_str(), def.digest()))
        .collect(),
      local_dirs: self
        .local_dirs
        .iter()
        .map(|l| Local {
          name: l.name(),
          path: &l.path,
          observe_changes: l.observe_changes,
        })
        .collect(),
    };

    serde_json::to_string_pretty(&explained).map_err(|e| RequestError::Explain(e.to_string()))
  }
}

/// Builder for [`SolveRequest`].
///
/// ```ignore
/// let req = SolveRequestBuilder::new(Platform::host()?)
///   .definition(Definition::new(bytes))
///   .local(LocalContents::new(module, "web"))
///   .build()?;
/// ```
#[derive(Debug)]
pub struct SolveRequestBuilder {
  definition: Option<Definition>,
  frontend: Option<String>,
  frontend_opts: BTreeMap<String, String>,
  frontend_inputs: BTreeMap<String, Definition>,
  local_dirs: Vec<LocalContents>,
  target_platform: Platform,
  source_label: String,
}

impl SolveRequestBuilder {
  pub fn new(target_platform: Platform) -> Self {
    Self {
      definition: None,
      frontend: None,
      frontend_opts: BTreeMap::new(),
      frontend_inputs: BTreeMap::new(),
      local_dirs: Vec::new(),
      target_platform,
      source_label: String::new(),
    }
  }

  pub fn definition(mut self, definition: Definition) -> Self {
    self.definition = Some(definition);
    self
  }

  pub fn frontend(mut self, name: impl Into<String>) -> Self {
    self.frontend = Some(name.into());
    self
  }

  pub fn frontend_opt(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.frontend_opts.insert(key.into(), value.into());
    self
  }

  pub fn frontend_input(mut self, name: impl Into<String>, definition: Definition) -> Self {
    self.frontend_inputs.insert(name.into(), definition);
    self
  }

  pub fn local(mut self, local: LocalContents) -> Self {
    self.local_dirs.push(local);
    self
  }

  pub fn source_label(mut self, label: impl Into<String>) -> Self {
    self.source_label = label.into();
    self
  }

  pub fn build(self) -> Result<SolveRequest, RequestError> {
    if self.definition.is_none() && self.frontend.is_none() {
      return Err(RequestError::Empty);
    }

    if self.frontend.is_none() && !self.frontend_inputs.is_empty() {
      return Err(RequestError::InputsWithoutFrontend);
    }

    let mut seen = HashSet::new();
    for local in &self.local_dirs {
      let name = local.name();
      if !seen.insert(name.clone()) {
        return Err(RequestError::DuplicateLocal(name));
      }
    }

    Ok(SolveRequest {
      definition: self.definition,
      frontend: self.frontend,
      frontend_opts: self.frontend_opts,
      frontend_inputs: self.frontend_inputs,
      local_dirs: self.local_dirs,
      target_platform: self.target_platform,
      source_label: self.source_label,
    })
  }
}
