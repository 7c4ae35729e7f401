//! Cache import/export policy.
//!
//! A build carries per-build default cache directives; the engine may carry a global
//! override for each direction. [`CachePolicy::resolve`] picks the winner per direction
//! and fills in GitHub Actions credentials for `gha` entries.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::consts::{GHA_DEFAULT_SCOPE, GHA_TOKEN_ENV, GHA_URL_ENV};

/// Cache type that needs GitHub Actions credentials.
pub const GHA_KIND: &str = "gha";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheError {
  #[error("invalid cache flag {flag:?}: {reason}")]
  InvalidFlag { flag: String, reason: String },

  #[error("gha cache requires $ACTIONS_RUNTIME_TOKEN and $ACTIONS_CACHE_URL to be set (missing {missing})")]
  MissingGhaEnv { missing: &'static str },
}

/// A daemon-level cache directive, e.g. `type=registry,ref=ghcr.io/acme/cache`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheEntry {
  #[serde(rename = "type")]
  pub kind: String,
  #[serde(default)]
  pub attrs: BTreeMap<String, String>,
}

impl CacheEntry {
  pub fn new(kind: impl Into<String>) -> Self {
    Self {
      kind: kind.into(),
      attrs: BTreeMap::new(),
    }
  }

  pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.attrs.insert(key.into(), value.into());
    self
  }

  /// Parses the `--cache-from` / `--cache-to` flag syntax: comma separated `key=value`
  /// pairs, one of which must be `type`.
  pub fn parse(flag: &str) -> Result<Self, CacheError> {
    let invalid = |reason: &str| CacheError::InvalidFlag {
      flag: flag.to_string(),
      reason: reason.to_string(),
    };

    let mut kind = None;
    let mut attrs = BTreeMap::new();

    for pair in flag.split(',') {
      let pair = pair.trim();
      let Some((key, value)) = pair.split_once('=') else {
        return Err(invalid(&format!("expected key=value, got {pair:?}")));
      };
      let (key, value) = (key.trim(), value.trim());
      if key.is_empty() {
        return Err(invalid("empty key"));
      }

      if key == "type" {
        if value.is_empty() {
          return Err(invalid("empty type"));
        }
        kind = Some(value.to_string());
      } else {
        attrs.insert(key.to_string(), value.to_string());
      }
    }

    let kind = kind.ok_or_else(|| invalid("missing type"))?;
    Ok(Self { kind, attrs })
  }

  fn with_gha_credentials(mut self) -> Result<Self, CacheError> {
    if self.kind != GHA_KIND {
      return Ok(self);
    }

    let token = non_empty_env(GHA_TOKEN_ENV).ok_or(CacheError::MissingGhaEnv { missing: GHA_TOKEN_ENV })?;
    let url = non_empty_env(GHA_URL_ENV).ok_or(CacheError::MissingGhaEnv { missing: GHA_URL_ENV })?;

    self.attrs.insert("token".to_string(), token);
    self.attrs.insert("url".to_string(), url);
    self
      .attrs
      .entry("scope".to_string())
      .or_insert_with(|| GHA_DEFAULT_SCOPE.to_string());

    Ok(self)
  }
}

impl FromStr for CacheEntry {
  type Err = CacheError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Self::parse(s)
  }
}

impl fmt::Display for CacheEntry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "type={}", self.kind)?;
    for (key, value) in &self.attrs {
      // Credentials never leave through Display.
      if key == "token" {
        write!(f, ",{key}=<redacted>")?;
      } else {
        write!(f, ",{key}={value}")?;
      }
    }
    Ok(())
  }
}

fn non_empty_env(name: &str) -> Option<String> {
  std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Resolved cache directives for one solve.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachePolicy {
  pub imports: Vec<CacheEntry>,
  pub exports: Vec<CacheEntry>,
}

impl CachePolicy {
  pub fn is_empty(&self) -> bool {
    self.imports.is_empty() && self.exports.is_empty()
  }

  /// Global overrides win per direction; otherwise the per-build defaults apply. Only
  /// the first export entry is kept. `gha` entries get credentials from the environment,
  /// and a missing credential fails here, before anything reaches the daemon.
  pub fn resolve(
    global_import: Option<&CacheEntry>,
    global_export: Option<&CacheEntry>,
    defaults: &CachePolicy,
  ) -> Result<CachePolicy, CacheError> {
    let imports = match global_import {
      Some(entry) => vec![entry.clone()],
      None => defaults.imports.clone(),
    };

    let exports = match global_export {
      Some(entry) => vec![entry.clone()],
      None => defaults.exports.iter().take(1).cloned().collect(),
    };

    let policy = CachePolicy {
      imports: imports
        .into_iter()
        .map(CacheEntry::with_gha_credentials)
        .collect::<Result<_, _>>()?,
      exports: exports
        .into_iter()
        .map(CacheEntry::with_gha_credentials)
        .collect::<Result<_, _>>()?,
    };

    debug!(imports = policy.imports.len(), exports = policy.exports.len(), "resolved cache policy");
    Ok(policy)
  }
}
