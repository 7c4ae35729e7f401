//! Engine configuration.
//!
//! Everything that used to be a process-wide toggle lives on [`EngineConfig`], which is
//! handed to the [`Orchestrator`](crate::solve::Orchestrator) when it is constructed.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::cache::CacheEntry;
use crate::consts::{DAEMON_IMAGE, DEFAULT_CONTAINER_NAME};

/// How to reach the build daemon.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DaemonConfig {
  /// Name of the managed daemon container.
  pub container_name: Option<String>,

  /// Address of an existing daemon. When set, no lifecycle management or version
  /// check takes place.
  pub daemon_addr: Option<String>,

  /// Image the managed container must run.
  pub image: String,
}

impl Default for DaemonConfig {
  fn default() -> Self {
    Self {
      container_name: None,
      daemon_addr: None,
      image: DAEMON_IMAGE.to_string(),
    }
  }
}

impl DaemonConfig {
  /// Falls back to [`DEFAULT_CONTAINER_NAME`] when neither an address nor a container
  /// name was configured.
  pub fn normalized(&self) -> Self {
    let mut conf = self.clone();
    if conf.daemon_addr.is_none() && conf.container_name.is_none() {
      conf.container_name = Some(DEFAULT_CONTAINER_NAME.to_string());
    }
    conf
  }
}

/// Configuration for solving build requests.
#[derive(Debug, Clone)]
pub struct EngineConfig {
  pub daemon: DaemonConfig,

  /// Fold the digest of every local content set into the cache key instead of tracking
  /// each one as a separate dependency. Defaults to on in CI, where the workspace is
  /// assumed read-only.
  pub pre_digest_local_inputs: bool,

  /// Disable the workspace size ceiling.
  pub skip_workspace_size_check: bool,

  /// Global cache import override (e.g. from `--cache-from`).
  pub cache_import: Option<CacheEntry>,

  /// Global cache export override (e.g. from `--cache-to`).
  pub cache_export: Option<CacheEntry>,

  /// Secrets exposed to the build, `{name}:env|file:{value}` separated by `;`.
  pub secrets: String,

  /// Render progress as plain text on the console instead of tracking vertices.
  pub plaintext_logging: bool,

  /// Echo per-vertex build logs to the console.
  pub forward_console: bool,

  /// Path of the `buildctl` binary used by the default daemon transport.
  pub buildctl: PathBuf,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      daemon: DaemonConfig::default(),
      pre_digest_local_inputs: is_running_in_ci(),
      skip_workspace_size_check: false,
      cache_import: None,
      cache_export: None,
      secrets: String::new(),
      plaintext_logging: false,
      forward_console: false,
      buildctl: std::env::var_os("SOLVENT_BUILDCTL")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("buildctl")),
    }
  }
}

/// Returns true when the `CI` environment variable is set to anything but `false`/`0`.
pub fn is_running_in_ci() -> bool {
  match std::env::var("CI") {
    Ok(v) => !(v.is_empty() || v == "0" || v.eq_ignore_ascii_case("false")),
    Err(_) => false,
  }
}
