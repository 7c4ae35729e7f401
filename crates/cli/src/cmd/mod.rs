mod build;
mod daemon;
mod workspace;

pub use build::{BuildArgs, cmd_build};
pub use daemon::{DaemonCommand, cmd_daemon};
pub use workspace::{WorkspaceCommand, cmd_workspace};

use clap::Args;

use solvent_lib::cache::CacheEntry;
use solvent_lib::config::{DaemonConfig, EngineConfig};

/// How to reach the build daemon.
#[derive(Debug, Clone, Args)]
pub struct DaemonArgs {
  /// Name of the managed daemon container
  #[arg(long)]
  pub container_name: Option<String>,

  /// Address of an existing daemon; skips container management
  #[arg(long)]
  pub daemon_addr: Option<String>,
}

impl DaemonArgs {
  pub fn to_config(&self) -> DaemonConfig {
    DaemonConfig {
      container_name: self.container_name.clone(),
      daemon_addr: self.daemon_addr.clone(),
      ..DaemonConfig::default()
    }
  }
}

/// Engine behaviour shared by every solve.
#[derive(Debug, Clone, Args)]
pub struct EngineArgs {
  #[command(flatten)]
  pub daemon: DaemonArgs,

  /// Cache import, e.g. `type=registry,ref=ghcr.io/acme/cache`
  #[arg(long, value_parser = parse_cache_entry)]
  pub cache_from: Option<CacheEntry>,

  /// Cache export, e.g. `type=gha,mode=max`
  #[arg(long, value_parser = parse_cache_entry)]
  pub cache_to: Option<CacheEntry>,

  /// Do not reject oversized local contents
  #[arg(long)]
  pub skip_workspace_size_check: bool,

  /// Secrets as `name:env|file:value`, separated by `;`
  #[arg(long, default_value = "")]
  pub secrets: String,

  /// Print plain progress text instead of tracking vertices
  #[arg(long)]
  pub plaintext: bool,

  /// Echo build logs to the console
  #[arg(long)]
  pub forward_console: bool,

  /// Fold local content digests into cache keys (defaults to on in CI)
  #[arg(long)]
  pub pre_digest: Option<bool>,
}

fn parse_cache_entry(s: &str) -> Result<CacheEntry, String> {
  CacheEntry::parse(s).map_err(|e| e.to_string())
}

impl EngineArgs {
  pub fn to_config(&self) -> EngineConfig {
    let defaults = EngineConfig::default();
    EngineConfig {
      daemon: self.daemon.to_config(),
      pre_digest_local_inputs: self.pre_digest.unwrap_or(defaults.pre_digest_local_inputs),
      skip_workspace_size_check: self.skip_workspace_size_check,
      cache_import: self.cache_from.clone(),
      cache_export: self.cache_to.clone(),
      secrets: self.secrets.clone(),
      plaintext_logging: self.plaintext,
      forward_console: self.forward_console,
      ..defaults
    }
  }
}
