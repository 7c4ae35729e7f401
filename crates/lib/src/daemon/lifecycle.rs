//! Managed daemon container lifecycle.
//!
//! ```text
//! NotInstalled --run--> Running --probe--> Reachable | Unreachable
//! Stopped ----start---> Running
//! Outdated --remove+run--> Running
//! ```
//!
//! A container is outdated when it runs an image other than the pinned one, or lost
//! host networking. Nothing here is retried by callers; a failure fails the build.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::client::{BuildDaemon, DaemonConnector, DaemonError};
use crate::consts::{DAEMON_STATE_DIR, READINESS_MAX_ATTEMPTS};

/// What the container runtime reports about an existing container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerState {
  pub running: bool,
  pub image: String,
  pub host_network: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
  pub name: String,
  pub image: String,
  pub privileged: bool,
  pub host_network: bool,
  /// Volume name to mount point.
  pub volumes: BTreeMap<String, String>,
}

impl ContainerSpec {
  /// The daemon container: privileged, on the host network, with its state in a named
  /// volume so caches survive reinstalls.
  pub fn daemon(name: &str, image: &str) -> Self {
    let mut volumes = BTreeMap::new();
    volumes.insert(format!("{name}-state"), DAEMON_STATE_DIR.to_string());

    Self {
      name: name.to_string(),
      image: image.to_string(),
      privileged: true,
      host_network: true,
      volumes,
    }
  }

  /// Address of the daemon inside the container.
  pub fn address(&self) -> String {
    format!("docker-container://{}", self.name)
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonState {
  NotInstalled,
  Stopped,
  Outdated { image: String },
  Running,
}

impl DaemonState {
  pub fn classify(state: Option<&ContainerState>, spec: &ContainerSpec) -> Self {
    match state {
      None => DaemonState::NotInstalled,
      Some(s) if s.image != spec.image || s.host_network != spec.host_network => DaemonState::Outdated {
        image: s.image.clone(),
      },
      Some(s) if !s.running => DaemonState::Stopped,
      Some(_) => DaemonState::Running,
    }
  }
}

/// The subset of a container runtime the daemon lifecycle needs.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
  /// `None` when no container with that name exists.
  async fn inspect(&self, name: &str) -> Result<Option<ContainerState>, DaemonError>;

  /// Creates and starts a detached container.
  async fn run(&self, spec: &ContainerSpec) -> Result<(), DaemonError>;

  async fn start(&self, name: &str) -> Result<(), DaemonError>;

  /// Force-removes the container and its anonymous volumes. Absent is success.
  async fn remove(&self, name: &str) -> Result<(), DaemonError>;
}

/// Brings the daemon container to the running state at the pinned image and returns its
/// address.
pub async fn ensure_running(runtime: &dyn ContainerRuntime, spec: &ContainerSpec) -> Result<String, DaemonError> {
  let state = runtime.inspect(&spec.name).await?;

  match DaemonState::classify(state.as_ref(), spec) {
    DaemonState::Running => {
      debug!(container = %spec.name, "daemon already running");
    }
    DaemonState::Stopped => {
      info!(container = %spec.name, "starting stopped daemon");
      runtime.start(&spec.name).await?;
    }
    DaemonState::NotInstalled => {
      info!(container = %spec.name, image = %spec.image, "installing daemon");
      runtime.run(spec).await?;
    }
    DaemonState::Outdated { image } => {
      warn!(container = %spec.name, found = %image, wanted = %spec.image, "daemon is outdated, reinstalling");
      runtime.remove(&spec.name).await?;
      runtime.run(spec).await?;
    }
  }

  Ok(spec.address())
}

pub async fn ensure_removed(runtime: &dyn ContainerRuntime, name: &str) -> Result<(), DaemonError> {
  runtime.remove(name).await
}

/// Exponential backoff used while waiting for a daemon to come up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
  pub initial: Duration,
  pub cap: Duration,
  pub max_attempts: u32,
}

impl Default for Backoff {
  fn default() -> Self {
    Self {
      initial: Duration::from_millis(100),
      cap: Duration::from_secs(5),
      max_attempts: READINESS_MAX_ATTEMPTS,
    }
  }
}

impl Backoff {
  /// Sleep before attempt `n + 1`, for `n` in `1..max_attempts`.
  pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
    let mut next = self.initial;
    (1..self.max_attempts).map(move |_| {
      let current = next.min(self.cap);
      next = next.saturating_mul(2);
      current
    })
  }
}

/// Connects to `addr` and lists workers until the daemon answers. Any answer other
/// than a connection failure means the daemon is up.
pub async fn wait_until_reachable(
  connector: &dyn DaemonConnector,
  addr: &str,
  backoff: Backoff,
) -> Result<Arc<dyn BuildDaemon>, DaemonError> {
  let mut delays = backoff.delays();

  for attempt in 1..=backoff.max_attempts {
    match probe(connector, addr).await {
      Ok(daemon) => {
        debug!(%addr, attempt, "daemon reachable");
        return Ok(daemon);
      }
      Err(e) if e.is_connection() => {
        debug!(%addr, attempt, error = %e, "daemon not reachable yet");
      }
      Err(e) => return Err(e),
    }

    if let Some(delay) = delays.next() {
      tokio::time::sleep(delay).await;
    }
  }

  Err(DaemonError::Unreachable {
    addr: addr.to_string(),
    attempts: backoff.max_attempts,
  })
}

async fn probe(connector: &dyn DaemonConnector, addr: &str) -> Result<Arc<dyn BuildDaemon>, DaemonError> {
  let daemon = connector.connect(addr).await?;
  match daemon.list_workers().await {
    Ok(_) => Ok(daemon),
    Err(e) if e.is_connection() => Err(e),
    Err(e) => {
      debug!(%addr, error = %e, "daemon answered with an error; treating as reachable");
      Ok(daemon)
    }
  }
}
