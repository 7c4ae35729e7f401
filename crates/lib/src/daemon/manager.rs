use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::buildctl::BuildctlConnector;
use super::client::{BuildDaemon, DaemonConnector, DaemonError};
use super::docker::DockerCli;
use super::lifecycle::{self, Backoff, ContainerRuntime, ContainerSpec, DaemonState};
use super::types::WorkerInfo;
use crate::config::{DaemonConfig, EngineConfig};
use crate::platform::Platform;

/// A connected daemon, shared by every solve with the same configuration and platform.
pub struct DaemonHandle {
  pub daemon: Arc<dyn BuildDaemon>,
  pub addr: String,
  /// Platform of the first worker that declared any.
  pub host_platform: Platform,
  /// Whether the daemon runs in a container this process manages.
  pub managed: bool,
}

impl fmt::Debug for DaemonHandle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("DaemonHandle")
      .field("addr", &self.addr)
      .field("host_platform", &self.host_platform)
      .field("managed", &self.managed)
      .finish()
  }
}

type HandleCell = Arc<OnceCell<Arc<DaemonHandle>>>;

/// Creates daemon connections lazily and shares them.
///
/// Concurrent callers asking for the same `(DaemonConfig, Platform)` wait on a single
/// connection attempt. A failed attempt is not remembered; the next call tries again.
pub struct DaemonManager {
  runtime: Arc<dyn ContainerRuntime>,
  connector: Arc<dyn DaemonConnector>,
  backoff: Backoff,
  handles: Mutex<HashMap<(DaemonConfig, Platform), HandleCell>>,
}

impl DaemonManager {
  pub fn new(runtime: Arc<dyn ContainerRuntime>, connector: Arc<dyn DaemonConnector>) -> Self {
    Self {
      runtime,
      connector,
      backoff: Backoff::default(),
      handles: Mutex::new(HashMap::new()),
    }
  }

  /// Docker CLI runtime plus the `buildctl` transport.
  pub fn from_config(config: &EngineConfig) -> Self {
    Self::new(
      Arc::new(DockerCli::default()),
      Arc::new(BuildctlConnector::new(config.buildctl.clone())),
    )
  }

  pub fn with_backoff(mut self, backoff: Backoff) -> Self {
    self.backoff = backoff;
    self
  }

  pub async fn connect(&self, config: &DaemonConfig, platform: &Platform) -> Result<Arc<DaemonHandle>, DaemonError> {
    let config = config.normalized();

    let cell = {
      let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
      handles
        .entry((config.clone(), platform.clone()))
        .or_insert_with(|| Arc::new(OnceCell::new()))
        .clone()
    };

    let handle = cell.get_or_try_init(|| self.establish(&config, platform)).await?;
    Ok(handle.clone())
  }

  async fn establish(&self, config: &DaemonConfig, platform: &Platform) -> Result<Arc<DaemonHandle>, DaemonError> {
    let (daemon, addr, managed) = match (&config.daemon_addr, &config.container_name) {
      (Some(addr), _) => {
        // Explicit addresses are trusted as is: no lifecycle, no version check.
        debug!(%addr, "using existing build daemon");
        (self.connector.connect(addr).await?, addr.clone(), false)
      }
      (None, Some(name)) => {
        let spec = ContainerSpec::daemon(name, &config.image);
        let addr = lifecycle::ensure_running(self.runtime.as_ref(), &spec).await?;
        let daemon = lifecycle::wait_until_reachable(self.connector.as_ref(), &addr, self.backoff).await?;
        (daemon, addr, true)
      }
      (None, None) => {
        return Err(DaemonError::Rpc("no daemon address or container name configured".to_string()));
      }
    };

    let workers = daemon.list_workers().await?;
    let host_platform = host_platform(&workers)?;

    info!(%addr, host = %host_platform, target = %platform, managed, "connected to build daemon");

    Ok(Arc::new(DaemonHandle {
      daemon,
      addr,
      host_platform,
      managed,
    }))
  }

  /// Installs or repairs the managed daemon container without connecting to it.
  pub async fn ensure(&self, config: &DaemonConfig) -> Result<String, DaemonError> {
    let config = config.normalized();
    match (&config.daemon_addr, &config.container_name) {
      (Some(addr), _) => Ok(addr.clone()),
      (None, Some(name)) => lifecycle::ensure_running(self.runtime.as_ref(), &ContainerSpec::daemon(name, &config.image)).await,
      (None, None) => Err(DaemonError::Rpc("no daemon container configured".to_string())),
    }
  }

  /// Removes the managed daemon container. Removing an absent container succeeds.
  pub async fn remove(&self, config: &DaemonConfig) -> Result<(), DaemonError> {
    let config = config.normalized();
    match &config.container_name {
      Some(name) => lifecycle::ensure_removed(self.runtime.as_ref(), name).await,
      None => Ok(()),
    }
  }

  /// Lifecycle state of the managed container, `None` for explicit addresses.
  pub async fn status(&self, config: &DaemonConfig) -> Result<Option<DaemonState>, DaemonError> {
    let config = config.normalized();
    let (None, Some(name)) = (&config.daemon_addr, &config.container_name) else {
      return Ok(None);
    };

    let spec = ContainerSpec::daemon(name, &config.image);
    let state = self.runtime.inspect(name).await?;
    Ok(Some(DaemonState::classify(state.as_ref(), &spec)))
  }
}

fn host_platform(workers: &[WorkerInfo]) -> Result<Platform, DaemonError> {
  let platform = workers
    .iter()
    .find_map(|w| w.platforms.first())
    .ok_or(DaemonError::NoPlatforms)?;
  Ok(Platform::try_from(platform)?)
}
