use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::types::{SolveOpt, SolveResponse, SolveStatus, WorkerInfo};
use crate::platform::PlatformError;

#[derive(Debug, Error)]
pub enum DaemonError {
  /// The daemon could not be reached at all.
  #[error("failed to connect to build daemon at {addr}: {message}")]
  Connect { addr: String, message: String },

  #[error("build daemon at {addr} did not become reachable after {attempts} attempts")]
  Unreachable { addr: String, attempts: u32 },

  #[error("build daemon request failed: {0}")]
  Rpc(String),

  #[error("solve failed: {0}")]
  Solve(String),

  #[error("solve was cancelled")]
  Cancelled,

  #[error("build daemon reported no worker platforms")]
  NoPlatforms,

  #[error("unsupported by this daemon transport: {0}")]
  Unsupported(String),

  #[error("container runtime: {op} {container} failed: {message}")]
  Runtime {
    op: &'static str,
    container: String,
    message: String,
  },

  #[error("invalid worker platform: {0}")]
  Platform(#[from] PlatformError),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

impl DaemonError {
  pub fn is_connection(&self) -> bool {
    matches!(self, DaemonError::Connect { .. })
  }
}

/// A connected build daemon.
#[async_trait]
pub trait BuildDaemon: Send + Sync {
  async fn list_workers(&self) -> Result<Vec<WorkerInfo>, DaemonError>;

  /// Runs one solve. Progress is pushed into `status`, which is dropped when the solve
  /// ends. Cancelling `cancel` aborts the solve.
  async fn solve(
    &self,
    opt: SolveOpt,
    status: mpsc::Sender<SolveStatus>,
    cancel: CancellationToken,
  ) -> Result<SolveResponse, DaemonError>;
}

/// Opens connections to daemons by address.
#[async_trait]
pub trait DaemonConnector: Send + Sync {
  async fn connect(&self, addr: &str) -> Result<Arc<dyn BuildDaemon>, DaemonError>;
}
