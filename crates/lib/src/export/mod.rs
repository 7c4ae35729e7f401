//! Turning a daemon solve into an artifact.
//!
//! Every exporter follows the same three steps:
//!
//! 1. [`Exporter::prepare`] stages whatever the daemon will write into (a temp file, a
//!    temp directory) and keeps its guard on the caller's [`Cleanups`].
//! 2. [`Exporter::exports`] describes the output to the daemon.
//! 3. [`Exporter::provide`] turns the staged output and the daemon response into the
//!    artifact, recording canonical results on the solve action.

pub mod archive;
mod fs;
mod image;
mod registry;

pub use archive::{Descriptor, LayeredImage, Manifest};
pub use fs::{FilesystemExporter, FsView};
pub use image::{DockerImageExporter, OciArchiveExporter};
pub use registry::{RegistryExporter, parse_repository};

use async_trait::async_trait;
use thiserror::Error;

use crate::action::RunningAction;
use crate::cleanup::Cleanups;
use crate::daemon::{ExportEntry, SolveResponse};

/// Exporter response key carrying the pushed image digest.
pub const IMAGE_DIGEST_KEY: &str = "containerimage.digest";

#[derive(Debug, Error)]
pub enum ExportError {
  #[error("digest is missing from result")]
  DigestMissing,

  #[error("invalid repository reference {reference:?}: {reason}")]
  InvalidReference { reference: String, reason: String },

  #[error("digest mismatch: expected {expected}, got {actual}")]
  DigestMismatch { expected: String, actual: String },

  #[error("invalid image: {0}")]
  InvalidImage(String),

  #[error("registry request for {reference} failed: {message}")]
  Registry { reference: String, message: String },

  #[error("exporter was not prepared")]
  NotPrepared,

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

#[async_trait]
pub trait Exporter: Send + Sync {
  type Artifact: Send;

  async fn prepare(&mut self, cleanups: &mut Cleanups) -> Result<(), ExportError>;

  fn exports(&self) -> Vec<ExportEntry>;

  async fn provide(&self, action: &RunningAction, response: &SolveResponse) -> Result<Self::Artifact, ExportError>;
}

/// Records the canonical results of an image on the solve action.
pub(crate) fn record_canonical(action: &RunningAction, image: &LayeredImage) {
  action.add_result("digest", &image.digest());
  action.add_result("config", image.config_name());
}
