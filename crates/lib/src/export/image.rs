use std::path::PathBuf;

use async_trait::async_trait;
use tracing::debug;

use super::{ExportError, Exporter, LayeredImage, record_canonical};
use crate::action::RunningAction;
use crate::cleanup::Cleanups;
use crate::daemon::{ExportEntry, ExportOutput, SolveResponse};

/// Stages an empty temp file that lives as long as `cleanups`.
fn stage_file(cleanups: &mut Cleanups, prefix: &str) -> Result<PathBuf, ExportError> {
  let staged = tempfile::Builder::new()
    .prefix(prefix)
    .suffix(".tar")
    .tempfile()?
    .into_temp_path();
  let path = staged.to_path_buf();
  cleanups.keep(staged);
  Ok(path)
}

async fn ingest(path: PathBuf) -> Result<LayeredImage, ExportError> {
  tokio::task::spawn_blocking(move || LayeredImage::from_archive(&path))
    .await
    .map_err(|e| ExportError::InvalidImage(format!("ingest task failed: {e}")))?
}

/// Exports into a docker-format tarball and reads it back.
#[derive(Debug, Default)]
pub struct DockerImageExporter {
  output: Option<PathBuf>,
}

impl DockerImageExporter {
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl Exporter for DockerImageExporter {
  type Artifact = LayeredImage;

  async fn prepare(&mut self, cleanups: &mut Cleanups) -> Result<(), ExportError> {
    self.output = Some(stage_file(cleanups, "solvent-image-")?);
    Ok(())
  }

  fn exports(&self) -> Vec<ExportEntry> {
    let mut entry = ExportEntry::new("docker");
    if let Some(path) = &self.output {
      entry = entry.output(ExportOutput::File(path.clone()));
    }
    vec![entry]
  }

  async fn provide(&self, action: &RunningAction, _response: &SolveResponse) -> Result<LayeredImage, ExportError> {
    let path = self.output.clone().ok_or(ExportError::NotPrepared)?;
    debug!(path = %path.display(), "ingesting docker image");
    let image = ingest(path).await?;
    record_canonical(action, &image);
    Ok(image)
  }
}

/// Exports into an OCI layout tarball and reads it back.
#[derive(Debug, Default)]
pub struct OciArchiveExporter {
  output: Option<PathBuf>,
}

impl OciArchiveExporter {
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl Exporter for OciArchiveExporter {
  type Artifact = LayeredImage;

  async fn prepare(&mut self, cleanups: &mut Cleanups) -> Result<(), ExportError> {
    self.output = Some(stage_file(cleanups, "solvent-oci-")?);
    Ok(())
  }

  fn exports(&self) -> Vec<ExportEntry> {
    let mut entry = ExportEntry::new("oci").attr("buildinfo", "false");
    if let Some(path) = &self.output {
      entry = entry.output(ExportOutput::File(path.clone()));
    }
    vec![entry]
  }

  async fn provide(&self, action: &RunningAction, _response: &SolveResponse) -> Result<LayeredImage, ExportError> {
    let path = self.output.clone().ok_or(ExportError::NotPrepared)?;
    debug!(path = %path.display(), "ingesting oci archive");
    let image = ingest(path).await?;
    record_canonical(action, &image);
    Ok(image)
  }
}
