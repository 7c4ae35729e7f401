use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::debug;

use super::{Orchestrator, SolveContext, SolveError};
use crate::cache::CachePolicy;
use crate::cleanup::Cleanups;
use crate::compute::Computable;
use crate::export::{DockerImageExporter, FilesystemExporter, FsView, LayeredImage, RegistryExporter};
use crate::request::{Inputs, KeyMode, SolveRequest, cache_key};

/// Where a built image should be pushed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetName {
  pub repository: String,
  /// Talk plain HTTP to the registry.
  pub insecure: bool,
  /// The registry needs credentials the daemon cannot negotiate on its own.
  pub requires_credentials: bool,
}

impl TargetName {
  pub fn new(repository: impl Into<String>) -> Self {
    Self {
      repository: repository.into(),
      insecure: false,
      requires_credentials: false,
    }
  }
}

/// Pre-digesting reads every local file, so the key is derived on the blocking pool.
async fn request_inputs(orchestrator: &Orchestrator, request: &SolveRequest, kind: &str) -> Result<Inputs, SolveError> {
  let mode = KeyMode::from_pre_digest(orchestrator.config().pre_digest_local_inputs);
  let req = request.clone();
  let mut inputs = tokio::task::spawn_blocking(move || cache_key(&req, mode)).await??;
  inputs.extend("kind", kind.as_bytes());
  inputs.extend("platform", request.target_platform.to_string().as_bytes());
  Ok(inputs)
}

/// Builds a container image.
///
/// With a target that needs no credential negotiation, the daemon pushes the image by
/// digest and the manifest is read back from the registry. Otherwise the image comes back
/// as a docker tarball.
pub struct ImageBuild {
  pub orchestrator: Arc<Orchestrator>,
  pub ctx: SolveContext,
  pub request: SolveRequest,
  pub target: Option<TargetName>,
  pub cache: CachePolicy,
}

impl ImageBuild {
  fn pushes_to_registry(&self) -> Option<&TargetName> {
    self.target.as_ref().filter(|t| !t.requires_credentials)
  }
}

#[async_trait]
impl Computable for ImageBuild {
  type Output = LayeredImage;
  type Error = SolveError;

  async fn inputs(&self) -> Result<Inputs, SolveError> {
    let mut inputs = request_inputs(&self.orchestrator, &self.request, "image").await?;
    if let Some(target) = self.pushes_to_registry() {
      inputs.extend("target", target.repository.as_bytes());
    }
    Ok(inputs)
  }

  async fn compute(&self) -> Result<LayeredImage, SolveError> {
    let ctx = self.ctx.fork().with_action("buildkit.build-image");
    let mut cleanups = Cleanups::new();

    let image = match self.pushes_to_registry() {
      Some(target) => {
        debug!(repository = %target.repository, "exporting to registry");
        let mut exporter = RegistryExporter::new(target.repository.clone(), target.insecure);
        self
          .orchestrator
          .solve(&ctx, &mut cleanups, &self.request, &mut exporter, &self.cache)
          .await?
      }
      None => {
        let mut exporter = DockerImageExporter::new();
        self
          .orchestrator
          .solve(&ctx, &mut cleanups, &self.request, &mut exporter, &self.cache)
          .await?
      }
    };

    // The image is fully in memory; staged tarballs can go.
    cleanups.run();
    Ok(image)
  }
}

/// An exported directory tree, kept on disk for as long as any clone is alive.
#[derive(Debug, Clone)]
pub struct FsOutput {
  pub view: FsView,
  _scope: Arc<Mutex<Cleanups>>,
}

/// Builds a filesystem tree.
pub struct FsBuild {
  pub orchestrator: Arc<Orchestrator>,
  pub ctx: SolveContext,
  pub request: SolveRequest,
  pub cache: CachePolicy,
}

#[async_trait]
impl Computable for FsBuild {
  type Output = FsOutput;
  type Error = SolveError;

  async fn inputs(&self) -> Result<Inputs, SolveError> {
    request_inputs(&self.orchestrator, &self.request, "fs").await
  }

  async fn compute(&self) -> Result<FsOutput, SolveError> {
    let ctx = self.ctx.fork().with_action("buildkit.build-fs");
    let mut cleanups = Cleanups::new();
    let mut exporter = FilesystemExporter::new();

    let view = self
      .orchestrator
      .solve(&ctx, &mut cleanups, &self.request, &mut exporter, &self.cache)
      .await?;

    Ok(FsOutput {
      view,
      _scope: Arc::new(Mutex::new(cleanups)),
    })
  }
}
