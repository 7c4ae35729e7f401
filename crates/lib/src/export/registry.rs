use std::fmt;

use async_trait::async_trait;
use oci_distribution::Reference;
use oci_distribution::client::{Client, ClientConfig, ClientProtocol};
use oci_distribution::manifest::OciDescriptor;
use oci_distribution::secrets::RegistryAuth;
use tracing::{debug, info};

use super::archive::{DOCKER_MANIFEST_MEDIA_TYPE, OCI_MANIFEST_MEDIA_TYPE};
use super::{ExportError, Exporter, IMAGE_DIGEST_KEY, LayeredImage, Manifest, record_canonical};
use crate::action::RunningAction;
use crate::cleanup::Cleanups;
use crate::daemon::{ExportEntry, SolveResponse};
use crate::util::hash::hash_bytes;

/// Parses a push target. Tags are allowed; digests are not, since the push assigns one.
pub fn parse_repository(reference: &str) -> Result<Reference, ExportError> {
  let invalid = |reason: String| ExportError::InvalidReference {
    reference: reference.to_string(),
    reason,
  };

  let parsed = reference.parse::<Reference>().map_err(|e| invalid(e.to_string()))?;
  if parsed.digest().is_some() {
    return Err(invalid("digests are assigned by the push".to_string()));
  }
  Ok(parsed)
}

/// `registry/repository`, without tag or digest.
fn repository_name(reference: &Reference) -> String {
  format!("{}/{}", reference.registry(), reference.repository())
}

/// Pushes the build result by digest and reads the manifest back from the registry.
pub struct RegistryExporter {
  reference: String,
  insecure: bool,
  repository: Option<Reference>,
  client: Client,
}

impl RegistryExporter {
  pub fn new(reference: impl Into<String>, insecure: bool) -> Self {
    let protocol = if insecure {
      ClientProtocol::Http
    } else {
      ClientProtocol::Https
    };

    Self {
      reference: reference.into(),
      insecure,
      repository: None,
      client: Client::new(ClientConfig {
        protocol,
        ..Default::default()
      }),
    }
  }
}

impl fmt::Debug for RegistryExporter {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RegistryExporter")
      .field("reference", &self.reference)
      .field("insecure", &self.insecure)
      .finish_non_exhaustive()
  }
}

#[async_trait]
impl Exporter for RegistryExporter {
  type Artifact = LayeredImage;

  async fn prepare(&mut self, _cleanups: &mut Cleanups) -> Result<(), ExportError> {
    self.repository = Some(parse_repository(&self.reference)?);
    Ok(())
  }

  fn exports(&self) -> Vec<ExportEntry> {
    let name = match &self.repository {
      Some(repo) => repository_name(repo),
      None => self.reference.clone(),
    };
    vec![
      ExportEntry::new("image")
        .attr("push", "true")
        .attr("push-by-digest", "true")
        .attr("name", name)
        .attr("registry.insecure", self.insecure.to_string()),
    ]
  }

  async fn provide(&self, action: &RunningAction, response: &SolveResponse) -> Result<LayeredImage, ExportError> {
    let repo = self.repository.as_ref().ok_or(ExportError::NotPrepared)?;
    let digest = response
      .exporter_response
      .get(IMAGE_DIGEST_KEY)
      .ok_or(ExportError::DigestMissing)?;

    let pushed = Reference::with_digest(repo.registry().to_string(), repo.repository().to_string(), digest.clone());
    let failed = |e: oci_distribution::errors::OciDistributionError| ExportError::Registry {
      reference: pushed.whole(),
      message: e.to_string(),
    };
    let auth = RegistryAuth::Anonymous;

    info!(repository = %repository_name(repo), digest = %digest, "fetching pushed manifest");
    let (raw_manifest, _) = self
      .client
      .pull_manifest_raw(&pushed, &auth, &[OCI_MANIFEST_MEDIA_TYPE, DOCKER_MANIFEST_MEDIA_TYPE])
      .await
      .map_err(failed)?;

    let actual = hash_bytes(&raw_manifest).to_digest();
    if &actual != digest {
      return Err(ExportError::DigestMismatch {
        expected: digest.clone(),
        actual,
      });
    }

    let manifest: Manifest =
      serde_json::from_slice(&raw_manifest).map_err(|e| ExportError::InvalidImage(format!("manifest: {e}")))?;
    debug!(config = %manifest.config.digest, "fetching image config");
    let mut config = Vec::new();
    let config_descriptor = OciDescriptor {
      media_type: manifest.config.media_type.clone(),
      digest: manifest.config.digest.clone(),
      size: manifest.config.size as i64,
      ..Default::default()
    };
    self
      .client
      .pull_blob(&pushed, &config_descriptor, &mut config)
      .await
      .map_err(failed)?;

    let image = LayeredImage::from_parts(raw_manifest, config)?;
    record_canonical(action, &image);
    Ok(image)
  }
}
