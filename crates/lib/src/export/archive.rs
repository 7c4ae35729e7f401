//! Reading built images back from tarballs.
//!
//! Two layouts are understood: the docker `save` layout (`manifest.json` listing config
//! and layer files) and the OCI image layout (`index.json` pointing at content
//! addressed blobs). Either way the result is a [`LayeredImage`].

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::ExportError;
use crate::util::hash::hash_bytes;

pub const OCI_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";
pub const OCI_LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar";
pub const DOCKER_MANIFEST_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub media_type: String,
  pub digest: String,
  pub size: u64,
}

/// An image manifest, OCI or docker v2 schema 2 (the shapes coincide).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
  pub schema_version: u32,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub media_type: String,
  pub config: Descriptor,
  pub layers: Vec<Descriptor>,
}

/// A built image: manifest, config and layer descriptors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayeredImage {
  pub manifest: Manifest,
  /// Raw manifest bytes, as digested.
  pub raw_manifest: Vec<u8>,
  pub config: Vec<u8>,
}

impl LayeredImage {
  /// Image digest: the digest of the raw manifest.
  pub fn digest(&self) -> String {
    hash_bytes(&self.raw_manifest).to_digest()
  }

  /// Config digest, also known as the image id.
  pub fn config_name(&self) -> &str {
    &self.manifest.config.digest
  }

  pub fn layers(&self) -> &[Descriptor] {
    &self.manifest.layers
  }

  /// Builds an image from a manifest and its config.
  pub fn from_parts(raw_manifest: Vec<u8>, config: Vec<u8>) -> Result<Self, ExportError> {
    let manifest: Manifest = serde_json::from_slice(&raw_manifest).map_err(|e| ExportError::InvalidImage(format!("manifest: {e}")))?;
    let actual = hash_bytes(&config).to_digest();
    if actual != manifest.config.digest {
      return Err(ExportError::DigestMismatch {
        expected: manifest.config.digest.clone(),
        actual,
      });
    }
    Ok(Self {
      manifest,
      raw_manifest,
      config,
    })
  }

  /// Reads an image tarball, gunzipping it first when it starts with the gzip magic.
  pub fn from_archive(path: &Path) -> Result<Self, ExportError> {
    let gzipped = is_gzip(path)?;
    let mut index = read_entries(path, gzipped, |p| p == "manifest.json" || p == "index.json")?;

    if let Some(raw) = index.remove("index.json") {
      return read_oci_layout(path, gzipped, &raw);
    }

    if let Some(raw) = index.remove("manifest.json") {
      return read_docker_layout(path, gzipped, &raw);
    }

    Err(ExportError::InvalidImage(format!(
      "{} has neither index.json nor manifest.json",
      path.display()
    )))
  }
}

#[derive(Debug, Deserialize)]
struct OciIndex {
  manifests: Vec<Descriptor>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DockerSaveEntry {
  config: String,
  layers: Vec<String>,
}

fn blob_path(digest: &str) -> Result<String, ExportError> {
  let (algorithm, hex) = digest
    .split_once(':')
    .ok_or_else(|| ExportError::InvalidImage(format!("malformed digest {digest:?}")))?;
  Ok(format!("blobs/{algorithm}/{hex}"))
}

fn read_oci_layout(path: &Path, gzipped: bool, raw_index: &[u8]) -> Result<LayeredImage, ExportError> {
  let index: OciIndex = serde_json::from_slice(raw_index).map_err(|e| ExportError::InvalidImage(format!("index.json: {e}")))?;
  let descriptor = index
    .manifests
    .first()
    .ok_or_else(|| ExportError::InvalidImage("index.json lists no manifests".to_string()))?;

  let manifest_path = blob_path(&descriptor.digest)?;
  let mut blobs = read_entries(path, gzipped, |p| p == manifest_path)?;
  let raw_manifest = blobs
    .remove(&manifest_path)
    .ok_or_else(|| ExportError::InvalidImage(format!("missing manifest blob {manifest_path}")))?;

  let actual = hash_bytes(&raw_manifest).to_digest();
  if actual != descriptor.digest {
    return Err(ExportError::DigestMismatch {
      expected: descriptor.digest.clone(),
      actual,
    });
  }

  let manifest: Manifest = serde_json::from_slice(&raw_manifest).map_err(|e| ExportError::InvalidImage(format!("manifest: {e}")))?;
  let config_path = blob_path(&manifest.config.digest)?;
  let mut blobs = read_entries(path, gzipped, |p| p == config_path)?;
  let config = blobs
    .remove(&config_path)
    .ok_or_else(|| ExportError::InvalidImage(format!("missing config blob {config_path}")))?;

  LayeredImage::from_parts(raw_manifest, config)
}

/// The docker layout carries no manifest; a canonical OCI manifest is synthesized from
/// the config and the uncompressed layer tarballs.
fn read_docker_layout(path: &Path, gzipped: bool, raw: &[u8]) -> Result<LayeredImage, ExportError> {
  let entries: Vec<DockerSaveEntry> = serde_json::from_slice(raw).map_err(|e| ExportError::InvalidImage(format!("manifest.json: {e}")))?;
  let entry = entries
    .into_iter()
    .next()
    .ok_or_else(|| ExportError::InvalidImage("manifest.json lists no images".to_string()))?;

  let config_path = normalize(&entry.config);
  let mut files = read_entries(path, gzipped, |p| p == config_path)?;
  let config = files
    .remove(&config_path)
    .ok_or_else(|| ExportError::InvalidImage(format!("missing config {config_path}")))?;

  let wanted: HashSet<String> = entry.layers.iter().map(|l| normalize(l)).collect();
  let hashed = hash_entries(path, gzipped, |p| wanted.contains(p))?;

  let layers = entry
    .layers
    .iter()
    .map(|l| {
      let l = normalize(l);
      hashed
        .get(&l)
        .map(|(digest, size)| Descriptor {
          media_type: OCI_LAYER_MEDIA_TYPE.to_string(),
          digest: digest.clone(),
          size: *size,
        })
        .ok_or_else(|| ExportError::InvalidImage(format!("missing layer {l}")))
    })
    .collect::<Result<Vec<_>, _>>()?;

  let manifest = Manifest {
    schema_version: 2,
    media_type: OCI_MANIFEST_MEDIA_TYPE.to_string(),
    config: Descriptor {
      media_type: OCI_CONFIG_MEDIA_TYPE.to_string(),
      digest: hash_bytes(&config).to_digest(),
      size: config.len() as u64,
    },
    layers,
  };

  let raw_manifest = serde_json::to_vec(&manifest).map_err(|e| ExportError::InvalidImage(e.to_string()))?;
  Ok(LayeredImage {
    manifest,
    raw_manifest,
    config,
  })
}

fn normalize(p: &str) -> String {
  p.trim_start_matches("./").to_string()
}

fn is_gzip(path: &Path) -> Result<bool, ExportError> {
  let mut file = File::open(path)?;
  let mut magic = [0u8; 2];
  let n = file.read(&mut magic)?;
  file.seek(SeekFrom::Start(0))?;
  Ok(n == 2 && magic == [0x1f, 0x8b])
}

fn open_archive(path: &Path, gzipped: bool) -> Result<tar::Archive<Box<dyn Read>>, ExportError> {
  let file = BufReader::new(File::open(path)?);
  let reader: Box<dyn Read> = if gzipped {
    Box::new(GzDecoder::new(file))
  } else {
    Box::new(file)
  };
  Ok(tar::Archive::new(reader))
}

/// Reads the full contents of every entry `wanted` accepts.
fn read_entries(path: &Path, gzipped: bool, wanted: impl Fn(&str) -> bool) -> Result<HashMap<String, Vec<u8>>, ExportError> {
  let mut out = HashMap::new();
  let mut archive = open_archive(path, gzipped)?;

  for entry in archive.entries()? {
    let mut entry = entry?;
    let name = normalize(&entry.path()?.to_string_lossy());
    if wanted(&name) {
      let mut data = Vec::new();
      entry.read_to_end(&mut data)?;
      out.insert(name, data);
    }
  }

  Ok(out)
}

/// Streams every entry `wanted` accepts through SHA-256. Returns digest and size.
fn hash_entries(path: &Path, gzipped: bool, wanted: impl Fn(&str) -> bool) -> Result<HashMap<String, (String, u64)>, ExportError> {
  let mut out = HashMap::new();
  let mut archive = open_archive(path, gzipped)?;

  for entry in archive.entries()? {
    let mut entry = entry?;
    let name = normalize(&entry.path()?.to_string_lossy());
    if !wanted(&name) {
      continue;
    }

    let mut hasher = Sha256::new();
    let size = std::io::copy(&mut entry, &mut hasher)?;
    out.insert(name, (format!("sha256:{}", hex::encode(hasher.finalize())), size));
  }

  Ok(out)
}
