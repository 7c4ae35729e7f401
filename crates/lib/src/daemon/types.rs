//! Daemon wire types.
//!
//! Progress events use the daemon's own JSON shape (`Vertexes`, `Statuses`, ...), with
//! RFC 3339 timestamps and base64 log payloads, so raw progress output can be decoded
//! directly and re-encoded by the JSON sink.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::cache::CacheEntry;
use crate::platform::{Platform, PlatformError};
use crate::request::Definition;
use crate::session::SolveSession;

/// One node of the build graph as reported by the daemon.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Vertex {
  pub digest: String,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub inputs: Vec<String>,
  #[serde(default)]
  pub name: String,
  #[serde(default, with = "rfc3339_opt", skip_serializing_if = "Option::is_none")]
  pub started: Option<SystemTime>,
  #[serde(default, with = "rfc3339_opt", skip_serializing_if = "Option::is_none")]
  pub completed: Option<SystemTime>,
  #[serde(default, skip_serializing_if = "std::ops::Not::not")]
  pub cached: bool,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub error: String,
}

/// Progress of a sub-task (pull, transfer, ...) inside a vertex.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VertexStatus {
  #[serde(rename = "ID")]
  pub id: String,
  pub vertex: String,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub name: String,
  #[serde(default)]
  pub total: i64,
  #[serde(default)]
  pub current: i64,
  #[serde(default, with = "rfc3339_opt", skip_serializing_if = "Option::is_none")]
  pub timestamp: Option<SystemTime>,
  #[serde(default, with = "rfc3339_opt", skip_serializing_if = "Option::is_none")]
  pub started: Option<SystemTime>,
  #[serde(default, with = "rfc3339_opt", skip_serializing_if = "Option::is_none")]
  pub completed: Option<SystemTime>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VertexLog {
  pub vertex: String,
  /// 1 is stdout, 2 is stderr.
  #[serde(default)]
  pub stream: i32,
  #[serde(default, with = "base64_bytes")]
  pub data: Vec<u8>,
  #[serde(default, with = "rfc3339_opt", skip_serializing_if = "Option::is_none")]
  pub timestamp: Option<SystemTime>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VertexWarning {
  pub vertex: String,
  #[serde(default)]
  pub level: i32,
  #[serde(default, with = "base64_bytes")]
  pub short: Vec<u8>,
  #[serde(default, rename = "URL", skip_serializing_if = "String::is_empty")]
  pub url: String,
}

/// One progress event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SolveStatus {
  #[serde(default, deserialize_with = "null_as_empty")]
  pub vertexes: Vec<Vertex>,
  #[serde(default, deserialize_with = "null_as_empty")]
  pub statuses: Vec<VertexStatus>,
  #[serde(default, deserialize_with = "null_as_empty")]
  pub logs: Vec<VertexLog>,
  #[serde(default, deserialize_with = "null_as_empty")]
  pub warnings: Vec<VertexWarning>,
}

/// Hex part of a `algorithm:hex` digest.
pub fn digest_hex(digest: &str) -> &str {
  digest.split_once(':').map(|(_, hex)| hex).unwrap_or(digest)
}

/// Where an exporter writes its output on the caller's machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportOutput {
  File(PathBuf),
  Dir(PathBuf),
}

/// A daemon-level export directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportEntry {
  pub kind: String,
  pub attrs: BTreeMap<String, String>,
  pub output: Option<ExportOutput>,
}

impl ExportEntry {
  pub fn new(kind: impl Into<String>) -> Self {
    Self {
      kind: kind.into(),
      attrs: BTreeMap::new(),
      output: None,
    }
  }

  pub fn attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.attrs.insert(key.into(), value.into());
    self
  }

  pub fn output(mut self, output: ExportOutput) -> Self {
    self.output = Some(output);
    self
  }
}

/// Everything the daemon needs for one solve.
#[derive(Debug, Clone)]
pub struct SolveOpt {
  pub session: SolveSession,
  pub definition: Option<Definition>,
  pub frontend: Option<String>,
  pub frontend_attrs: BTreeMap<String, String>,
  pub frontend_inputs: BTreeMap<String, Definition>,
  pub exports: Vec<ExportEntry>,
  pub cache_imports: Vec<CacheEntry>,
  pub cache_exports: Vec<CacheEntry>,
  /// Daemon-side mount name to host directory.
  pub local_dirs: BTreeMap<String, PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SolveResponse {
  pub exporter_response: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerPlatform {
  pub os: String,
  pub architecture: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub variant: Option<String>,
}

impl TryFrom<&WorkerPlatform> for Platform {
  type Error = PlatformError;

  fn try_from(p: &WorkerPlatform) -> Result<Self, Self::Error> {
    let mut s = format!("{}/{}", p.os, p.architecture);
    if let Some(variant) = p.variant.as_deref().filter(|v| !v.is_empty()) {
      s.push('/');
      s.push_str(variant);
    }
    s.parse()
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WorkerInfo {
  #[serde(rename = "ID")]
  pub id: String,
  #[serde(default, deserialize_with = "null_as_empty")]
  pub platforms: Vec<WorkerPlatform>,
}

fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
  D: serde::Deserializer<'de>,
  T: Deserialize<'de>,
{
  Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

/// `Option<SystemTime>` as RFC 3339 with nanoseconds. Numeric UTC offsets are accepted
/// on input; output is always UTC.
pub(crate) mod rfc3339_opt {
  use super::*;
  use serde::{Deserializer, Serializer, de::Error};

  pub fn serialize<S: Serializer>(value: &Option<SystemTime>, s: S) -> Result<S::Ok, S::Error> {
    match value {
      Some(t) => s.serialize_str(&humantime::format_rfc3339_nanos(*t).to_string()),
      None => s.serialize_none(),
    }
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<SystemTime>, D::Error> {
    match Option::<String>::deserialize(d)? {
      Some(s) => parse(&s).map(Some).map_err(D::Error::custom),
      None => Ok(None),
    }
  }

  pub fn parse(s: &str) -> Result<SystemTime, String> {
    if let Ok(t) = humantime::parse_rfc3339_weak(s.trim_end_matches('Z')) {
      return Ok(t);
    }

    // `2023-04-01T10:00:00.5+02:00`: shift to UTC and retry.
    let (base, offset) = s.split_at(s.len().saturating_sub(6));
    let sign = match offset.as_bytes().first() {
      Some(b'+') => 1i64,
      Some(b'-') => -1i64,
      _ => return Err(format!("invalid timestamp {s:?}")),
    };
    let (hours, minutes) = offset[1..]
      .split_once(':')
      .ok_or_else(|| format!("invalid offset in {s:?}"))?;
    let hours: u64 = hours.parse().map_err(|_| format!("invalid offset in {s:?}"))?;
    let minutes: u64 = minutes.parse().map_err(|_| format!("invalid offset in {s:?}"))?;
    let shift = Duration::from_secs(hours * 3600 + minutes * 60);

    let local = humantime::parse_rfc3339_weak(base).map_err(|e| format!("invalid timestamp {s:?}: {e}"))?;
    if sign > 0 {
      local.checked_sub(shift)
    } else {
      local.checked_add(shift)
    }
    .ok_or_else(|| format!("timestamp out of range: {s:?}"))
  }
}

mod base64_bytes {
  use base64::Engine;
  use base64::engine::general_purpose::STANDARD;
  use serde::{Deserialize, Deserializer, Serializer, de::Error};

  pub fn serialize<S: Serializer>(value: &[u8], s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&STANDARD.encode(value))
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
    match Option::<String>::deserialize(d)? {
      Some(s) => STANDARD.decode(s).map_err(D::Error::custom),
      None => Ok(Vec::new()),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::UNIX_EPOCH;

  #[test]
  fn decodes_raw_progress_line() {
    let line = r#"{"Vertexes":[{"Digest":"sha256:abc","Name":"[1/2] RUN make","Started":"2023-04-01T10:00:00.5Z"}],
      "Statuses":null,
      "Logs":[{"Vertex":"sha256:abc","Stream":1,"Data":"aGVsbG8K","Timestamp":"2023-04-01T10:00:01Z"}]}"#;

    let status: SolveStatus = serde_json::from_str(line).unwrap();
    assert_eq!(status.vertexes.len(), 1);
    assert!(status.statuses.is_empty());
    assert_eq!(status.logs[0].data, b"hello\n");
    assert_eq!(
      status.vertexes[0].started,
      Some(UNIX_EPOCH + Duration::from_millis(1_680_343_200_500))
    );
    assert!(status.vertexes[0].completed.is_none());
  }

  #[test]
  fn accepts_numeric_offsets() {
    let utc = rfc3339_opt::parse("2023-04-01T10:00:00Z").unwrap();
    let shifted = rfc3339_opt::parse("2023-04-01T12:00:00+02:00").unwrap();
    assert_eq!(utc, shifted);
    assert!(rfc3339_opt::parse("yesterday").is_err());
  }

  #[test]
  fn encodes_in_daemon_shape() {
    let status = SolveStatus {
      vertexes: vec![Vertex {
        digest: "sha256:abc".to_string(),
        name: "build".to_string(),
        cached: true,
        ..Default::default()
      }],
      ..Default::default()
    };

    let value = serde_json::to_value(&status).unwrap();
    assert_eq!(value["Vertexes"][0]["Digest"], "sha256:abc");
    assert_eq!(value["Vertexes"][0]["Cached"], true);
    assert!(value["Vertexes"][0].get("Error").is_none());
  }

  #[test]
  fn worker_platform_converts() {
    let worker: WorkerInfo = serde_json::from_str(
      r#"{"ID":"w1","Platforms":[{"os":"linux","architecture":"arm64","variant":"v8"}]}"#,
    )
    .unwrap();
    let platform = Platform::try_from(&worker.platforms[0]).unwrap();
    assert_eq!(platform.to_string(), "linux/arm64/v8");
  }

  #[test]
  fn digest_hex_strips_algorithm() {
    assert_eq!(digest_hex("sha256:abc"), "abc");
    assert_eq!(digest_hex("abc"), "abc");
  }
}
