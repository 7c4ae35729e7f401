//! Daemon transport that drives the `buildctl` command line client.
//!
//! Progress is read as raw JSON from stderr, one [`SolveStatus`] per line. Exporter
//! results come back through the metadata file. The serialized graph is written to
//! stdin when no frontend is used.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::client::{BuildDaemon, DaemonConnector, DaemonError};
use super::types::{ExportEntry, ExportOutput, SolveOpt, SolveResponse, SolveStatus, WorkerInfo};
use crate::cache::CacheEntry;
use crate::session::SecretSource;

/// Lines of non-progress stderr kept for error messages.
const STDERR_TAIL: usize = 20;

/// Registry authentication problems reported by the client's auth provider.
const AUTH_FAILURES: &[&str] = &["failed to authorize", "unauthorized", "error getting credentials"];

const CONNECTION_FAILURES: &[&str] = &[
  "connection refused",
  "connection error",
  "failed to dial",
  "no such file or directory",
  "no such container",
  "is not running",
  "code = unavailable",
  "context deadline exceeded",
];

#[derive(Debug, Clone)]
pub struct BuildctlConnector {
  binary: PathBuf,
}

impl BuildctlConnector {
  pub fn new(binary: impl Into<PathBuf>) -> Self {
    Self { binary: binary.into() }
  }
}

#[async_trait]
impl DaemonConnector for BuildctlConnector {
  async fn connect(&self, addr: &str) -> Result<Arc<dyn BuildDaemon>, DaemonError> {
    Ok(Arc::new(BuildctlDaemon {
      binary: self.binary.clone(),
      addr: addr.to_string(),
    }))
  }
}

#[derive(Debug, Clone)]
pub struct BuildctlDaemon {
  binary: PathBuf,
  addr: String,
}

impl BuildctlDaemon {
  fn classify(&self, stderr: &str) -> DaemonError {
    let lower = stderr.to_ascii_lowercase();
    if CONNECTION_FAILURES.iter().any(|needle| lower.contains(needle)) {
      DaemonError::Connect {
        addr: self.addr.clone(),
        message: stderr.trim().to_string(),
      }
    } else {
      DaemonError::Rpc(stderr.trim().to_string())
    }
  }
}

#[async_trait]
impl BuildDaemon for BuildctlDaemon {
  async fn list_workers(&self) -> Result<Vec<WorkerInfo>, DaemonError> {
    let output = Command::new(&self.binary)
      .args(["--addr", &self.addr, "debug", "workers", "--format", "{{json .}}"])
      .output()
      .await
      .map_err(|e| DaemonError::Connect {
        addr: self.addr.clone(),
        message: format!("failed to run {}: {e}", self.binary.display()),
      })?;

    if !output.status.success() {
      return Err(self.classify(&String::from_utf8_lossy(&output.stderr)));
    }

    serde_json::from_slice(&output.stdout).map_err(|e| DaemonError::Rpc(format!("unexpected workers output: {e}")))
  }

  async fn solve(
    &self,
    opt: SolveOpt,
    status: mpsc::Sender<SolveStatus>,
    cancel: CancellationToken,
  ) -> Result<SolveResponse, DaemonError> {
    if !opt.frontend_inputs.is_empty() {
      return Err(DaemonError::Unsupported("frontend inputs".to_string()));
    }

    let metadata = tempfile::Builder::new().prefix("solvent-metadata-").suffix(".json").tempfile()?;
    let args = solve_args(&self.addr, &opt, metadata.path());
    let stdin_graph = match (&opt.frontend, &opt.definition) {
      (None, Some(def)) => Some(def.as_bytes().to_vec()),
      _ => None,
    };

    debug!(session = %opt.session.id, ?args, "starting buildctl solve");

    let mut child = Command::new(&self.binary)
      .args(&args)
      .stdin(if stdin_graph.is_some() { Stdio::piped() } else { Stdio::null() })
      .stdout(Stdio::null())
      .stderr(Stdio::piped())
      .kill_on_drop(true)
      .spawn()
      .map_err(|e| DaemonError::Connect {
        addr: self.addr.clone(),
        message: format!("failed to run {}: {e}", self.binary.display()),
      })?;

    if let (Some(graph), Some(mut stdin)) = (stdin_graph, child.stdin.take()) {
      stdin.write_all(&graph).await?;
      stdin.shutdown().await?;
    }

    let stderr = child
      .stderr
      .take()
      .ok_or_else(|| DaemonError::Rpc("buildctl stderr unavailable".to_string()))?;

    let auth_warnings = opt.session.auth_warnings().cloned();
    let reader = async move {
      let mut tail = VecDeque::with_capacity(STDERR_TAIL);
      let mut stderr = BufReader::new(stderr);
      let mut raw = Vec::new();

      // Read to EOF no matter what the lines contain; closing the pipe early kills buildctl.
      loop {
        raw.clear();
        match stderr.read_until(b'\n', &mut raw).await {
          Ok(0) => break,
          Ok(_) => {}
          Err(e) => {
            warn!(error = %e, "failed to read buildctl output");
            break;
          }
        }

        let decoded = String::from_utf8_lossy(&raw);
        let line = decoded.trim_end_matches(['\n', '\r']);
        if line.is_empty() {
          continue;
        }

        match serde_json::from_str::<SolveStatus>(line) {
          Ok(event) => {
            // A closed receiver only means nobody is listening anymore.
            let _ = status.send(event).await;
          }
          Err(_) => {
            trace!(%line, "buildctl");
            if let Some(console) = auth_warnings.as_ref().filter(|_| is_auth_failure(line)) {
              console.warn(line);
            }
            if tail.len() == STDERR_TAIL {
              tail.pop_front();
            }
            tail.push_back(line.to_string());
          }
        }
      }

      tail
    };

    let waiter = async {
      let exited = tokio::select! {
        exit = child.wait() => Some(exit),
        _ = cancel.cancelled() => None,
      };

      match exited {
        Some(exit) => exit.map_err(DaemonError::from),
        None => {
          warn!(session = %opt.session.id, "cancelling solve");
          let _ = child.kill().await;
          Err(DaemonError::Cancelled)
        }
      }
    };

    let (tail, exit) = tokio::join!(reader, waiter);
    let exit = exit?;

    if !exit.success() {
      let message = if tail.is_empty() {
        format!("buildctl exited with {exit}")
      } else {
        Vec::from(tail).join("\n")
      };
      return Err(DaemonError::Solve(message));
    }

    Ok(SolveResponse {
      exporter_response: read_metadata(metadata.path()).await?,
    })
  }
}

fn is_auth_failure(line: &str) -> bool {
  let lower = line.to_ascii_lowercase();
  AUTH_FAILURES.iter().any(|needle| lower.contains(needle))
}

async fn read_metadata(path: &Path) -> Result<BTreeMap<String, String>, DaemonError> {
  let raw = tokio::fs::read(path).await?;
  if raw.iter().all(u8::is_ascii_whitespace) {
    return Ok(BTreeMap::new());
  }

  let value: serde_json::Map<String, serde_json::Value> =
    serde_json::from_slice(&raw).map_err(|e| DaemonError::Rpc(format!("unexpected metadata file: {e}")))?;

  Ok(
    value
      .into_iter()
      .map(|(k, v)| match v {
        serde_json::Value::String(s) => (k, s),
        other => (k, other.to_string()),
      })
      .collect(),
  )
}

/// Quotes a CSV field when it would otherwise be split.
fn csv_field(value: &str) -> String {
  if value.contains([',', '"']) {
    format!("\"{}\"", value.replace('"', "\"\""))
  } else {
    value.to_string()
  }
}

fn render_attrs(kind: &str, attrs: &BTreeMap<String, String>) -> String {
  let mut parts = vec![format!("type={}", csv_field(kind))];
  parts.extend(attrs.iter().map(|(k, v)| format!("{k}={}", csv_field(v))));
  parts.join(",")
}

fn render_export(entry: &ExportEntry) -> String {
  let mut attrs = entry.attrs.clone();
  match &entry.output {
    Some(ExportOutput::File(path)) | Some(ExportOutput::Dir(path)) => {
      attrs.insert("dest".to_string(), path.display().to_string());
    }
    None => {}
  }
  render_attrs(&entry.kind, &attrs)
}

fn render_cache(entry: &CacheEntry) -> String {
  render_attrs(&entry.kind, &entry.attrs)
}

/// Command line for `buildctl build`.
pub fn solve_args(addr: &str, opt: &SolveOpt, metadata: &Path) -> Vec<String> {
  let mut args: Vec<String> = vec![
    "--addr".into(),
    addr.into(),
    "build".into(),
    "--progress".into(),
    "rawjson".into(),
    "--metadata-file".into(),
    metadata.display().to_string(),
  ];

  if let Some(frontend) = &opt.frontend {
    args.extend(["--frontend".into(), frontend.clone()]);
    for (k, v) in &opt.frontend_attrs {
      args.extend(["--opt".into(), format!("{k}={v}")]);
    }
  }

  for (name, path) in &opt.local_dirs {
    args.extend(["--local".into(), format!("{name}={}", path.display())]);
  }

  for entry in &opt.exports {
    args.extend(["--output".into(), render_export(entry)]);
  }

  for entry in &opt.cache_imports {
    args.extend(["--import-cache".into(), render_cache(entry)]);
  }

  for entry in &opt.cache_exports {
    args.extend(["--export-cache".into(), render_cache(entry)]);
  }

  for secret in opt.session.secrets() {
    let source = match &secret.source {
      SecretSource::Env(var) => format!("env={var}"),
      SecretSource::File(path) => format!("src={}", path.display()),
    };
    args.extend(["--secret".into(), format!("id={},{source}", secret.id)]);
  }

  if let Some((id, socket)) = opt.session.ssh_agent() {
    args.extend(["--ssh".into(), format!("{id}={}", socket.display())]);
  }

  args
}
