//! [`ContainerRuntime`] backed by the `docker` command line.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use super::client::DaemonError;
use super::lifecycle::{ContainerRuntime, ContainerSpec, ContainerState};

#[derive(Debug, Clone)]
pub struct DockerCli {
  binary: PathBuf,
}

impl Default for DockerCli {
  fn default() -> Self {
    Self::new("docker")
  }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Inspected {
  state: InspectedState,
  config: InspectedConfig,
  host_config: InspectedHostConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectedState {
  running: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectedConfig {
  image: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectedHostConfig {
  #[serde(default)]
  network_mode: String,
}

struct Output {
  success: bool,
  stdout: String,
  stderr: String,
}

impl DockerCli {
  pub fn new(binary: impl Into<PathBuf>) -> Self {
    Self { binary: binary.into() }
  }

  async fn docker(&self, op: &'static str, container: &str, args: &[String]) -> Result<Output, DaemonError> {
    debug!(binary = %self.binary.display(), ?args, "running docker");

    let output = Command::new(&self.binary)
      .args(args)
      .output()
      .await
      .map_err(|e| DaemonError::Runtime {
        op,
        container: container.to_string(),
        message: e.to_string(),
      })?;

    Ok(Output {
      success: output.status.success(),
      stdout: String::from_utf8_lossy(&output.stdout).to_string(),
      stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
  }

  async fn checked(&self, op: &'static str, container: &str, args: &[String]) -> Result<Output, DaemonError> {
    let out = self.docker(op, container, args).await?;
    if !out.success {
      return Err(DaemonError::Runtime {
        op,
        container: container.to_string(),
        message: out.stderr,
      });
    }
    Ok(out)
  }
}

fn is_not_found(stderr: &str) -> bool {
  let lower = stderr.to_ascii_lowercase();
  lower.contains("no such container") || lower.contains("no such object")
}

/// Arguments of `docker run` for `spec`. Volume flags are sorted for stable output.
pub fn run_args(spec: &ContainerSpec) -> Vec<String> {
  let mut args = vec![
    "run".to_string(),
    "-d".to_string(),
    "--restart".to_string(),
    "always".to_string(),
    "--name".to_string(),
    spec.name.clone(),
  ];

  if spec.host_network {
    args.push("--network".to_string());
    args.push("host".to_string());
  }

  for (volume, target) in &spec.volumes {
    args.push("-v".to_string());
    args.push(format!("{volume}:{target}"));
  }

  if spec.privileged {
    args.push("--privileged".to_string());
  }

  args.push(spec.image.clone());
  args
}

#[async_trait]
impl ContainerRuntime for DockerCli {
  async fn inspect(&self, name: &str) -> Result<Option<ContainerState>, DaemonError> {
    let args = vec!["container".to_string(), "inspect".to_string(), name.to_string()];
    let out = self.docker("inspect", name, &args).await?;

    if !out.success {
      if is_not_found(&out.stderr) {
        return Ok(None);
      }
      return Err(DaemonError::Runtime {
        op: "inspect",
        container: name.to_string(),
        message: out.stderr,
      });
    }

    let parsed: Vec<Inspected> = serde_json::from_str(&out.stdout).map_err(|e| DaemonError::Runtime {
      op: "inspect",
      container: name.to_string(),
      message: format!("unexpected output: {e}"),
    })?;

    Ok(parsed.into_iter().next().map(|c| ContainerState {
      running: c.state.running,
      image: c.config.image,
      host_network: c.host_config.network_mode == "host",
    }))
  }

  async fn run(&self, spec: &ContainerSpec) -> Result<(), DaemonError> {
    self.checked("run", &spec.name, &run_args(spec)).await?;
    Ok(())
  }

  async fn start(&self, name: &str) -> Result<(), DaemonError> {
    let args = vec!["start".to_string(), name.to_string()];
    self.checked("start", name, &args).await?;
    Ok(())
  }

  async fn remove(&self, name: &str) -> Result<(), DaemonError> {
    let args = vec!["rm".to_string(), "-f".to_string(), "-v".to_string(), name.to_string()];
    let out = self.docker("remove", name, &args).await?;
    if out.success || is_not_found(&out.stderr) {
      return Ok(());
    }
    Err(DaemonError::Runtime {
      op: "remove",
      container: name.to_string(),
      message: out.stderr,
    })
  }
}
