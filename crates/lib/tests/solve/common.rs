//! Fake daemon and container runtime for end-to-end solve tests.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use solvent_lib::action::{Console, RecordingActionSink};
use solvent_lib::config::EngineConfig;
use solvent_lib::daemon::types::WorkerPlatform;
use solvent_lib::daemon::{
  Backoff, BuildDaemon, ContainerRuntime, ContainerSpec, ContainerState, DaemonConnector, DaemonError, DaemonManager,
  ExportOutput, SolveOpt, SolveResponse, SolveStatus, Vertex, VertexLog, WorkerInfo,
};
use solvent_lib::platform::{Arch, Os, Platform};
use solvent_lib::solve::{Orchestrator, SolveContext};

/// What the fake daemon does once its progress script has been sent.
#[derive(Clone)]
pub enum Outcome {
  /// Copy every local mount into a directory export and succeed.
  CopyLocals,
  /// Succeed with this exporter response.
  Respond(HashMap<String, String>),
  /// Write a single-layer docker tarball into a file export and succeed.
  WriteDockerImage,
  /// Fail with the given message.
  Fail(String),
  /// Fail with the error of the first failed vertex in the script.
  VertexError,
  /// Keep the solve open until it is cancelled.
  AwaitCancel,
}

pub struct FakeDaemon {
  pub script: Vec<SolveStatus>,
  pub outcome: Outcome,
  pub solves: Mutex<Vec<SolveOpt>>,
}

impl FakeDaemon {
  pub fn new(script: Vec<SolveStatus>, outcome: Outcome) -> Arc<Self> {
    Arc::new(Self {
      script,
      outcome,
      solves: Mutex::new(Vec::new()),
    })
  }

  pub fn solve_count(&self) -> usize {
    self.solves.lock().unwrap().len()
  }

  pub fn last_solve(&self) -> SolveOpt {
    self.solves.lock().unwrap().last().cloned().expect("no solve recorded")
  }
}

fn copy_tree(from: &Path, to: &Path) {
  for entry in walkdir::WalkDir::new(from) {
    let entry = entry.unwrap();
    let rel = entry.path().strip_prefix(from).unwrap();
    let target = to.join(rel);
    if entry.file_type().is_dir() {
      std::fs::create_dir_all(&target).unwrap();
    } else {
      std::fs::copy(entry.path(), &target).unwrap();
    }
  }
}

fn append(builder: &mut tar::Builder<std::fs::File>, path: &str, data: &[u8]) {
  let mut header = tar::Header::new_gnu();
  header.set_size(data.len() as u64);
  header.set_mode(0o644);
  header.set_cksum();
  builder.append_data(&mut header, path, data).unwrap();
}

/// The config blob of the image written by [`Outcome::WriteDockerImage`].
pub const IMAGE_CONFIG: &[u8] = br#"{"architecture":"amd64","os":"linux","config":{}}"#;

fn write_docker_tarball(path: &Path) {
  let manifest = br#"[{"Config":"config.json","RepoTags":[],"Layers":["l1/layer.tar"]}]"#;
  let mut builder = tar::Builder::new(std::fs::File::create(path).unwrap());
  append(&mut builder, "config.json", IMAGE_CONFIG);
  append(&mut builder, "l1/layer.tar", b"layer contents");
  append(&mut builder, "manifest.json", manifest);
  builder.finish().unwrap();
}

#[async_trait]
impl BuildDaemon for FakeDaemon {
  async fn list_workers(&self) -> Result<Vec<WorkerInfo>, DaemonError> {
    Ok(vec![WorkerInfo {
      id: "worker-1".to_string(),
      platforms: vec![WorkerPlatform {
        os: "linux".to_string(),
        architecture: "amd64".to_string(),
        variant: None,
      }],
    }])
  }

  async fn solve(
    &self,
    opt: SolveOpt,
    status: mpsc::Sender<SolveStatus>,
    cancel: CancellationToken,
  ) -> Result<SolveResponse, DaemonError> {
    self.solves.lock().unwrap().push(opt.clone());

    for event in &self.script {
      if status.send(event.clone()).await.is_err() {
        break;
      }
    }

    match &self.outcome {
      Outcome::CopyLocals => {
        let dest = opt.exports.iter().find_map(|e| match &e.output {
          Some(ExportOutput::Dir(dir)) => Some(dir.clone()),
          _ => None,
        });
        if let Some(dest) = dest {
          for source in opt.local_dirs.values() {
            copy_tree(source, &dest);
          }
        }
        Ok(SolveResponse::default())
      }
      Outcome::Respond(response) => Ok(SolveResponse {
        exporter_response: response.clone().into_iter().collect(),
      }),
      Outcome::WriteDockerImage => {
        for export in &opt.exports {
          if let Some(ExportOutput::File(path)) = &export.output {
            write_docker_tarball(path);
          }
        }
        Ok(SolveResponse::default())
      }
      Outcome::Fail(message) => {
        if cancel.is_cancelled() {
          return Err(DaemonError::Cancelled);
        }
        Err(DaemonError::Solve(message.clone()))
      }
      Outcome::VertexError => {
        let error = self
          .script
          .iter()
          .flat_map(|s| &s.vertexes)
          .find(|v| !v.error.is_empty())
          .map(|v| v.error.clone())
          .unwrap_or_default();
        Err(DaemonError::Solve(error))
      }
      Outcome::AwaitCancel => {
        cancel.cancelled().await;
        Err(DaemonError::Cancelled)
      }
    }
  }
}

pub struct FakeConnector {
  pub daemon: Arc<FakeDaemon>,
}

#[async_trait]
impl DaemonConnector for FakeConnector {
  async fn connect(&self, _addr: &str) -> Result<Arc<dyn BuildDaemon>, DaemonError> {
    Ok(self.daemon.clone())
  }
}

/// Container runtime keeping container state in memory.
#[derive(Default)]
pub struct FakeRuntime {
  pub containers: Mutex<HashMap<String, ContainerState>>,
  pub ops: Mutex<Vec<String>>,
}

impl FakeRuntime {
  pub fn ops(&self) -> Vec<String> {
    self.ops.lock().unwrap().clone()
  }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
  async fn inspect(&self, name: &str) -> Result<Option<ContainerState>, DaemonError> {
    Ok(self.containers.lock().unwrap().get(name).cloned())
  }

  async fn run(&self, spec: &ContainerSpec) -> Result<(), DaemonError> {
    self.ops.lock().unwrap().push(format!("run {}", spec.name));
    self.containers.lock().unwrap().insert(
      spec.name.clone(),
      ContainerState {
        running: true,
        image: spec.image.clone(),
        host_network: spec.host_network,
      },
    );
    Ok(())
  }

  async fn start(&self, name: &str) -> Result<(), DaemonError> {
    self.ops.lock().unwrap().push(format!("start {name}"));
    if let Some(state) = self.containers.lock().unwrap().get_mut(name) {
      state.running = true;
    }
    Ok(())
  }

  async fn remove(&self, name: &str) -> Result<(), DaemonError> {
    self.ops.lock().unwrap().push(format!("remove {name}"));
    self.containers.lock().unwrap().remove(name);
    Ok(())
  }
}

/// An orchestrator wired to fakes.
pub struct Harness {
  pub daemon: Arc<FakeDaemon>,
  pub runtime: Arc<FakeRuntime>,
  pub orchestrator: Arc<Orchestrator>,
  pub sink: Arc<RecordingActionSink>,
  pub ctx: SolveContext,
}

impl Harness {
  pub fn new(daemon: Arc<FakeDaemon>) -> Self {
    Self::with_config(daemon, test_config())
  }

  pub fn with_config(daemon: Arc<FakeDaemon>, config: EngineConfig) -> Self {
    let runtime = Arc::new(FakeRuntime::default());
    let connector = Arc::new(FakeConnector { daemon: daemon.clone() });
    let manager = DaemonManager::new(runtime.clone(), connector).with_backoff(Backoff {
      initial: Duration::from_millis(1),
      cap: Duration::from_millis(5),
      max_attempts: 3,
    });
    let orchestrator = Arc::new(Orchestrator::new(config, Arc::new(manager)));
    let sink = Arc::new(RecordingActionSink::default());
    let ctx = SolveContext::new(sink.clone(), Console::capture()).with_log_id("web");
    Self {
      daemon,
      runtime,
      orchestrator,
      sink,
      ctx,
    }
  }
}

pub fn test_config() -> EngineConfig {
  EngineConfig {
    pre_digest_local_inputs: false,
    ..EngineConfig::default()
  }
}

pub fn linux_amd64() -> Platform {
  Platform::new(Os::Linux, Arch::Amd64)
}

pub fn at(secs: u64) -> SystemTime {
  SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000 + secs)
}

/// A vertex that starts, logs a line and completes, optionally with an error.
pub fn vertex_script(digest: &str, name: &str, log: &str, error: Option<&str>) -> Vec<SolveStatus> {
  let started = Vertex {
    digest: digest.to_string(),
    name: name.to_string(),
    started: Some(at(0)),
    ..Default::default()
  };
  let mut completed = started.clone();
  completed.completed = Some(at(1));
  completed.error = error.unwrap_or_default().to_string();

  vec![
    SolveStatus {
      vertexes: vec![started],
      ..Default::default()
    },
    SolveStatus {
      logs: vec![VertexLog {
        vertex: digest.to_string(),
        stream: 1,
        data: log.as_bytes().to_vec(),
        timestamp: Some(at(0)),
      }],
      ..Default::default()
    },
    SolveStatus {
      vertexes: vec![completed],
      ..Default::default()
    },
  ]
}
