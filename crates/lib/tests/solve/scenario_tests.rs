//! End-to-end solves against the fake daemon.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serial_test::serial;
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use solvent_lib::cache::{CacheEntry, CachePolicy};
use solvent_lib::cleanup::Cleanups;
use solvent_lib::compute::{Computable, ComputeGraph};
use solvent_lib::consts::{DAEMON_IMAGE, DEFAULT_CONTAINER_NAME, TEXT_LOG_OUTPUT};
use solvent_lib::daemon::{ContainerState, DaemonError, ExportOutput, SolveStatus, Vertex, digest_hex};
use solvent_lib::export::{ExportError, FilesystemExporter};
use solvent_lib::request::{Definition, SolveRequest, SolveRequestBuilder};
use solvent_lib::solve::{FsBuild, ImageBuild, SolveError, TargetName};
use solvent_lib::workspace::{LocalContents, Module, WorkspaceError};

use super::common::*;

fn module_with_files(count: usize) -> (TempDir, LocalContents) {
  let temp = TempDir::new().unwrap();
  let app = temp.path().join("app");
  std::fs::create_dir_all(app.join("src")).unwrap();
  for i in 0..count {
    std::fs::write(app.join(format!("src/file-{i}.txt")), format!("contents {i}")).unwrap();
  }
  let local = LocalContents::new(Module::new("github.com/acme/web", temp.path()), "app");
  (temp, local)
}

fn request(local: Option<LocalContents>) -> SolveRequest {
  let mut builder = SolveRequestBuilder::new(linux_amd64())
    .definition(Definition::new(b"graph-bytes".to_vec()))
    .source_label("web:build");
  if let Some(local) = local {
    builder = builder.local(local);
  }
  builder.build().unwrap()
}

fn fs_build(h: &Harness, request: SolveRequest) -> FsBuild {
  FsBuild {
    orchestrator: h.orchestrator.clone(),
    ctx: h.ctx.clone(),
    request,
    cache: CachePolicy::default(),
  }
}

#[tokio::test]
async fn filesystem_export_of_local_files() {
  let (_module, local) = module_with_files(10);
  let daemon = FakeDaemon::new(vertex_script("sha256:c0ffee", "copy app", "copied\n", None), Outcome::CopyLocals);
  let h = Harness::new(daemon.clone());

  let output = fs_build(&h, request(Some(local.clone()))).compute().await.unwrap();

  let files = output.view.files().unwrap();
  assert_eq!(files.len(), 10);
  assert!(files.contains(&PathBuf::from("src/file-3.txt")));
  assert_eq!(output.view.read("src/file-3.txt").unwrap(), b"contents 3");

  let opt = daemon.last_solve();
  assert_eq!(opt.local_dirs.get(&local.name()), Some(&local.abs_path()));
  assert_eq!(opt.exports[0].kind, "local");
  assert_eq!(opt.session.id.len(), 8);

  let completed = h.sink.completed();
  let solve = completed.iter().find(|e| e.name == "buildkit.build-fs").unwrap();
  assert!(solve.error.is_none());
  let vertex = completed.iter().find(|e| e.name == "copy app").unwrap();
  assert_eq!(vertex.parent.as_ref(), Some(&solve.id));

  // The managed container was installed on first use.
  assert_eq!(h.runtime.ops(), vec![format!("run {DEFAULT_CONTAINER_NAME}")]);

  let root = output.view.root().to_path_buf();
  drop(output);
  assert!(!root.exists());
}

#[tokio::test]
async fn oversized_local_contents_abort_before_solving() {
  let temp = TempDir::new().unwrap();
  let app = temp.path().join("app");
  std::fs::create_dir_all(&app).unwrap();
  std::fs::File::create(app.join("dump.bin"))
    .unwrap()
    .set_len(29 * 1024 * 1024)
    .unwrap();
  for i in 0..11 {
    std::fs::File::create(app.join(format!("asset-{i:02}.bin")))
      .unwrap()
      .set_len(1024 * 1024 - i)
      .unwrap();
  }
  let local = LocalContents::new(Module::new("github.com/acme/web", temp.path()), "app");

  let daemon = FakeDaemon::new(vec![], Outcome::CopyLocals);
  let h = Harness::new(daemon.clone());
  let mut cleanups = Cleanups::new();
  let mut exporter = FilesystemExporter::new();

  let err = h
    .orchestrator
    .solve(&h.ctx, &mut cleanups, &request(Some(local)), &mut exporter, &CachePolicy::default())
    .await
    .unwrap_err();

  let SolveError::Workspace(WorkspaceError::TooLarge { largest, .. }) = &err else {
    panic!("expected the size guard to fire, got {err}");
  };
  assert_eq!(largest.len(), 10);
  assert_eq!(largest[0].path, "dump.bin");
  assert!(largest.windows(2).all(|w| w[0].size >= w[1].size));

  let message = err.to_string();
  assert!(message.contains("unexpectedly large"));
  assert!(message.contains("dump.bin (29.0 MiB)"));
  assert!(message.contains("--skip-workspace-size-check"));
  assert_eq!(daemon.solve_count(), 0);

  // Staging happened before the check and is released with the scope.
  let Some(ExportOutput::Dir(staged)) = exporter_output(&exporter) else {
    panic!("exporter was not staged");
  };
  assert!(staged.exists());
  drop(cleanups);
  assert!(!staged.exists());
}

fn exporter_output(exporter: &FilesystemExporter) -> Option<ExportOutput> {
  use solvent_lib::export::Exporter;
  exporter.exports().into_iter().next().and_then(|e| e.output)
}

#[tokio::test]
async fn size_check_can_be_skipped() {
  let temp = TempDir::new().unwrap();
  let app = temp.path().join("app");
  std::fs::create_dir_all(&app).unwrap();
  std::fs::File::create(app.join("huge.bin"))
    .unwrap()
    .set_len(40 * 1024 * 1024)
    .unwrap();
  let local = LocalContents::new(Module::new("m", temp.path()), "app");

  let daemon = FakeDaemon::new(vec![], Outcome::Respond(HashMap::new()));
  let mut config = test_config();
  config.skip_workspace_size_check = true;
  let h = Harness::with_config(daemon.clone(), config);

  let mut cleanups = Cleanups::new();
  h.orchestrator
    .solve(
      &h.ctx,
      &mut cleanups,
      &request(Some(local)),
      &mut FilesystemExporter::new(),
      &CachePolicy::default(),
    )
    .await
    .unwrap();
  assert_eq!(daemon.solve_count(), 1);
}

#[tokio::test]
async fn registry_export_without_digest_fails() {
  let daemon = FakeDaemon::new(vec![], Outcome::Respond(HashMap::new()));
  let h = Harness::new(daemon.clone());

  let build = ImageBuild {
    orchestrator: h.orchestrator.clone(),
    ctx: h.ctx.clone(),
    request: request(None),
    target: Some(TargetName::new("registry.example.com/acme/web")),
    cache: CachePolicy::default(),
  };
  let err = build.compute().await.unwrap_err();

  assert!(matches!(err, SolveError::Export(ExportError::DigestMissing)));
  assert!(err.to_string().contains("digest is missing from result"));

  let export = &daemon.last_solve().exports[0];
  assert_eq!(export.kind, "image");
  assert_eq!(
    export.attrs.get("name").map(String::as_str),
    Some("registry.example.com/acme/web")
  );

  let solve = h
    .sink
    .completed()
    .into_iter()
    .find(|e| e.name == "buildkit.build-image")
    .unwrap();
  assert_eq!(solve.error.as_deref(), Some("digest is missing from result"));
}

#[tokio::test]
async fn credentialed_targets_fall_back_to_docker_export() {
  let daemon = FakeDaemon::new(vec![], Outcome::WriteDockerImage);
  let h = Harness::new(daemon.clone());

  let mut target = TargetName::new("private.example.com/acme/web");
  target.requires_credentials = true;
  let build = ImageBuild {
    orchestrator: h.orchestrator.clone(),
    ctx: h.ctx.clone(),
    request: request(None),
    target: Some(target),
    cache: CachePolicy::default(),
  };
  let image = build.compute().await.unwrap();

  let config_digest = format!("sha256:{}", hex_digest(IMAGE_CONFIG));
  assert_eq!(image.config_name(), config_digest);
  assert_eq!(image.layers().len(), 1);

  let opt = daemon.last_solve();
  assert_eq!(opt.exports[0].kind, "docker");
  let Some(ExportOutput::File(staged)) = opt.exports[0].output.clone() else {
    panic!("docker export must target a file");
  };
  assert!(!staged.exists(), "staged tarball should be released");

  let solve = h
    .sink
    .completed()
    .into_iter()
    .find(|e| e.name == "buildkit.build-image")
    .unwrap();
  let results = h.sink.results(&solve.id);
  assert_eq!(results.get("digest"), Some(&image.digest()));
  assert_eq!(results.get("config"), Some(&config_digest));
}

fn hex_digest(bytes: &[u8]) -> String {
  let mut hasher = Sha256::new();
  hasher.update(bytes);
  format!("{:x}", hasher.finalize())
}

#[tokio::test]
async fn failures_carry_relevant_log_tails() {
  let mut script = vertex_script("sha256:aaa", "install", "added 12 packages\n", None);
  script.extend(vertex_script(
    "sha256:bbb",
    "compile",
    "line 1\nline 2\nline 3\nline 4\nline 5\nline 6\nerror TS2304\n",
    Some("process did not complete successfully: exit code 2"),
  ));
  let daemon = FakeDaemon::new(script, Outcome::Fail("exit code 2".to_string()));
  let h = Harness::new(daemon);

  let err = fs_build(&h, request(None)).compute().await.unwrap_err();

  assert!(matches!(err.root(), SolveError::Daemon(_)));
  let logs = err.logs();
  assert_eq!(logs.len(), 1, "only the failing vertex is relevant: {logs:?}");
  assert_eq!(logs[0].name, "web:bbb");
  assert_eq!(logs[0].lines.len(), 5);
  assert_eq!(logs[0].lines.last().map(String::as_str), Some("error TS2304"));
  assert!(err.to_string().contains("[web:bbb]"));
}

#[tokio::test]
async fn failure_without_vertex_logs_falls_back_to_text_log() {
  let script = vec![SolveStatus {
    vertexes: vec![Vertex {
      digest: "sha256:ccc".into(),
      name: "resolve image config".into(),
      started: Some(at(0)),
      ..Default::default()
    }],
    ..Default::default()
  }];
  let daemon = FakeDaemon::new(script, Outcome::Fail("pull access denied".to_string()));
  let h = Harness::new(daemon);

  let err = fs_build(&h, request(None)).compute().await.unwrap_err();
  let logs = err.logs();
  assert_eq!(logs.len(), 1);
  assert_eq!(logs[0].name, TEXT_LOG_OUTPUT);
  assert!(logs[0].lines[0].ends_with("#1 resolve image config"));

  // The stream ended with the vertex still open; it is closed, not leaked.
  let vertex = h
    .sink
    .completed()
    .into_iter()
    .find(|e| e.name == "resolve image config")
    .unwrap();
  assert_eq!(vertex.error.as_deref(), Some("never finished"));
  assert!(h.sink.running().is_empty());
}

#[tokio::test]
async fn pre_digest_mode_deduplicates_identical_builds() {
  let (_module, local) = module_with_files(3);
  let daemon = FakeDaemon::new(vec![], Outcome::CopyLocals);
  let mut config = test_config();
  config.pre_digest_local_inputs = true;
  let h = Harness::with_config(daemon.clone(), config);
  let graph = Arc::new(ComputeGraph::new());

  let build = fs_build(&h, request(Some(local.clone())));
  let inputs = build.inputs().await.unwrap();
  assert!(!inputs.non_deterministic);
  assert!(inputs.dependencies.is_empty());

  let first = fs_build(&h, request(Some(local.clone())));
  let second = fs_build(&h, request(Some(local)));
  let (a, b) = tokio::join!(graph.compute(&first), graph.compute(&second));
  assert_eq!(a.unwrap().view, b.unwrap().view);
  assert_eq!(daemon.solve_count(), 1);
}

#[tokio::test]
async fn observe_mode_never_reuses_outputs() {
  let (_module, local) = module_with_files(3);
  let daemon = FakeDaemon::new(vec![], Outcome::CopyLocals);
  let h = Harness::new(daemon.clone());
  let graph = ComputeGraph::new();

  let build = fs_build(&h, request(Some(local.clone())));
  let inputs = build.inputs().await.unwrap();
  assert!(inputs.non_deterministic);
  assert_eq!(inputs.dependencies.len(), 1);
  assert_eq!(inputs.dependencies[0].name, "local0:contents");

  graph.compute(&build).await.unwrap();
  graph.compute(&fs_build(&h, request(Some(local)))).await.unwrap();
  assert_eq!(daemon.solve_count(), 2);
}

#[tokio::test]
async fn outdated_daemon_is_replaced() {
  let daemon = FakeDaemon::new(vec![], Outcome::Respond(HashMap::new()));
  let h = Harness::new(daemon);
  h.runtime.containers.lock().unwrap().insert(
    DEFAULT_CONTAINER_NAME.to_string(),
    ContainerState {
      running: true,
      image: "moby/buildkit:v0.10.0".to_string(),
      host_network: true,
    },
  );

  let mut cleanups = Cleanups::new();
  h.orchestrator
    .solve(
      &h.ctx,
      &mut cleanups,
      &request(None),
      &mut FilesystemExporter::new(),
      &CachePolicy::default(),
    )
    .await
    .unwrap();

  assert_eq!(
    h.runtime.ops(),
    vec![
      format!("remove {DEFAULT_CONTAINER_NAME}"),
      format!("run {DEFAULT_CONTAINER_NAME}")
    ]
  );
  let containers = h.runtime.containers.lock().unwrap();
  assert_eq!(containers[DEFAULT_CONTAINER_NAME].image, DAEMON_IMAGE);
}

#[tokio::test]
#[serial]
async fn missing_gha_credentials_fail_before_contacting_the_daemon() {
  let daemon = FakeDaemon::new(vec![], Outcome::Respond(HashMap::new()));
  let mut config = test_config();
  config.cache_export = Some(CacheEntry::new("gha"));
  let h = Harness::with_config(daemon.clone(), config);

  let result = temp_env::async_with_vars(
    [("ACTIONS_RUNTIME_TOKEN", None::<&str>), ("ACTIONS_CACHE_URL", None)],
    async {
      let mut cleanups = Cleanups::new();
      h.orchestrator
        .solve(
          &h.ctx,
          &mut cleanups,
          &request(None),
          &mut FilesystemExporter::new(),
          &CachePolicy::default(),
        )
        .await
    },
  )
  .await;

  assert!(matches!(result, Err(SolveError::Cache(_))));
  assert!(h.runtime.ops().is_empty());
  assert_eq!(daemon.solve_count(), 0);
}

#[tokio::test]
#[serial]
async fn global_cache_override_and_gha_credentials_reach_the_daemon() {
  let daemon = FakeDaemon::new(vec![], Outcome::Respond(HashMap::new()));
  let mut config = test_config();
  config.cache_import = Some(CacheEntry::new("gha"));
  let h = Harness::with_config(daemon.clone(), config);

  let defaults = CachePolicy {
    imports: vec![CacheEntry::new("registry").with_attr("ref", "ghcr.io/acme/cache")],
    exports: vec![CacheEntry::new("registry").with_attr("ref", "ghcr.io/acme/cache")],
  };

  temp_env::async_with_vars(
    [
      ("ACTIONS_RUNTIME_TOKEN", Some("t0ken")),
      ("ACTIONS_CACHE_URL", Some("https://cache.example.com/")),
    ],
    async {
      let mut cleanups = Cleanups::new();
      h.orchestrator
        .solve(
          &h.ctx,
          &mut cleanups,
          &request(None),
          &mut FilesystemExporter::new(),
          &defaults,
        )
        .await
        .unwrap();
    },
  )
  .await;

  let opt = daemon.last_solve();
  assert_eq!(opt.cache_imports.len(), 1);
  assert_eq!(opt.cache_imports[0].kind, "gha");
  assert_eq!(opt.cache_imports[0].attrs.get("token").map(String::as_str), Some("t0ken"));
  assert_eq!(opt.cache_exports, defaults.exports);
}

#[tokio::test]
async fn text_log_is_kept_after_success() {
  let daemon = FakeDaemon::new(
    vertex_script("sha256:ddd", "build", "ok\n", None),
    Outcome::Respond(HashMap::new()),
  );
  let h = Harness::new(daemon);
  let mut cleanups = Cleanups::new();
  h.orchestrator
    .solve(
      &h.ctx,
      &mut cleanups,
      &request(None),
      &mut FilesystemExporter::new(),
      &CachePolicy::default(),
    )
    .await
    .unwrap();

  let text = h.ctx.buffers.get(TEXT_LOG_OUTPUT).unwrap().to_string_lossy();
  assert!(text.contains("#1 build"));
  assert!(text.contains("#1 ok"));
  assert!(text.contains("#1 DONE 1.0s"));
}

#[tokio::test]
async fn failing_vertex_error_is_the_solve_error() {
  let mut script = vertex_script("sha256:aaa", "install", "added 12 packages\n", None);
  script.extend(vertex_script(
    "sha256:bbb",
    "RUN make",
    "cc -c main.c\nmake: *** [all] Error 2\n",
    Some("process \"/bin/sh -c make\" did not complete successfully: exit code: 2"),
  ));
  let daemon = FakeDaemon::new(script, Outcome::VertexError);
  let h = Harness::new(daemon);

  let err = fs_build(&h, request(None)).compute().await.unwrap_err();

  let SolveError::Daemon(DaemonError::Solve(message)) = err.root() else {
    panic!("unexpected root error: {err}");
  };
  assert_eq!(
    message,
    "process \"/bin/sh -c make\" did not complete successfully: exit code: 2"
  );

  let logs = err.logs();
  assert_eq!(logs.len(), 1, "only the failing vertex is relevant: {logs:?}");
  assert_eq!(logs[0].name, format!("web:{}", digest_hex("sha256:bbb")));
  assert_eq!(logs[0].lines, vec!["cc -c main.c", "make: *** [all] Error 2"]);

  let vertex = h
    .sink
    .completed()
    .into_iter()
    .find(|e| e.name == "RUN make")
    .unwrap();
  assert_eq!(vertex.error.as_deref(), Some(message.as_str()));
}

fn long_running_script() -> Vec<SolveStatus> {
  vec![SolveStatus {
    vertexes: vec![Vertex {
      digest: "sha256:1009".into(),
      name: "long step".into(),
      started: Some(at(0)),
      ..Default::default()
    }],
    ..Default::default()
  }]
}

#[tokio::test]
async fn caller_cancellation_drains_progress() {
  let daemon = FakeDaemon::new(long_running_script(), Outcome::AwaitCancel);
  let h = Harness::new(daemon);
  let cancel = CancellationToken::new();
  let mut build = fs_build(&h, request(None));
  build.ctx = build.ctx.with_cancel(cancel.clone());

  let trigger = tokio::spawn(async move {
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();
  });
  let err = build.compute().await.unwrap_err();
  trigger.await.unwrap();

  assert!(matches!(err.root(), SolveError::Daemon(DaemonError::Cancelled)));
  assert!(h.sink.running().is_empty(), "open actions: {:?}", h.sink.running());

  let completed = h.sink.completed();
  let step = completed.iter().find(|e| e.name == "long step").unwrap();
  assert_eq!(step.error.as_deref(), Some("never finished"));
  let solve = completed.iter().find(|e| e.name == "buildkit.build-fs").unwrap();
  assert!(solve.error.is_some());
}

#[tokio::test]
async fn dropped_solve_still_closes_actions() {
  let daemon = FakeDaemon::new(long_running_script(), Outcome::AwaitCancel);
  let h = Harness::new(daemon);
  let build = fs_build(&h, request(None));

  let timed_out = tokio::time::timeout(Duration::from_millis(200), build.compute()).await;
  assert!(timed_out.is_err());

  // The sinks finish on their own tasks once the aborted daemon call drops its sender.
  for _ in 0..100 {
    if h.sink.running().is_empty() {
      break;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
  assert!(h.sink.running().is_empty(), "open actions: {:?}", h.sink.running());

  let completed = h.sink.completed();
  let step = completed.iter().find(|e| e.name == "long step").unwrap();
  assert_eq!(step.error.as_deref(), Some("never finished"));
  let solve = completed.iter().find(|e| e.name == "buildkit.build-fs").unwrap();
  assert_eq!(solve.error.as_deref(), Some(solvent_lib::action::ABANDONED));
}

#[tokio::test(flavor = "current_thread")]
async fn local_hashing_yields_to_other_tasks() {
  let (_module, local) = module_with_files(50);
  let daemon = FakeDaemon::new(vec![], Outcome::CopyLocals);
  let mut config = test_config();
  config.pre_digest_local_inputs = true;
  let h = Harness::with_config(daemon, config);

  let ran = Arc::new(AtomicBool::new(false));
  let flag = ran.clone();
  tokio::spawn(async move { flag.store(true, Ordering::SeqCst) });

  let inputs = fs_build(&h, request(Some(local))).inputs().await.unwrap();
  assert!(!inputs.non_deterministic);
  assert!(ran.load(Ordering::SeqCst), "hashing blocked the runtime thread");
}
