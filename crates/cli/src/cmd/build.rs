//! Implementation of the `solvent build` command.
//!
//! Assembles a solve request from the command line, then either explains it or solves it
//! against the configured daemon and reports the exported artifact.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::{Args, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use solvent_lib::action::{Console, TracingActionSink};
use solvent_lib::cache::CachePolicy;
use solvent_lib::cleanup::Cleanups;
use solvent_lib::daemon::DaemonManager;
use solvent_lib::export::{DockerImageExporter, FilesystemExporter, FsView, LayeredImage, OciArchiveExporter, RegistryExporter};
use solvent_lib::platform::Platform;
use solvent_lib::request::{Definition, SolveRequest, SolveRequestBuilder};
use solvent_lib::solve::{Orchestrator, SolveContext};
use solvent_lib::workspace::{LocalContents, Module};

use super::EngineArgs;
use crate::output::{OutputFormat, print_info, print_json, print_stat, print_success, truncate_hash};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum ExportKind {
  /// Docker image tarball, read back into memory
  #[default]
  Docker,
  /// OCI layout tarball
  Oci,
  /// Plain directory tree
  Fs,
  /// Push by digest to a registry
  Registry,
}

#[derive(Debug, Args)]
pub struct BuildArgs {
  /// File holding the serialized build graph
  #[arg(long)]
  pub graph: Option<PathBuf>,

  /// Frontend to run instead of (or on top of) the graph
  #[arg(long)]
  pub frontend: Option<String>,

  /// Frontend option as `key=value`
  #[arg(long = "opt", value_parser = parse_key_value)]
  pub opts: Vec<(String, String)>,

  /// Named frontend input as `name=graph-file`
  #[arg(long = "input", value_parser = parse_key_value)]
  pub inputs: Vec<(String, String)>,

  /// Directory (relative to the module root) shipped to the daemon
  #[arg(long = "local")]
  pub locals: Vec<String>,

  /// Root of the module the local directories belong to
  #[arg(long, default_value = ".")]
  pub module_root: PathBuf,

  /// Module name used in local content names (defaults to the root's directory name)
  #[arg(long)]
  pub module: Option<String>,

  /// Target platform, `os/arch[/variant]` (defaults to the host)
  #[arg(long)]
  pub platform: Option<Platform>,

  #[arg(long, value_enum, default_value_t)]
  pub export: ExportKind,

  /// Repository for `--export registry`
  #[arg(long)]
  pub push: Option<String>,

  /// Use plain HTTP for the registry
  #[arg(long)]
  pub insecure: bool,

  /// Copy a filesystem export here
  #[arg(long)]
  pub out: Option<PathBuf>,

  /// Print the request instead of solving it
  #[arg(long)]
  pub explain: bool,

  #[arg(long, value_enum, default_value_t)]
  pub format: OutputFormat,

  #[command(flatten)]
  pub engine: EngineArgs,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
  match s.split_once('=') {
    Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
    _ => Err(format!("expected key=value, got {s:?}")),
  }
}

fn read_graph(path: &Path) -> Result<Definition> {
  let bytes = std::fs::read(path).with_context(|| format!("Failed to read build graph: {}", path.display()))?;
  Ok(Definition::new(bytes))
}

fn build_request(args: &BuildArgs) -> Result<SolveRequest> {
  let platform = Platform::or_host(args.platform.clone()).context("Failed to determine target platform")?;
  let mut builder = SolveRequestBuilder::new(platform);

  if let Some(graph) = &args.graph {
    builder = builder.definition(read_graph(graph)?);
  }
  if let Some(frontend) = &args.frontend {
    builder = builder.frontend(frontend.clone());
  }
  for (key, value) in &args.opts {
    builder = builder.frontend_opt(key.clone(), value.clone());
  }
  for (name, file) in &args.inputs {
    builder = builder.frontend_input(name.clone(), read_graph(Path::new(file))?);
  }

  if !args.locals.is_empty() {
    let root = std::fs::canonicalize(&args.module_root)
      .with_context(|| format!("Failed to resolve module root: {}", args.module_root.display()))?;
    let name = match &args.module {
      Some(name) => name.clone(),
      None => root
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "module".to_string()),
    };
    let module = Module::new(name, root);
    for local in &args.locals {
      builder = builder.local(LocalContents::new(module.clone(), local.clone()));
    }
  }

  let label = args
    .graph
    .as_ref()
    .map(|g| g.display().to_string())
    .or_else(|| args.frontend.clone())
    .unwrap_or_default();

  Ok(builder.source_label(label).build()?)
}

pub fn cmd_build(args: BuildArgs) -> Result<()> {
  let request = build_request(&args)?;

  if args.explain {
    println!("{}", request.explain()?);
    return Ok(());
  }

  if args.export == ExportKind::Registry && args.push.is_none() {
    bail!("--export registry requires --push <repository>");
  }

  let config = args.engine.to_config();
  let manager = Arc::new(DaemonManager::from_config(&config));
  let orchestrator = Orchestrator::new(config, manager);

  let console = Console::Stdout;
  let cancel = CancellationToken::new();
  let ctx = SolveContext::new(Arc::new(TracingActionSink), console)
    .with_log_id(request.source_label.clone())
    .with_cancel(cancel.clone());
  let defaults = CachePolicy::default();
  let mut cleanups = Cleanups::new();

  let started = Instant::now();
  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  rt.block_on(async {
    tokio::spawn(async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        debug!("interrupted, cancelling solve");
        cancel.cancel();
      }
    });

    match args.export {
      ExportKind::Docker => {
        let mut exporter = DockerImageExporter::new();
        let image = orchestrator
          .solve(&ctx, &mut cleanups, &request, &mut exporter, &defaults)
          .await?;
        report_image(&image, started.elapsed(), args.format)
      }
      ExportKind::Oci => {
        let mut exporter = OciArchiveExporter::new();
        let image = orchestrator
          .solve(&ctx, &mut cleanups, &request, &mut exporter, &defaults)
          .await?;
        report_image(&image, started.elapsed(), args.format)
      }
      ExportKind::Registry => {
        let repository = args.push.clone().unwrap_or_default();
        let mut exporter = RegistryExporter::new(repository, args.insecure);
        let image = orchestrator
          .solve(&ctx, &mut cleanups, &request, &mut exporter, &defaults)
          .await?;
        report_image(&image, started.elapsed(), args.format)
      }
      ExportKind::Fs => {
        let mut exporter = FilesystemExporter::new();
        let view = orchestrator
          .solve(&ctx, &mut cleanups, &request, &mut exporter, &defaults)
          .await?;
        report_fs(&view, args.out.as_deref(), args.format)
      }
    }
  })?;

  cleanups.run();
  Ok(())
}

/// Rounds to whole milliseconds so humantime output stays readable.
fn elapsed_display(elapsed: Duration) -> String {
  let rounded = Duration::from_millis(elapsed.as_millis() as u64);
  humantime::format_duration(rounded).to_string()
}

fn report_image(image: &LayeredImage, elapsed: Duration, format: OutputFormat) -> Result<()> {
  if format.is_json() {
    return print_json(&serde_json::json!({
      "digest": image.digest(),
      "config": image.config_name(),
      "layers": image.layers().len(),
      "duration_ms": elapsed.as_millis() as u64,
    }));
  }

  print_success(&format!("Built image {}", truncate_hash(&image.digest())));
  print_stat("Digest", &image.digest());
  print_stat("Config", image.config_name());
  print_stat("Layers", &image.layers().len().to_string());
  print_stat("Duration", &elapsed_display(elapsed));
  Ok(())
}

fn report_fs(view: &FsView, out: Option<&Path>, format: OutputFormat) -> Result<()> {
  let files = view.files()?;

  if let Some(out) = out {
    for rel in &files {
      let target = out.join(rel);
      if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("Failed to create {}", parent.display()))?;
      }
      std::fs::copy(view.root().join(rel), &target).with_context(|| format!("Failed to copy {}", rel.display()))?;
    }
    debug!(count = files.len(), out = %out.display(), "copied filesystem export");
  }

  if format.is_json() {
    let listed: Vec<String> = files.iter().map(|f| f.display().to_string()).collect();
    return print_json(&serde_json::json!({ "files": listed, "out": out }));
  }

  print_success(&format!("Exported {} file(s)", files.len()));
  match out {
    Some(out) => print_stat("Out", &out.display().to_string()),
    None => print_info("Pass --out <DIR> to keep the exported files"),
  }
  Ok(())
}
