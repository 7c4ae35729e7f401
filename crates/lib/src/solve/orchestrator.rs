use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{BufferTail, SolveError};
use crate::action::{ActionEvent, ActionId, ActionSink, Buffers, Console};
use crate::cache::CachePolicy;
use crate::cleanup::Cleanups;
use crate::config::EngineConfig;
use crate::consts::ERROR_LOG_TAIL_LINES;
use crate::daemon::{DaemonHandle, DaemonManager, SolveOpt, SolveResponse};
use crate::errctx::ErrContext;
use crate::executor::TaskGroup;
use crate::export::Exporter;
use crate::progress::{self, ProgressContext};
use crate::request::SolveRequest;
use crate::session::SolveSession;
use crate::workspace::{SizeGuard, WorkspaceError};

/// Capacity of the channel between the daemon call and the progress distributor.
const STATUS_CHANNEL_CAPACITY: usize = 64;

/// Where the actions, logs and console output of a solve go.
#[derive(Clone)]
pub struct SolveContext {
  pub sink: Arc<dyn ActionSink>,
  pub buffers: Buffers,
  /// Console for forwarded logs and warnings.
  pub console: Console,
  pub errctx: ErrContext,
  /// Action the solve action is nested under.
  pub parent: Option<ActionId>,
  /// Prefix of console and buffer names.
  pub log_id: String,
  /// Name of the solve action.
  pub action: String,
  /// Cancelling this token stops the daemon call. Progress is still drained.
  pub cancel: CancellationToken,
}

impl SolveContext {
  pub fn new(sink: Arc<dyn ActionSink>, console: Console) -> Self {
    Self {
      sink,
      buffers: Buffers::new(),
      console,
      errctx: ErrContext::new(),
      parent: None,
      log_id: String::new(),
      action: "buildkit.solve".to_string(),
      cancel: CancellationToken::new(),
    }
  }

  pub fn with_log_id(mut self, log_id: impl Into<String>) -> Self {
    self.log_id = log_id.into();
    self
  }

  pub fn with_parent(mut self, parent: &ActionId) -> Self {
    self.parent = Some(parent.clone());
    self
  }

  pub fn with_action(mut self, action: impl Into<String>) -> Self {
    self.action = action.into();
    self
  }

  pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
    self.cancel = cancel;
    self
  }

  /// Same destinations, fresh buffers and error context.
  pub fn fork(&self) -> Self {
    Self {
      buffers: Buffers::new(),
      errctx: ErrContext::new(),
      ..self.clone()
    }
  }
}

impl std::fmt::Debug for SolveContext {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("SolveContext")
      .field("parent", &self.parent)
      .field("log_id", &self.log_id)
      .field("action", &self.action)
      .finish_non_exhaustive()
  }
}

/// Solves requests against the configured daemon.
pub struct Orchestrator {
  config: EngineConfig,
  manager: Arc<DaemonManager>,
  guard: SizeGuard,
}

impl Orchestrator {
  pub fn new(config: EngineConfig, manager: Arc<DaemonManager>) -> Self {
    Self {
      config,
      manager,
      guard: SizeGuard::default(),
    }
  }

  pub fn with_size_guard(mut self, guard: SizeGuard) -> Self {
    self.guard = guard;
    self
  }

  pub fn config(&self) -> &EngineConfig {
    &self.config
  }

  pub fn manager(&self) -> &Arc<DaemonManager> {
    &self.manager
  }

  /// Solves `req` and turns the result into the exporter's artifact.
  ///
  /// Staging resources of the exporter are kept on `cleanups`; the caller decides
  /// how long the artifact needs them.
  pub async fn solve<X: Exporter>(
    &self,
    ctx: &SolveContext,
    cleanups: &mut Cleanups,
    req: &SolveRequest,
    exporter: &mut X,
    defaults: &CachePolicy,
  ) -> Result<X::Artifact, SolveError> {
    // Configuration errors surface before anything touches the network.
    let cache = CachePolicy::resolve(
      self.config.cache_import.as_ref(),
      self.config.cache_export.as_ref(),
      defaults,
    )?;
    let session = SolveSession::prepare(&self.config.secrets, ctx.console.clone())?;

    let handle = self.manager.connect(&self.config.daemon, &req.target_platform).await?;

    exporter.prepare(cleanups).await?;

    let opt = SolveOpt {
      session: session.clone(),
      definition: req.definition.clone(),
      frontend: req.frontend.clone(),
      frontend_attrs: req.frontend_opts.clone(),
      frontend_inputs: req.frontend_inputs.clone(),
      exports: exporter.exports(),
      cache_imports: cache.imports,
      cache_exports: cache.exports,
      local_dirs: req.local_dir_mappings(),
    };

    if !req.local_dirs.is_empty() && !self.config.skip_workspace_size_check {
      self.check_local_sizes(ctx, req).await?;
    }

    let mut event = ActionEvent::new(ctx.action.clone())
      .category("buildkit")
      .arg("platform", &req.target_platform);
    if let Some(parent) = &ctx.parent {
      event = event.parent(parent);
    }
    if !req.source_label.is_empty() {
      event = event.arg("source", &req.source_label);
    }
    let action = event.start(ctx.sink.clone());

    info!(
      session = %session.id,
      action = %action.id(),
      daemon = %handle.addr,
      platform = %req.target_platform,
      "solving"
    );

    let response = match self.run(ctx, &handle, &session, action.id(), opt).await {
      Ok(response) => response,
      Err(e) => {
        let logs = tails(ctx, action.id());
        ctx.errctx.discard(action.id());
        action.done(Some(e.to_string()));
        return Err(SolveError::WithLogs {
          source: Box::new(e),
          logs,
        });
      }
    };

    let artifact = exporter.provide(&action, &response).await;
    ctx.errctx.discard(action.id());
    match artifact {
      Ok(artifact) => {
        action.done(None);
        Ok(artifact)
      }
      Err(e) => {
        action.done(Some(e.to_string()));
        Err(e.into())
      }
    }
  }

  /// Runs the daemon call and the progress sinks in one task group.
  async fn run(
    &self,
    ctx: &SolveContext,
    handle: &DaemonHandle,
    session: &SolveSession,
    action: &ActionId,
    opt: SolveOpt,
  ) -> Result<SolveResponse, SolveError> {
    let progress_ctx = ProgressContext {
      sink: ctx.sink.clone(),
      buffers: ctx.buffers.clone(),
      console: ctx.console.clone(),
      errctx: ctx.errctx.clone(),
      parent: action.clone(),
      log_id: ctx.log_id.clone(),
      session_id: session.id.clone(),
      plaintext: self.config.plaintext_logging,
      forward_console: self.config.forward_console,
    };

    let mut group = TaskGroup::<SolveError>::child_of("solve", &ctx.cancel);
    let (status_tx, status_rx) = mpsc::channel(STATUS_CHANNEL_CAPACITY);
    for task in progress::setup(&progress_ctx, status_rx) {
      // Detached so the sinks drain and finish even if this future is dropped.
      let drain = tokio::spawn(task);
      group.spawn(async move {
        drain.await?;
        Ok(())
      });
    }

    let (response_tx, response_rx) = oneshot::channel();
    let daemon = handle.daemon.clone();
    let cancel = group.token();
    group.spawn(async move {
      let response = daemon.solve(opt, status_tx, cancel).await?;
      let _ = response_tx.send(response);
      Ok(())
    });

    group.wait().await?;
    response_rx
      .await
      .map_err(|_| SolveError::Task("solve finished without a response".to_string()))
  }

  /// Fails when a local content set exceeds the size limit. Estimation problems only
  /// produce a warning.
  async fn check_local_sizes(&self, ctx: &SolveContext, req: &SolveRequest) -> Result<(), SolveError> {
    let guard = self.guard;
    let locals: Vec<_> = req.local_dirs.iter().map(|l| (l.name(), l.view())).collect();

    let results = tokio::task::spawn_blocking(move || {
      locals
        .into_iter()
        .map(|(name, view)| (name.clone(), guard.check(&name, &view)))
        .collect::<Vec<_>>()
    })
    .await?;

    for (name, result) in results {
      match result {
        Ok(total) => debug!(local = %name, total, "workspace size ok"),
        Err(e @ WorkspaceError::TooLarge { .. }) => return Err(e.into()),
        Err(e) => {
          warn!(local = %name, error = %e, "failed to estimate workspace size");
          ctx.console.warn(&format!("failed to estimate size of {name}: {e}"));
        }
      }
    }
    Ok(())
  }
}

/// Tails of the buffers relevant to a failure of `action`.
fn tails(ctx: &SolveContext, action: &ActionId) -> Vec<BufferTail> {
  ctx
    .errctx
    .relevant_buffers(action)
    .into_iter()
    .filter_map(|name| {
      let buffer = ctx.buffers.get(&name)?;
      Some(BufferTail {
        lines: buffer.tail_lines(ERROR_LOG_TAIL_LINES),
        name,
      })
    })
    .collect()
}
