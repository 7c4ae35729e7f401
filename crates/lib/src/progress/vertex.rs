use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::SystemTime;

use tracing::debug;

use super::{ProgressContext, ProgressSink};
use crate::action::{ActionEvent, ActionId, ActionSink, Buffers, Console, OutputBuffer, RunningAction};
use crate::daemon::{SolveStatus, Vertex, VertexLog, VertexStatus, digest_hex};
use crate::errctx::ErrContext;

const NEVER_FINISHED: &str = "never finished";

/// Console and buffer name for a stream: `{log_id}:{key}{suffix}`.
pub fn console_name(log_id: &str, key: &str, suffix: &str) -> String {
  let log_id = if log_id.is_empty() { "buildkit" } else { log_id };
  format!("{log_id}:{key}{suffix}")
}

/// stdout and stderr share one buffer; any other stream gets its own.
fn stream_suffix(stream: i32) -> String {
  match stream {
    1 | 2 => String::new(),
    n => format!(":{n}"),
  }
}

struct VertexState {
  action: RunningAction,
  statuses: HashMap<String, RunningAction>,
}

impl VertexState {
  /// Closes nested statuses, then the vertex itself, with the same time and error.
  fn close(self, at: SystemTime, error: Option<String>) {
    for (_, status) in self.statuses {
      status.custom_done(at, error.clone());
    }
    self.action.custom_done(at, error);
  }
}

/// Mirrors daemon vertices as actions nested under the solve action.
pub struct VertexTracker {
  sink: Arc<dyn ActionSink>,
  buffers: Buffers,
  console: Option<Console>,
  errctx: ErrContext,
  parent: ActionId,
  log_id: String,
  running: HashMap<String, VertexState>,
  finished: HashSet<String>,
  logs: HashMap<String, OutputBuffer>,
  vertex_logs: HashMap<String, Vec<String>>,
}

impl VertexTracker {
  pub fn new(ctx: &ProgressContext) -> Self {
    Self {
      sink: ctx.sink.clone(),
      buffers: ctx.buffers.clone(),
      console: ctx.forward_console.then(|| ctx.console.clone()),
      errctx: ctx.errctx.clone(),
      parent: ctx.parent.clone(),
      log_id: ctx.log_id.clone(),
      running: HashMap::new(),
      finished: HashSet::new(),
      logs: HashMap::new(),
      vertex_logs: HashMap::new(),
    }
  }

  fn event(&self, v: &Vertex) -> ActionEvent {
    ActionEvent::new(v.name.clone())
      .parent(&self.parent)
      .category("buildkit")
      .arg("vertex", &v.digest)
      .started_at(v.started.unwrap_or_else(SystemTime::now))
  }

  fn vertex(&mut self, v: &Vertex) {
    if self.finished.contains(&v.digest) {
      return;
    }

    if v.cached {
      self.finished.insert(v.digest.clone());
      match self.running.remove(&v.digest) {
        Some(state) => state.close(v.completed.unwrap_or_else(SystemTime::now), None),
        None => self.event(v).log_cached(self.sink.as_ref()),
      }
      return;
    }

    if v.started.is_some() && !self.running.contains_key(&v.digest) {
      debug!(vertex = %v.digest, name = %v.name, "vertex started");
      let action = self.event(v).start(self.sink.clone());
      self.running.insert(
        v.digest.clone(),
        VertexState {
          action,
          statuses: HashMap::new(),
        },
      );
    }

    let Some(completed) = v.completed else {
      return;
    };
    let Some(state) = self.running.remove(&v.digest) else {
      return;
    };

    self.finished.insert(v.digest.clone());
    let error = (!v.error.is_empty()).then(|| v.error.clone());
    if error.is_some() {
      for name in self.vertex_logs.get(&v.digest).into_iter().flatten() {
        self.errctx.mark_has_error(&self.parent, name);
      }
    }
    state.close(completed, error);
  }

  fn status(&mut self, s: &VertexStatus) {
    let Some(state) = self.running.get_mut(&s.vertex) else {
      return;
    };

    match s.completed {
      None => {
        if !state.statuses.contains_key(&s.id) {
          let name = if s.name.is_empty() { &s.id } else { &s.name };
          let action = ActionEvent::new(name.clone())
            .parent(state.action.id())
            .category("buildkit")
            .started_at(s.started.unwrap_or_else(SystemTime::now))
            .start(self.sink.clone());
          state.statuses.insert(s.id.clone(), action);
        }
      }
      Some(completed) => {
        if let Some(action) = state.statuses.remove(&s.id) {
          action.custom_done(completed, None);
        }
      }
    }
  }

  fn log(&mut self, log: &VertexLog) {
    let name = console_name(&self.log_id, digest_hex(&log.vertex), &stream_suffix(log.stream));

    let buffer = match self.logs.get(&name) {
      Some(buffer) => buffer.clone(),
      None => {
        let buffer = self.buffers.open(&name);
        self.errctx.add_log(&self.parent, &name);
        self.vertex_logs.entry(log.vertex.clone()).or_default().push(name.clone());
        self.logs.insert(name.clone(), buffer.clone());
        buffer
      }
    };

    buffer.write(&log.data);
    if let Some(console) = &self.console {
      console.write(&name, &log.data);
    }
  }
}

impl ProgressSink for VertexTracker {
  fn handle(&mut self, status: &SolveStatus) {
    for v in &status.vertexes {
      self.vertex(v);
    }
    for s in &status.statuses {
      self.status(s);
    }
    for log in &status.logs {
      self.log(log);
    }
  }

  fn finish(&mut self) {
    let now = SystemTime::now();
    for (digest, state) in self.running.drain() {
      debug!(vertex = %digest, "closing vertex at end of stream");
      state.close(now, Some(NEVER_FINISHED.to_string()));
    }
  }
}
