//! Action tracking.
//!
//! An action is a unit of user-visible work (a solve, a build vertex, a status inside a
//! vertex). Actions are started and completed against an [`ActionSink`], may nest through
//! `parent`, and may record results (`digest`, `config`, ...).
//!
//! Output produced on behalf of an action lands in named [`OutputBuffer`]s, and is
//! optionally echoed to a [`Console`].

mod output;
mod sink;

pub use output::{Buffers, Console, OutputBuffer};
pub use sink::{ActionSink, RecordedEvent, RecordingActionSink, TracingActionSink};

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

static NEXT_ACTION: AtomicU64 = AtomicU64::new(1);

/// Process-unique action identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActionId(pub String);

impl ActionId {
  pub fn generate() -> Self {
    Self(format!("a{:x}", NEXT_ACTION.fetch_add(1, Ordering::Relaxed)))
  }
}

impl From<&str> for ActionId {
  fn from(s: &str) -> Self {
    Self(s.to_string())
  }
}

impl fmt::Display for ActionId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Snapshot of an action as handed to sinks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionEvent {
  pub id: ActionId,
  pub parent: Option<ActionId>,
  pub name: String,
  pub category: Option<String>,
  pub args: BTreeMap<String, String>,
  pub started: SystemTime,
  pub completed: Option<SystemTime>,
  pub cached: bool,
  pub error: Option<String>,
}

impl ActionEvent {
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      id: ActionId::generate(),
      parent: None,
      name: name.into(),
      category: None,
      args: BTreeMap::new(),
      started: SystemTime::now(),
      completed: None,
      cached: false,
      error: None,
    }
  }

  pub fn parent(mut self, parent: &ActionId) -> Self {
    self.parent = Some(parent.clone());
    self
  }

  pub fn category(mut self, category: impl Into<String>) -> Self {
    self.category = Some(category.into());
    self
  }

  pub fn arg(mut self, key: impl Into<String>, value: impl ToString) -> Self {
    self.args.insert(key.into(), value.to_string());
    self
  }

  pub fn started_at(mut self, at: SystemTime) -> Self {
    self.started = at;
    self
  }

  /// Emits a completed, zero-duration cached action.
  pub fn log_cached(mut self, sink: &dyn ActionSink) {
    self.cached = true;
    self.completed = Some(self.started);
    sink.started(&self);
    sink.done(&self);
  }

  pub fn start(self, sink: Arc<dyn ActionSink>) -> RunningAction {
    sink.started(&self);
    RunningAction {
      event: self,
      sink,
      finished: false,
    }
  }
}

/// An action that has been started but not completed.
///
/// Completion consumes the handle, so an action cannot be completed twice. A handle
/// dropped without completion reports the action as abandoned.
pub struct RunningAction {
  event: ActionEvent,
  sink: Arc<dyn ActionSink>,
  finished: bool,
}

/// Error recorded for actions whose handle was dropped before completion.
pub const ABANDONED: &str = "cancelled";

impl RunningAction {
  pub fn id(&self) -> &ActionId {
    &self.event.id
  }

  pub fn name(&self) -> &str {
    &self.event.name
  }

  pub fn add_result(&self, key: &str, value: &str) {
    self.sink.result(&self.event.id, key, value);
  }

  pub fn done(self, error: Option<String>) {
    self.custom_done(SystemTime::now(), error);
  }

  pub fn custom_done(mut self, at: SystemTime, error: Option<String>) {
    self.complete(at, error);
  }

  fn complete(&mut self, at: SystemTime, error: Option<String>) {
    self.finished = true;
    self.event.completed = Some(at);
    self.event.error = error;
    self.sink.done(&self.event);
  }
}

impl Drop for RunningAction {
  fn drop(&mut self) {
    if !self.finished {
      self.complete(SystemTime::now(), Some(ABANDONED.to_string()));
    }
  }
}

impl fmt::Debug for RunningAction {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RunningAction").field("event", &self.event).finish()
  }
}
