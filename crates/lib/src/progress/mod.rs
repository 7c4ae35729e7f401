//! Fan-out of daemon progress events to independent sinks.
//!
//! One distributor task reads the daemon's [`SolveStatus`] stream and copies every event
//! into an unbounded queue per sink. Sinks never apply back-pressure to the daemon, and
//! each one drains its queue completely: queues are only closed by the distributor once
//! the input stream ends, so a cancelled solve still has every buffered event rendered
//! and every open vertex closed.

mod json;
mod text;
mod vertex;

pub use json::JsonSink;
pub use text::{TextSink, TimestampWriter};
pub use vertex::{VertexTracker, console_name};

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use crate::action::{ActionId, ActionSink, Buffers, Console};
use crate::consts::{JSON_LOG_OUTPUT, TEXT_LOG_OUTPUT};
use crate::daemon::SolveStatus;
use crate::errctx::ErrContext;

/// A progress task, ready to be spawned.
pub type ProgressTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Consumer of progress events.
pub trait ProgressSink: Send + 'static {
  fn handle(&mut self, status: &SolveStatus);

  /// Called once after the last event.
  fn finish(&mut self) {}
}

/// Where progress of one solve ends up.
#[derive(Clone)]
pub struct ProgressContext {
  pub sink: Arc<dyn ActionSink>,
  pub buffers: Buffers,
  pub console: Console,
  pub errctx: ErrContext,
  /// The solve action every vertex action is nested under.
  pub parent: ActionId,
  pub log_id: String,
  pub session_id: String,
  /// Write the text log to the console and skip vertex tracking.
  pub plaintext: bool,
  /// Echo vertex logs to the console.
  pub forward_console: bool,
}

impl std::fmt::Debug for ProgressContext {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ProgressContext")
      .field("parent", &self.parent)
      .field("log_id", &self.log_id)
      .field("session_id", &self.session_id)
      .field("plaintext", &self.plaintext)
      .finish_non_exhaustive()
  }
}

/// Builds the sinks for `ctx` and returns the distributor plus one task per sink.
///
/// The text log is registered with the error context up front, so a failure that happens
/// before any vertex logs still has something to show.
pub fn setup(ctx: &ProgressContext, input: mpsc::Receiver<SolveStatus>) -> Vec<ProgressTask> {
  ctx.errctx.add_log(&ctx.parent, TEXT_LOG_OUTPUT);

  let mut sinks: Vec<Box<dyn ProgressSink>> = vec![
    Box::new(TextSink::new(ctx, ctx.buffers.open(TEXT_LOG_OUTPUT))),
    Box::new(JsonSink::new(&ctx.session_id, ctx.buffers.open(JSON_LOG_OUTPUT))),
  ];
  if !ctx.plaintext {
    sinks.push(Box::new(VertexTracker::new(ctx)));
  }

  let mut tasks: Vec<ProgressTask> = Vec::with_capacity(sinks.len() + 1);
  let mut queues = Vec::with_capacity(sinks.len());
  for sink in sinks {
    let (tx, rx) = mpsc::unbounded_channel();
    queues.push(tx);
    tasks.push(Box::pin(drain(sink, rx)));
  }
  tasks.insert(0, Box::pin(distribute(input, queues)));
  tasks
}

async fn distribute(mut input: mpsc::Receiver<SolveStatus>, queues: Vec<mpsc::UnboundedSender<Arc<SolveStatus>>>) {
  let mut events = 0usize;
  while let Some(status) = input.recv().await {
    events += 1;
    let status = Arc::new(status);
    for queue in &queues {
      // A sink that went away does not stop the others.
      let _ = queue.send(status.clone());
    }
  }
  debug!(events, "progress stream ended");
}

async fn drain(mut sink: Box<dyn ProgressSink>, mut queue: mpsc::UnboundedReceiver<Arc<SolveStatus>>) {
  while let Some(status) = queue.recv().await {
    sink.handle(&status);
  }
  sink.finish();
}
