//! Running a solve end to end.
//!
//! The [`Orchestrator`] ties the pieces together for one request: it resolves the cache
//! policy and session attachments, obtains a shared daemon connection, stages the
//! exporter, checks local content sizes, runs the daemon call next to the progress
//! multiplexer and finally hands the response to the exporter.

mod build;
mod orchestrator;

pub use build::{FsBuild, FsOutput, ImageBuild, TargetName};
pub use orchestrator::{Orchestrator, SolveContext};

use std::fmt::Write as _;

use thiserror::Error;
use tokio::task::JoinError;

use crate::cache::CacheError;
use crate::daemon::DaemonError;
use crate::export::ExportError;
use crate::request::RequestError;
use crate::session::SessionError;
use crate::workspace::WorkspaceError;

/// Trailing lines of one output buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferTail {
  pub name: String,
  pub lines: Vec<String>,
}

#[derive(Debug, Error)]
pub enum SolveError {
  #[error(transparent)]
  Request(#[from] RequestError),

  #[error(transparent)]
  Cache(#[from] CacheError),

  #[error(transparent)]
  Session(#[from] SessionError),

  #[error(transparent)]
  Daemon(#[from] DaemonError),

  #[error(transparent)]
  Workspace(#[from] WorkspaceError),

  #[error(transparent)]
  Export(#[from] ExportError),

  #[error("solve task failed: {0}")]
  Task(String),

  /// A failure decorated with the logs most likely to explain it.
  #[error("{source}{}", render_tails(.logs))]
  WithLogs { source: Box<SolveError>, logs: Vec<BufferTail> },
}

impl From<JoinError> for SolveError {
  fn from(e: JoinError) -> Self {
    SolveError::Task(e.to_string())
  }
}

impl SolveError {
  /// The error underneath any log decoration.
  pub fn root(&self) -> &SolveError {
    match self {
      SolveError::WithLogs { source, .. } => source.root(),
      other => other,
    }
  }

  pub fn logs(&self) -> &[BufferTail] {
    match self {
      SolveError::WithLogs { logs, .. } => logs,
      _ => &[],
    }
  }
}

fn render_tails(logs: &[BufferTail]) -> String {
  let mut out = String::new();
  for tail in logs.iter().filter(|t| !t.lines.is_empty()) {
    let _ = write!(out, "\n\n[{}]", tail.name);
    for line in &tail.lines {
      let _ = write!(out, "\n  {line}");
    }
  }
  out
}
