use std::collections::{HashMap, HashSet};
use std::time::SystemTime;

use super::{ProgressContext, ProgressSink, console_name};
use crate::action::{Console, OutputBuffer};
use crate::daemon::{SolveStatus, Vertex};

/// Prefixes every line written through it with an RFC 3339 timestamp.
#[derive(Debug)]
pub struct TimestampWriter {
  out: OutputBuffer,
  at_line_start: bool,
  clock: fn() -> SystemTime,
}

impl TimestampWriter {
  pub fn new(out: OutputBuffer) -> Self {
    Self::with_clock(out, SystemTime::now)
  }

  pub fn with_clock(out: OutputBuffer, clock: fn() -> SystemTime) -> Self {
    Self {
      out,
      at_line_start: true,
      clock,
    }
  }

  pub fn write(&mut self, bytes: &[u8]) {
    for chunk in bytes.split_inclusive(|b| *b == b'\n') {
      if self.at_line_start {
        let stamp = humantime::format_rfc3339_nanos((self.clock)());
        self.out.write(format!("{stamp} ").as_bytes());
      }
      self.out.write(chunk);
      self.at_line_start = chunk.ends_with(b"\n");
    }
  }
}

/// Human readable progress: one numbered block per vertex.
pub struct TextSink {
  writer: TimestampWriter,
  console: Option<(Console, String)>,
  numbers: HashMap<String, usize>,
  announced: HashSet<String>,
  finished: HashSet<String>,
}

impl TextSink {
  pub fn new(ctx: &ProgressContext, out: OutputBuffer) -> Self {
    let console = ctx
      .plaintext
      .then(|| (ctx.console.clone(), console_name(&ctx.log_id, &ctx.session_id, "")));
    Self {
      writer: TimestampWriter::new(out),
      console,
      numbers: HashMap::new(),
      announced: HashSet::new(),
      finished: HashSet::new(),
    }
  }

  fn number(&mut self, digest: &str) -> usize {
    let next = self.numbers.len() + 1;
    *self.numbers.entry(digest.to_string()).or_insert(next)
  }

  fn line(&mut self, n: usize, text: &str) {
    let line = format!("#{n} {text}\n");
    self.writer.write(line.as_bytes());
    if let Some((console, name)) = &self.console {
      console.write(name, line.as_bytes());
    }
  }

  fn vertex(&mut self, v: &Vertex) {
    if self.finished.contains(&v.digest) {
      return;
    }
    let n = self.number(&v.digest);

    if self.announced.insert(v.digest.clone()) {
      self.line(n, &v.name);
    }

    let outcome = if v.cached {
      Some("CACHED".to_string())
    } else if !v.error.is_empty() {
      Some(format!("ERROR: {}", v.error))
    } else {
      v.completed.map(|completed| {
        let took = v
          .started
          .and_then(|started| completed.duration_since(started).ok())
          .unwrap_or_default();
        format!("DONE {:.1}s", took.as_secs_f64())
      })
    };

    if let Some(outcome) = outcome {
      self.finished.insert(v.digest.clone());
      self.line(n, &outcome);
    }
  }
}

impl ProgressSink for TextSink {
  fn handle(&mut self, status: &SolveStatus) {
    for v in &status.vertexes {
      self.vertex(v);
    }

    for s in &status.statuses {
      if s.completed.is_none() {
        continue;
      }
      let n = self.number(&s.vertex);
      let name = if s.name.is_empty() { &s.id } else { &s.name };
      let text = if s.total > 0 {
        format!("{name} {}/{} done", s.current, s.total)
      } else {
        format!("{name} done")
      };
      self.line(n, &text);
    }

    for log in &status.logs {
      let n = self.number(&log.vertex);
      let text = String::from_utf8_lossy(&log.data);
      for l in text.lines() {
        self.line(n, l);
      }
    }

    for w in &status.warnings {
      let n = self.number(&w.vertex);
      self.line(n, &format!("WARN: {}", String::from_utf8_lossy(&w.short)));
    }
  }
}
