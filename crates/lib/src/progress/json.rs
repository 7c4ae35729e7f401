use std::time::SystemTime;

use serde_json::json;

use super::ProgressSink;
use crate::action::OutputBuffer;
use crate::daemon::SolveStatus;

/// Raw progress as newline-delimited JSON, bracketed by `started` and `completed` records.
pub struct JsonSink {
  session_id: String,
  out: OutputBuffer,
}

impl JsonSink {
  pub fn new(session_id: &str, out: OutputBuffer) -> Self {
    let sink = Self {
      session_id: session_id.to_string(),
      out,
    };
    sink.record(json!({ "s": sink.session_id, "started": now() }));
    sink
  }

  fn record(&self, value: serde_json::Value) {
    let mut line = value.to_string();
    line.push('\n');
    self.out.write(line.as_bytes());
  }
}

fn now() -> String {
  humantime::format_rfc3339_nanos(SystemTime::now()).to_string()
}

impl ProgressSink for JsonSink {
  fn handle(&mut self, status: &SolveStatus) {
    match serde_json::to_value(status) {
      Ok(e) => self.record(json!({ "s": self.session_id, "e": e })),
      Err(err) => tracing::warn!(error = %err, "failed to encode progress event"),
    }
  }

  fn finish(&mut self) {
    self.record(json!({ "s": self.session_id, "completed": now() }));
  }
}
