use std::collections::BTreeMap;
use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard};

/// An append-only, shareable in-memory log.
#[derive(Debug, Clone, Default)]
pub struct OutputBuffer {
  data: Arc<Mutex<Vec<u8>>>,
}

impl OutputBuffer {
  fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
    self.data.lock().unwrap_or_else(|e| e.into_inner())
  }

  pub fn write(&self, bytes: &[u8]) {
    self.lock().extend_from_slice(bytes);
  }

  pub fn contents(&self) -> Vec<u8> {
    self.lock().clone()
  }

  pub fn to_string_lossy(&self) -> String {
    String::from_utf8_lossy(&self.lock()).to_string()
  }

  /// The last `n` lines, without trailing newlines.
  pub fn tail_lines(&self, n: usize) -> Vec<String> {
    let text = self.to_string_lossy();
    let lines: Vec<&str> = text.lines().collect();
    let skip = lines.len().saturating_sub(n);
    lines[skip..].iter().map(|l| l.to_string()).collect()
  }
}

/// Named output buffers of one solve.
#[derive(Debug, Clone, Default)]
pub struct Buffers {
  named: Arc<Mutex<BTreeMap<String, OutputBuffer>>>,
}

impl Buffers {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> MutexGuard<'_, BTreeMap<String, OutputBuffer>> {
    self.named.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Returns the buffer called `name`, creating it on first use.
  pub fn open(&self, name: &str) -> OutputBuffer {
    self.lock().entry(name.to_string()).or_default().clone()
  }

  pub fn get(&self, name: &str) -> Option<OutputBuffer> {
    self.lock().get(name).cloned()
  }

  pub fn names(&self) -> Vec<String> {
    self.lock().keys().cloned().collect()
  }
}

/// Where user-facing output goes.
#[derive(Debug, Clone, Default)]
pub enum Console {
  /// Process stdout; warnings go to stderr.
  Stdout,
  #[default]
  Discard,
  /// In-memory capture of everything, warnings included.
  Capture(OutputBuffer),
}

impl Console {
  pub fn capture() -> Self {
    Self::Capture(OutputBuffer::default())
  }

  /// Writes `bytes` on behalf of the stream called `name`. Every line is prefixed with
  /// the name when one is given.
  pub fn write(&self, name: &str, bytes: &[u8]) {
    let rendered = prefix_lines(name, bytes);
    match self {
      Console::Stdout => {
        let mut out = std::io::stdout().lock();
        let _ = out.write_all(&rendered);
        let _ = out.flush();
      }
      Console::Discard => {}
      Console::Capture(buf) => buf.write(&rendered),
    }
  }

  pub fn warn(&self, message: &str) {
    let line = format!("{}\n", message.trim_end());
    match self {
      Console::Stdout => {
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
      }
      Console::Discard => {}
      Console::Capture(buf) => buf.write(line.as_bytes()),
    }
  }

  pub fn captured(&self) -> Option<String> {
    match self {
      Console::Capture(buf) => Some(buf.to_string_lossy()),
      _ => None,
    }
  }
}

fn prefix_lines(name: &str, bytes: &[u8]) -> Vec<u8> {
  if name.is_empty() {
    return bytes.to_vec();
  }

  let mut out = Vec::with_capacity(bytes.len() + name.len() + 3);
  for line in bytes.split_inclusive(|b| *b == b'\n') {
    out.extend_from_slice(format!("[{name}] ").as_bytes());
    out.extend_from_slice(line);
  }
  out
}
