//! Which output buffers matter when something fails.
//!
//! Buffers are registered per action as they are opened. When a specific vertex fails,
//! the buffers it wrote to are marked, and [`ErrContext::relevant_buffers`] narrows down
//! to them. With nothing marked, every registered buffer is relevant.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::action::ActionId;

#[derive(Debug, Default)]
struct Entry {
  buffers: Vec<String>,
  with_error: HashSet<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ErrContext {
  inner: Arc<Mutex<HashMap<ActionId, Entry>>>,
}

impl ErrContext {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> MutexGuard<'_, HashMap<ActionId, Entry>> {
    // A poisoned map is still a valid map.
    self.inner.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Registers `buffer` under `action`. Registering twice is a no-op.
  pub fn add_log(&self, action: &ActionId, buffer: &str) {
    let mut map = self.lock();
    let entry = map.entry(action.clone()).or_default();
    if !entry.buffers.iter().any(|b| b == buffer) {
      entry.buffers.push(buffer.to_string());
    }
  }

  /// Marks a registered buffer as implicated in a failure. Unknown buffers are ignored.
  pub fn mark_has_error(&self, action: &ActionId, buffer: &str) {
    let mut map = self.lock();
    if let Some(entry) = map.get_mut(action) {
      if entry.buffers.iter().any(|b| b == buffer) {
        entry.with_error.insert(buffer.to_string());
      }
    }
  }

  /// Marked buffers in registration order, or every buffer when none is marked.
  pub fn relevant_buffers(&self, action: &ActionId) -> Vec<String> {
    let map = self.lock();
    let Some(entry) = map.get(action) else {
      return Vec::new();
    };

    if entry.with_error.is_empty() {
      return entry.buffers.clone();
    }

    entry
      .buffers
      .iter()
      .filter(|b| entry.with_error.contains(*b))
      .cloned()
      .collect()
  }

  pub fn discard(&self, action: &ActionId) {
    self.lock().remove(action);
  }
}
