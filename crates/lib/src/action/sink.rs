use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, info, warn};

use super::{ActionEvent, ActionId};

/// Receives action lifecycle events.
pub trait ActionSink: Send + Sync {
  fn started(&self, action: &ActionEvent);
  fn done(&self, action: &ActionEvent);
  fn result(&self, action: &ActionId, key: &str, value: &str);
}

/// Mirrors actions into `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingActionSink;

impl ActionSink for TracingActionSink {
  fn started(&self, action: &ActionEvent) {
    if action.cached {
      return;
    }
    debug!(id = %action.id, parent = ?action.parent, name = %action.name, args = ?action.args, "action started");
  }

  fn done(&self, action: &ActionEvent) {
    let elapsed = action
      .completed
      .and_then(|c| c.duration_since(action.started).ok())
      .unwrap_or_default();

    match &action.error {
      Some(error) => warn!(id = %action.id, name = %action.name, %error, "action failed"),
      None if action.cached => debug!(id = %action.id, name = %action.name, "action cached"),
      None => info!(
        id = %action.id,
        name = %action.name,
        elapsed = %humantime::format_duration(elapsed),
        "action done"
      ),
    }
  }

  fn result(&self, action: &ActionId, key: &str, value: &str) {
    info!(id = %action, key, value, "action result");
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedEvent {
  Started(ActionEvent),
  Done(ActionEvent),
  Result { action: ActionId, key: String, value: String },
}

/// Keeps every event in memory. Used to inspect what a solve reported.
#[derive(Debug, Default)]
pub struct RecordingActionSink {
  events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingActionSink {
  fn lock(&self) -> MutexGuard<'_, Vec<RecordedEvent>> {
    self.events.lock().unwrap_or_else(|e| e.into_inner())
  }

  pub fn events(&self) -> Vec<RecordedEvent> {
    self.lock().clone()
  }

  pub fn completed(&self) -> Vec<ActionEvent> {
    self
      .lock()
      .iter()
      .filter_map(|e| match e {
        RecordedEvent::Done(ev) => Some(ev.clone()),
        _ => None,
      })
      .collect()
  }

  /// Actions started and not yet completed.
  pub fn running(&self) -> Vec<ActionEvent> {
    let events = self.lock();
    events
      .iter()
      .filter_map(|e| match e {
        RecordedEvent::Started(ev) => Some(ev),
        _ => None,
      })
      .filter(|started| {
        !events
          .iter()
          .any(|e| matches!(e, RecordedEvent::Done(done) if done.id == started.id))
      })
      .cloned()
      .collect()
  }

  pub fn results(&self, action: &ActionId) -> BTreeMap<String, String> {
    self
      .lock()
      .iter()
      .filter_map(|e| match e {
        RecordedEvent::Result { action: a, key, value } if a == action => Some((key.clone(), value.clone())),
        _ => None,
      })
      .collect()
  }
}

impl ActionSink for RecordingActionSink {
  fn started(&self, action: &ActionEvent) {
    self.lock().push(RecordedEvent::Started(action.clone()));
  }

  fn done(&self, action: &ActionEvent) {
    self.lock().push(RecordedEvent::Done(action.clone()));
  }

  fn result(&self, action: &ActionId, key: &str, value: &str) {
    self.lock().push(RecordedEvent::Result {
      action: action.clone(),
      key: key.to_string(),
      value: value.to_string(),
    });
  }
}
