//! Structured concurrency for a fixed set of cooperating tasks.
//!
//! A [`TaskGroup`] runs futures on a `JoinSet`. The first task to fail cancels the group's
//! [`CancellationToken`]; tasks that care (the daemon call) observe it, others run until
//! their inputs end. [`TaskGroup::wait`] joins every task and returns the first error.

use std::future::Future;

use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

pub struct TaskGroup<E> {
  name: &'static str,
  set: JoinSet<Result<(), E>>,
  cancel: CancellationToken,
}

impl<E> TaskGroup<E>
where
  E: From<JoinError> + std::fmt::Display + Send + 'static,
{
  pub fn new(name: &'static str) -> Self {
    Self {
      name,
      set: JoinSet::new(),
      cancel: CancellationToken::new(),
    }
  }

  /// A group that is also cancelled when `parent` is.
  pub fn child_of(name: &'static str, parent: &CancellationToken) -> Self {
    Self {
      name,
      set: JoinSet::new(),
      cancel: parent.child_token(),
    }
  }

  /// Token cancelled when any task in the group fails.
  pub fn token(&self) -> CancellationToken {
    self.cancel.clone()
  }

  pub fn spawn<F>(&mut self, task: F)
  where
    F: Future<Output = Result<(), E>> + Send + 'static,
  {
    self.set.spawn(task);
  }

  /// Waits for every task. Returns the first error observed.
  pub async fn wait(mut self) -> Result<(), E> {
    let mut first: Option<E> = None;

    while let Some(joined) = self.set.join_next().await {
      let result = match joined {
        Ok(result) => result,
        Err(e) => {
          error!(group = self.name, error = %e, "task panicked");
          Err(E::from(e))
        }
      };

      if let Err(e) = result {
        if first.is_none() {
          debug!(group = self.name, error = %e, "task failed, cancelling group");
          self.cancel.cancel();
          first = Some(e);
        } else {
          debug!(group = self.name, error = %e, "additional task failure");
        }
      }
    }

    match first {
      Some(e) => Err(e),
      None => Ok(()),
    }
  }
}
