//! Memoized computations.
//!
//! A [`Computable`] describes its inputs as a cache key and produces an output. The
//! [`ComputeGraph`] runs each distinct key once: concurrent callers with the same key share
//! one execution, and later callers get the memoized output. Computations whose inputs or
//! outputs are non-deterministic always run and are never memoized.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::request::Inputs;

/// Properties of a computation's output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutputSpec {
  /// The output must never be reused, even for identical inputs.
  pub not_cacheable: bool,
}

#[async_trait]
pub trait Computable: Send + Sync {
  type Output: Clone + Send + Sync + 'static;
  type Error: Send;

  async fn inputs(&self) -> Result<Inputs, Self::Error>;

  fn output(&self) -> OutputSpec {
    OutputSpec::default()
  }

  async fn compute(&self) -> Result<Self::Output, Self::Error>;
}

type Slot = Arc<OnceCell<Arc<dyn Any + Send + Sync>>>;

#[derive(Default)]
pub struct ComputeGraph {
  memo: Mutex<HashMap<(&'static str, String), Slot>>,
}

impl ComputeGraph {
  pub fn new() -> Self {
    Self::default()
  }

  pub async fn compute<C: Computable + 'static>(&self, c: &C) -> Result<C::Output, C::Error> {
    let inputs = c.inputs().await?;
    let kind = std::any::type_name::<C>();

    if inputs.non_deterministic || c.output().not_cacheable {
      debug!(kind, "non-deterministic computation, not memoizing");
      return c.compute().await;
    }

    let digest = inputs.digest();
    let slot = {
      let mut memo = self.memo.lock().unwrap_or_else(|e| e.into_inner());
      memo.entry((kind, digest.clone())).or_default().clone()
    };

    let value = slot
      .get_or_try_init(|| async {
        debug!(kind, %digest, "computing");
        let output = c.compute().await?;
        Ok::<_, C::Error>(Arc::new(output) as Arc<dyn Any + Send + Sync>)
      })
      .await?;

    // Slots are keyed by type, so the downcast cannot fail.
    match value.downcast_ref::<C::Output>() {
      Some(output) => Ok(output.clone()),
      None => c.compute().await,
    }
  }

  /// Number of memoized outputs.
  pub fn len(&self) -> usize {
    let memo = self.memo.lock().unwrap_or_else(|e| e.into_inner());
    memo.values().filter(|slot| slot.initialized()).count()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}
