//! Solve requests and their cache keys.
//!
//! A [`SolveRequest`] is assembled once by [`SolveRequestBuilder`] and then consumed by
//! the orchestrator. [`cache_key`] derives the [`Inputs`] that identify the request to
//! the compute graph.

mod key;
mod types;

pub use key::{Inputs, KeyMode, NamedDependency, cache_key};
pub use types::{Definition, RequestError, SolveRequest, SolveRequestBuilder};
