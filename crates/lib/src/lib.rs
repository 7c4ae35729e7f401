//! solvent-lib: build execution engine on top of a BuildKit daemon.
//!
//! This crate turns a serialized build graph (or a frontend invocation) into an artifact:
//! - `request`: solve requests and their cache keys
//! - `daemon`: daemon container lifecycle, connections and the daemon protocol
//! - `export`: image, OCI archive, registry and filesystem outputs
//! - `progress`: fan-out of daemon progress to text, JSON and action sinks
//! - `solve`: the orchestrator driving one solve end to end
//! - `compute`: memoized, deduplicated computations over solves

pub mod action;
pub mod cache;
pub mod cleanup;
pub mod compute;
pub mod config;
pub mod consts;
pub mod daemon;
pub mod errctx;
pub mod executor;
pub mod export;
pub mod platform;
pub mod progress;
pub mod request;
pub mod session;
pub mod solve;
pub mod util;
pub mod workspace;
