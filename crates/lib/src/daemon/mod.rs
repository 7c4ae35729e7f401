//! The build daemon.
//!
//! The daemon protocol is modelled by [`BuildDaemon`] and [`DaemonConnector`], with a
//! `buildctl` subprocess transport ([`buildctl`]). Managed daemons run in a container
//! ([`lifecycle`], [`docker`]); [`DaemonManager`] hands out one shared, connected
//! [`DaemonHandle`] per configuration and platform.

pub mod buildctl;
mod client;
pub mod docker;
pub mod lifecycle;
mod manager;
pub mod types;

pub use client::{BuildDaemon, DaemonConnector, DaemonError};
pub use lifecycle::{Backoff, ContainerRuntime, ContainerSpec, ContainerState, DaemonState};
pub use manager::{DaemonHandle, DaemonManager};
pub use types::{
  ExportEntry, ExportOutput, SolveOpt, SolveResponse, SolveStatus, Vertex, VertexLog, VertexStatus, WorkerInfo, digest_hex,
};
