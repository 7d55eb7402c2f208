//! Container engine adapter.
//!
//! [`ContainerEngine`] is the narrow capability the lifecycle manager needs
//! from a container runtime. [`DockerEngine`] talks to a Docker daemon;
//! [`MemoryEngine`] runs nothing and keeps container state in process.

mod docker;
mod memory;
pub mod stats;
mod types;

use std::time::Duration;

use async_trait::async_trait;

pub use docker::DockerEngine;
pub use memory::MemoryEngine;
pub use types::*;

/// Errors from engine operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    /// The runtime cannot be reached at all.
    #[error("Container engine unavailable: {0}")]
    Unavailable(String),

    #[error("Image error: {0}")]
    Image(String),

    #[error("Container name conflict: {0}")]
    Conflict(String),

    #[error("Container not found: {0}")]
    NotFound(String),

    #[error("Container engine error: {0}")]
    Api(String),
}

impl EngineError {
    pub const fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Capability interface over a container runtime.
///
/// Implementations must tolerate concurrent calls on distinct references.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Cheap reachability check.
    async fn ping(&self) -> Result<(), EngineError>;

    /// Make `image` available locally.
    async fn pull(&self, image: &str) -> Result<(), EngineError>;

    /// Create a container from `spec` and start it.
    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<ContainerRef, EngineError>;

    /// Current status and resource usage.
    ///
    /// Accepts a container name as well as an engine-issued reference.
    async fn inspect(&self, container: &ContainerRef) -> Result<ContainerSnapshot, EngineError>;

    async fn start(&self, container: &ContainerRef) -> Result<(), EngineError>;

    async fn stop(&self, container: &ContainerRef, grace: Duration) -> Result<(), EngineError>;

    async fn restart(&self, container: &ContainerRef, grace: Duration) -> Result<(), EngineError>;

    /// Remove the container (forcefully), optionally with its anonymous
    /// volumes.
    async fn remove(&self, container: &ContainerRef, purge_volumes: bool)
    -> Result<(), EngineError>;

    /// Follow the container's combined stdout/stderr.
    async fn stream_logs(&self, container: &ContainerRef) -> Result<LogStream, EngineError>;
}
