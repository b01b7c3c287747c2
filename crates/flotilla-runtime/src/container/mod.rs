//! # Container Runtime Port
//!
//! The capabilities the node manager needs from a container engine.
//! Engine clients (Docker, Podman, ...) implement [`ContainerRuntime`];
//! [`InMemoryContainerRuntime`] is the process-local implementation.

pub mod memory;

pub use memory::InMemoryContainerRuntime;

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use thiserror::Error;

/// Engine-assigned container identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContainerHandle(String);

impl ContainerHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub hostname: String,
    pub env: BTreeMap<String, String>,
    /// Container port to publish on a host port chosen by the engine.
    pub published_port: u16,
}

/// Result of inspecting a live container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerInspection {
    /// Container port → host port.
    pub ports: HashMap<u16, u16>,
    /// Engine health status (`starting`, `healthy`, `unhealthy`, ...).
    pub health_status: Option<String>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("container {0} not found")]
    NotFound(ContainerHandle),

    #[error("container engine request failed: {0}")]
    Request(String),
}

/// Container engine operations.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerHandle, RuntimeError>;

    async fn inspect(&self, handle: &ContainerHandle) -> Result<ContainerInspection, RuntimeError>;

    /// Ask the container to stop. Success means the engine accepted the
    /// request, not that the process has exited.
    async fn stop(&self, handle: &ContainerHandle) -> Result<(), RuntimeError>;

    /// Handles of every running container.
    async fn list(&self) -> Result<Vec<ContainerHandle>, RuntimeError>;

    async fn kill(&self, handle: &ContainerHandle) -> Result<(), RuntimeError>;
}
