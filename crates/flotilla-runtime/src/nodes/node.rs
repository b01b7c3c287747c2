//! # Node Model
//!
//! A node and its readiness state machine.
//!
//! ```text
//!            healthy / heartbeat
//!  STARTING ────────────────────→ READY ◄──┐
//!     │                             │      │ healthy / heartbeat
//!     │ any other status            ▼      │
//!     └───────────────────────────→ IDLE ──┘
//!
//!  STARTING | READY | IDLE ──stop──→ SHUTDOWN (terminal)
//! ```
//!
//! Once a node has left STARTING it never returns there; a late
//! `starting` health poll is ignored.

use chrono::{DateTime, Utc};
use flotilla_bus::NodeKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::config::NodeTemplate;
use crate::container::ContainerHandle;

/// Lifecycle state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeState {
    Starting,
    Ready,
    Idle,
    Shutdown,
}

impl NodeState {
    /// Map a container health status. Total over all inputs.
    #[must_use]
    pub fn from_health_status(status: &str) -> Self {
        match status {
            "starting" => Self::Starting,
            "healthy" => Self::Ready,
            _ => Self::Idle,
        }
    }

    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Shutdown, _) => false,
            (_, Self::Shutdown) => true,
            (Self::Starting, _) => true,
            (Self::Ready | Self::Idle, Self::Ready | Self::Idle) => true,
            (Self::Ready | Self::Idle, Self::Starting) => false,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        self == Self::Shutdown
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Starting => "STARTING",
            Self::Ready => "READY",
            Self::Idle => "IDLE",
            Self::Shutdown => "SHUTDOWN",
        };
        f.write_str(name)
    }
}

/// A managed node.
#[derive(Debug, Clone)]
pub struct Node {
    id: String,
    template: String,
    kind: NodeKind,
    image: String,
    env: BTreeMap<String, String>,
    container: Option<ContainerHandle>,
    state: NodeState,
    started_at: Option<DateTime<Utc>>,
    host: Option<String>,
    port: Option<u16>,
    last_heartbeat: Option<DateTime<Utc>>,
    /// A stop is in flight for this node.
    stop_claimed: bool,
}

impl Node {
    /// A node in STARTING with no container yet.
    #[must_use]
    pub fn new(id: impl Into<String>, template: &NodeTemplate) -> Self {
        Self {
            id: id.into(),
            template: template.name.clone(),
            kind: template.kind,
            image: template.image.clone(),
            env: template.env.clone(),
            container: None,
            state: NodeState::Starting,
            started_at: None,
            host: None,
            port: None,
            last_heartbeat: None,
            stop_claimed: false,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn template(&self) -> &str {
        &self.template
    }

    #[must_use]
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    #[must_use]
    pub fn image(&self) -> &str {
        &self.image
    }

    #[must_use]
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    #[must_use]
    pub fn container(&self) -> Option<&ContainerHandle> {
        self.container.as_ref()
    }

    #[must_use]
    pub fn is_allocated(&self) -> bool {
        self.container.is_some()
    }

    #[must_use]
    pub fn state(&self) -> NodeState {
        self.state
    }

    #[must_use]
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    #[must_use]
    pub fn last_heartbeat(&self) -> Option<DateTime<Utc>> {
        self.last_heartbeat
    }

    /// `host:port` once the container's published port is known.
    #[must_use]
    pub fn address(&self) -> Option<String> {
        match (&self.host, self.port) {
            (Some(host), Some(port)) => Some(format!("{host}:{port}")),
            _ => None,
        }
    }

    pub(crate) fn allocate(&mut self, handle: ContainerHandle, started_at: DateTime<Utc>) {
        self.container = Some(handle);
        self.started_at = Some(started_at);
    }

    pub(crate) fn set_address(&mut self, host: &str, port: u16) {
        self.host = Some(host.to_string());
        self.port = Some(port);
    }

    pub(crate) fn record_heartbeat(&mut self, at: DateTime<Utc>) {
        self.last_heartbeat = Some(at);
    }

    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.stop_claimed
    }

    /// Claim the node for a stop. Returns false if another stop holds it.
    pub(crate) fn claim_stop(&mut self) -> bool {
        !std::mem::replace(&mut self.stop_claimed, true)
    }

    pub(crate) fn release_stop(&mut self) {
        self.stop_claimed = false;
    }

    /// Move to `next` if the state machine allows it. Returns whether the
    /// state changed.
    pub(crate) fn transition(&mut self, next: NodeState) -> bool {
        if self.state == next || !self.state.can_transition_to(next) {
            return false;
        }
        self.state = next;
        true
    }

    #[must_use]
    pub fn summary(&self) -> NodeSummary {
        NodeSummary {
            id: self.id.clone(),
            template: self.template.clone(),
            kind: self.kind,
            state: self.state,
            container: self.container.as_ref().map(|c| c.as_str().to_string()),
            started_at: self.started_at,
            address: self.address(),
            last_heartbeat: self.last_heartbeat,
        }
    }
}

/// Serializable view of a node, as returned by `NodeInfo` queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSummary {
    pub id: String,
    pub template: String,
    pub kind: NodeKind,
    pub state: NodeState,
    pub container: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub address: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}
