//! # Packets
//!
//! Every message on the bus is a [`Packet`]: a fresh unique id plus one
//! [`PacketBody`] variant. Packets are immutable once built.
//!
//! Wire shape (JSON):
//!
//! ```text
//! { "id": "<uuid>", "variant": "start_node", "template": "lobby" }
//! { "id": "<uuid>", "variant": "response", "correlationId": "<uuid>",
//!   "responseType": "SUCCESS", "message": "lobby-1a2b3c4d" }
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque per-packet identifier, also used as the correlation key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PacketId(Uuid);

impl PacketId {
    /// Generate a new random packet id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse from string.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(s).map(Self)
    }

    /// Get the underlying UUID.
    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for PacketId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PacketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for PacketId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Outcome tag carried by a response packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseType {
    /// Sentinel: the receiver has nothing to say, no packet is sent.
    None,
    /// The request was handled.
    Success,
    /// The request failed.
    Error,
    /// The request referred to something that does not exist.
    NotFound,
}

impl ResponseType {
    /// True for the "no response" sentinel.
    #[must_use]
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// True when a pending request should resolve as failed.
    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error | Self::NotFound)
    }
}

/// Kind of node a lifecycle event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeKind {
    /// Network proxy in front of the game servers.
    Proxy,
    /// Game server instance.
    Server,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Proxy => write!(f, "proxy"),
            Self::Server => write!(f, "server"),
        }
    }
}

/// Structured answer produced by a receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub response_type: ResponseType,
    pub message: String,
}

impl Response {
    pub fn new(response_type: ResponseType, message: impl Into<String>) -> Self {
        Self {
            response_type,
            message: message.into(),
        }
    }

    /// The "nothing to send" answer.
    #[must_use]
    pub fn none() -> Self {
        Self::new(ResponseType::None, "")
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::new(ResponseType::Success, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(ResponseType::Error, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ResponseType::NotFound, message)
    }
}

/// All packet variants. The `variant` tag selects the payload fields.
///
/// New variants can be added freely: peers that do not know a tag drop
/// the packet with a warning instead of failing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "variant", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum PacketBody {
    // =========================================================================
    // HEARTBEAT CHANNEL
    // =========================================================================
    /// Periodic readiness announcement from a node's in-container agent.
    Heartbeat { application_id: String },

    // =========================================================================
    // EVENT CHANNEL
    // =========================================================================
    /// A node's container was created and its address resolved.
    NodeStarted {
        node_id: String,
        template: String,
        kind: NodeKind,
    },

    /// A node's container was stopped and the node left the registry.
    NodeStopped {
        node_id: String,
        template: String,
        kind: NodeKind,
    },

    // =========================================================================
    // QUERY CHANNEL
    // =========================================================================
    /// Ask the orchestrator to start a node from a template.
    StartNode { template: String },

    /// Ask the orchestrator to stop an active node.
    StopNode { node_id: String },

    /// Ask the orchestrator for a node's current summary.
    NodeInfo { node_id: String },

    // =========================================================================
    // RESPONSES (any channel)
    // =========================================================================
    /// Answer to the packet whose id is `correlation_id`.
    Response {
        correlation_id: PacketId,
        response_type: ResponseType,
        message: String,
    },
}

impl PacketBody {
    /// Wire tag of this variant, for logging.
    #[must_use]
    pub fn variant_name(&self) -> &'static str {
        match self {
            Self::Heartbeat { .. } => "heartbeat",
            Self::NodeStarted { .. } => "node_started",
            Self::NodeStopped { .. } => "node_stopped",
            Self::StartNode { .. } => "start_node",
            Self::StopNode { .. } => "stop_node",
            Self::NodeInfo { .. } => "node_info",
            Self::Response { .. } => "response",
        }
    }
}

/// A packet as sent on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    id: PacketId,
    #[serde(flatten)]
    body: PacketBody,
}

impl Packet {
    /// Build a packet with a freshly generated id.
    #[must_use]
    pub fn new(body: PacketBody) -> Self {
        Self::with_id(PacketId::new(), body)
    }

    /// Build a packet with an explicit id.
    #[must_use]
    pub fn with_id(id: PacketId, body: PacketBody) -> Self {
        Self { id, body }
    }

    /// Build the response packet answering `correlation_id`.
    #[must_use]
    pub fn response(correlation_id: PacketId, response: Response) -> Self {
        Self::new(PacketBody::Response {
            correlation_id,
            response_type: response.response_type,
            message: response.message,
        })
    }

    #[must_use]
    pub fn id(&self) -> PacketId {
        self.id
    }

    #[must_use]
    pub fn body(&self) -> &PacketBody {
        &self.body
    }

    #[must_use]
    pub fn into_body(self) -> PacketBody {
        self.body
    }

    /// True if this packet answers another one.
    #[must_use]
    pub fn is_response(&self) -> bool {
        matches!(self.body, PacketBody::Response { .. })
    }
}
