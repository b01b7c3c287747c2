//! # Flotilla Bus - Request/Response over Broadcast Channels
//!
//! Layers RPC-like semantics (correlation, timeout, exactly-once resolution)
//! on top of a fire-and-forget pub/sub transport.
//!
//! ## Flow
//!
//! ```text
//!  inbound:   transport ──deliver()──→ Multiplexer ──→ ChannelDispatch
//!                                                          │
//!                                   ┌──────────────────────┴──────────────┐
//!                                   ▼                                     ▼
//!                          PendingRequests::resolve()         PacketReceiver::receive()
//!                          (Response packets only)            (may answer → Response packet)
//!
//!  outbound:  Connection::send_packet() ──→ PacketRequest::exec() ──→ Supervisor's transport
//! ```
//!
//! ## Ownership
//!
//! - The [`Supervisor`] is the only component that builds or rebuilds the
//!   pooled transport; everything else borrows it through [`TransportProvider`].
//! - One physical subscription per process, shared by every logical channel
//!   and pattern registered on the [`Multiplexer`].

// Nursery lints that are too strict
#![allow(clippy::missing_const_for_fn)]
// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod codec;
pub mod connection;
pub mod memory;
pub mod multiplexer;
pub mod packet;
pub mod pending;
pub mod request;
pub mod supervisor;
pub mod transport;

// Re-export main types
pub use codec::{decode, encode, CodecError};
pub use connection::{Connection, PacketReceiver};
pub use memory::{InMemoryBroker, InMemoryConnector, InMemoryTransport};
pub use multiplexer::{ChannelReceiver, Multiplexer, PatternReceiver};
pub use packet::{NodeKind, Packet, PacketBody, PacketId, Response, ResponseType};
pub use pending::{PendingRequests, PendingStats, Resolution};
pub use request::{PacketRequest, RequestError};
pub use supervisor::{ConnectionState, Supervisor, SupervisorError};
pub use transport::{
    BroadcastTransport, Delivery, DeliverySink, TransportConfig, TransportConnector,
    TransportError, TransportProvider,
};

/// Well-known channel names.
pub mod channels {
    /// Request/response RPC traffic.
    pub const QUERY: &str = "flotilla:query";
    /// Fire-and-forget lifecycle notifications.
    pub const EVENT: &str = "flotilla:event";
    /// Liveness announcements from node agents.
    pub const HEARTBEAT: &str = "flotilla:heartbeat";
}

/// Response timeout applied when a request does not set its own.
pub const DEFAULT_REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Interval between transport liveness probes.
pub const DEFAULT_PROBE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(10);
