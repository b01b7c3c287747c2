//! # Broadcast Transport Port
//!
//! Capabilities the bus needs from a pub/sub client. The concrete client
//! (a Redis pool, a NATS connection, the in-memory broker) lives behind
//! these traits.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::DEFAULT_PROBE_INTERVAL;

/// A message handed over by the transport's delivery mechanism.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Message on an exactly-subscribed channel.
    Message { channel: String, payload: String },
    /// Message on `channel` that matched a pattern subscription.
    Pattern {
        pattern: String,
        channel: String,
        payload: String,
    },
}

/// Receives every delivery for one physical subscription.
///
/// Called on whatever task or thread the transport delivers on; must not block.
pub trait DeliverySink: Send + Sync {
    fn deliver(&self, delivery: Delivery);
}

/// Errors from transport operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport unreachable at {0}")]
    Unreachable(String),

    #[error("transport rejected credentials")]
    AuthenticationFailed,

    #[error("transport connection closed")]
    Closed,

    #[error("not connected to a transport")]
    NotConnected,

    #[error("invalid subscription pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

/// A pooled connection to the broadcast transport.
#[async_trait]
pub trait BroadcastTransport: Send + Sync {
    /// Publish a payload. Returns the number of subscriptions that received it.
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize, TransportError>;

    /// Add channels to this client's subscription.
    ///
    /// The first call opens the subscription delivering to `sink`; later
    /// calls extend it without tearing it down.
    async fn subscribe(
        &self,
        sink: Arc<dyn DeliverySink>,
        channels: &[String],
    ) -> Result<(), TransportError>;

    /// Add glob patterns to this client's subscription.
    async fn psubscribe(
        &self,
        sink: Arc<dyn DeliverySink>,
        patterns: &[String],
    ) -> Result<(), TransportError>;

    /// Acquire and immediately release one pooled connection.
    async fn probe(&self) -> Result<(), TransportError>;

    /// Close the pool and drop its subscriptions.
    async fn close(&self);
}

/// Builds pooled transport connections.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(
        &self,
        config: &TransportConfig,
    ) -> Result<Arc<dyn BroadcastTransport>, TransportError>;
}

/// Hands out the currently live transport.
pub trait TransportProvider: Send + Sync {
    fn transport(&self) -> Result<Arc<dyn BroadcastTransport>, TransportError>;
}

/// Where and how to reach the transport.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub host: String,
    pub port: u16,
    /// `None` connects without authentication.
    pub password: Option<String>,
    /// Interval between liveness probes once connected.
    pub probe_interval: Duration,
}

impl TransportConfig {
    /// `host:port` for logs and errors.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            password: None,
            probe_interval: DEFAULT_PROBE_INTERVAL,
        }
    }
}
