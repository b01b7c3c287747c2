//! # Packet Requests
//!
//! The descriptor returned by [`Connection::send_packet`]. Nothing is
//! published until [`PacketRequest::exec`] or [`PacketRequest::response`]
//! runs.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::codec::CodecError;
use crate::connection::Connection;
use crate::packet::{Packet, PacketId, Response};
use crate::pending::Resolution;
use crate::transport::TransportError;

/// Errors surfaced to the sender of a request.
#[derive(Debug, Error)]
pub enum RequestError {
    /// No response arrived before the deadline.
    #[error("request {id} on '{channel}' timed out after {timeout:?}")]
    Timeout {
        id: PacketId,
        channel: String,
        timeout: Duration,
    },

    /// The peer answered with an error-kind response.
    #[error("request failed with {:?}: {}", .0.response_type, .0.message)]
    ErrorResponse(Response),

    #[error("packet id {0} already has a pending request")]
    DuplicateId(PacketId),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The pending entry was dropped without a resolution.
    #[error("request {0} was abandoned")]
    Abandoned(PacketId),
}

impl RequestError {
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

type ResponseCallback = Box<dyn FnOnce(Resolution) + Send + 'static>;

/// One outbound packet plus how its answer should be handled.
pub struct PacketRequest {
    connection: Arc<Connection>,
    channel: String,
    packet: Packet,
    timeout: Option<Duration>,
    callback: Option<ResponseCallback>,
}

impl PacketRequest {
    pub(crate) fn new(connection: Arc<Connection>, channel: &str, packet: Packet) -> Self {
        Self {
            connection,
            channel: channel.to_string(),
            packet,
            timeout: None,
            callback: None,
        }
    }

    /// Override the connection's default response timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Invoke `callback` exactly once with the outcome.
    #[must_use]
    pub fn with_response_callback(
        mut self,
        callback: impl FnOnce(Resolution) + Send + 'static,
    ) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }

    #[must_use]
    pub fn packet(&self) -> &Packet {
        &self.packet
    }

    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Publish the packet and return its id without waiting.
    ///
    /// With a callback attached, a pending request is registered first and
    /// the callback runs on a spawned task once it resolves.
    pub async fn exec(self) -> Result<PacketId, RequestError> {
        let id = self.packet.id();
        let Some(callback) = self.callback else {
            self.connection.publish(&self.channel, &self.packet).await?;
            return Ok(id);
        };

        let rx = self
            .connection
            .request(&self.channel, &self.packet, self.timeout)
            .await?;
        tokio::spawn(async move {
            match rx.await {
                Ok(resolution) => callback(resolution),
                Err(_) => debug!(packet_id = %id, "Pending request dropped before resolution"),
            }
        });
        Ok(id)
    }

    /// Publish the packet and wait for its response.
    pub async fn response(self) -> Result<Response, RequestError> {
        let id = self.packet.id();
        let timeout = self
            .timeout
            .unwrap_or_else(|| self.connection.pending().default_timeout());
        let rx = self
            .connection
            .request(&self.channel, &self.packet, Some(timeout))
            .await?;

        match rx.await {
            Ok(Resolution::Succeeded(response)) => Ok(response),
            Ok(Resolution::Failed(response)) => Err(RequestError::ErrorResponse(response)),
            Ok(Resolution::TimedOut) => Err(RequestError::Timeout {
                id,
                channel: self.channel,
                timeout,
            }),
            Err(_) => Err(RequestError::Abandoned(id)),
        }
    }
}
