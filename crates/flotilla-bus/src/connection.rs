//! # Channel Dispatcher
//!
//! [`Connection`] is the application-facing handle: it binds channels to
//! [`PacketReceiver`]s, publishes packets, and feeds response packets to the
//! pending-request table.
//!
//! ## Dispatch rules
//!
//! - Each inbound message is decoded once per channel; undecodable messages
//!   are dropped.
//! - `Response` packets only resolve pending requests and never reach
//!   application receivers.
//! - Every other packet goes to each receiver in registration order. The
//!   first answer that is not `NONE` is published back on the same channel
//!   correlated to the packet's id; later answers are logged and discarded.
//! - Receivers run on the transport's delivery path and must not block.
//!   Slow work belongs on a spawned task.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::codec;
use crate::multiplexer::{ChannelReceiver, Multiplexer, PatternReceiver};
use crate::packet::{Packet, PacketBody, PacketId, Response};
use crate::pending::{PendingRequests, Resolution};
use crate::request::{PacketRequest, RequestError};
use crate::supervisor::ConnectionState;
use crate::transport::{TransportError, TransportProvider};

/// Application-level handler bound to a channel.
pub trait PacketReceiver: Send + Sync {
    /// Handle one packet. `None` or a `NONE` response means "no reply".
    fn receive(&self, channel: &str, packet: &Packet) -> Option<Response>;
}

/// Publishes response packets off the delivery path.
#[derive(Clone)]
struct Replier {
    provider: Arc<dyn TransportProvider>,
    handle: Handle,
}

impl Replier {
    fn reply(&self, channel: &str, request: &Packet, response: Response) {
        let reply = Packet::response(request.id(), response);
        let payload = match codec::encode(&reply) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, packet_id = %request.id(), "Failed to encode response");
                return;
            }
        };

        let provider = Arc::clone(&self.provider);
        let channel = channel.to_string();
        self.handle.spawn(async move {
            let result = match provider.transport() {
                Ok(transport) => transport.publish(&channel, &payload).await.map(|_| ()),
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!(error = %e, channel = %channel, "Failed to publish response");
            }
        });
    }

    /// Run `receivers` over `packet`, replying with the first real answer.
    fn dispatch(&self, receivers: &[Arc<dyn PacketReceiver>], channel: &str, packet: &Packet) {
        let mut answered = false;
        for receiver in receivers {
            let Some(response) = receiver.receive(channel, packet) else {
                continue;
            };
            if response.response_type.is_none() {
                continue;
            }
            if answered {
                warn!(
                    channel = channel,
                    packet_id = %packet.id(),
                    variant = packet.body().variant_name(),
                    "Discarding extra response from a second receiver"
                );
                continue;
            }
            answered = true;
            self.reply(channel, packet, response);
        }
    }
}

/// Everything registered on one exact channel.
struct ChannelDispatch {
    receivers: RwLock<Vec<Arc<dyn PacketReceiver>>>,
    pending: Arc<PendingRequests>,
    replier: Replier,
}

impl ChannelReceiver for ChannelDispatch {
    fn receive(&self, channel: &str, message: &str) {
        let Some(packet) = codec::decode(message) else {
            return;
        };

        if let PacketBody::Response {
            correlation_id,
            response_type,
            message,
        } = packet.body()
        {
            self.pending.resolve(
                channel,
                *correlation_id,
                Response::new(*response_type, message.clone()),
            );
            return;
        }

        let receivers = self.receivers.read().clone();
        self.replier.dispatch(&receivers, channel, &packet);
    }
}

/// Everything registered on one pattern.
struct PatternDispatch {
    receivers: RwLock<Vec<Arc<dyn PacketReceiver>>>,
    replier: Replier,
}

impl PatternReceiver for PatternDispatch {
    fn receive(&self, _pattern: &str, channel: &str, message: &str) {
        let Some(packet) = codec::decode(message) else {
            return;
        };
        if packet.is_response() {
            return;
        }
        let receivers = self.receivers.read().clone();
        self.replier.dispatch(&receivers, channel, &packet);
    }
}

/// Application-facing bus handle.
pub struct Connection {
    multiplexer: Arc<Multiplexer>,
    pending: Arc<PendingRequests>,
    provider: Arc<dyn TransportProvider>,
    channels: DashMap<String, Arc<ChannelDispatch>>,
    patterns: DashMap<String, Arc<PatternDispatch>>,
    handle: Handle,
}

impl Connection {
    /// Build a connection publishing through `provider`.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    #[must_use]
    pub fn new(provider: Arc<dyn TransportProvider>, request_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            multiplexer: Multiplexer::new(Arc::clone(&provider)),
            pending: PendingRequests::new(request_timeout),
            provider,
            channels: DashMap::new(),
            patterns: DashMap::new(),
            handle: Handle::current(),
        })
    }

    fn replier(&self) -> Replier {
        Replier {
            provider: Arc::clone(&self.provider),
            handle: self.handle.clone(),
        }
    }

    /// Bind `receiver` to `channel`.
    ///
    /// On a transport error the binding is kept and becomes live on the next
    /// resubscribe.
    pub async fn register_receiver(
        self: &Arc<Self>,
        channel: &str,
        receiver: Arc<dyn PacketReceiver>,
    ) -> Result<(), TransportError> {
        let dispatch = self.channel_dispatch(channel);
        dispatch.receivers.write().push(receiver);
        self.multiplexer
            .register_channel(channel, dispatch as Arc<dyn ChannelReceiver>)
            .await?;
        info!(channel = channel, "Registered packet receiver");
        Ok(())
    }

    /// Bind `receiver` to every channel matching the glob `pattern`.
    ///
    /// Pattern receivers see requests only; responses are matched on the
    /// exact channel a request went out on.
    pub async fn register_pattern_receiver(
        self: &Arc<Self>,
        pattern: &str,
        receiver: Arc<dyn PacketReceiver>,
    ) -> Result<(), TransportError> {
        let dispatch = match self.patterns.entry(pattern.to_string()) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                let dispatch = Arc::new(PatternDispatch {
                    receivers: RwLock::new(Vec::new()),
                    replier: self.replier(),
                });
                entry.insert(Arc::clone(&dispatch));
                dispatch
            }
        };
        dispatch.receivers.write().push(receiver);
        self.multiplexer
            .register_pattern(pattern, dispatch as Arc<dyn PatternReceiver>)
            .await?;
        info!(pattern = pattern, "Registered pattern receiver");
        Ok(())
    }

    /// Make sure responses on `channel` reach the pending table.
    pub async fn ensure_channel(self: &Arc<Self>, channel: &str) -> Result<(), TransportError> {
        let dispatch = self.channel_dispatch(channel);
        self.multiplexer
            .register_channel(channel, dispatch as Arc<dyn ChannelReceiver>)
            .await
    }

    fn channel_dispatch(&self, channel: &str) -> Arc<ChannelDispatch> {
        match self.channels.entry(channel.to_string()) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                let dispatch = Arc::new(ChannelDispatch {
                    receivers: RwLock::new(Vec::new()),
                    pending: Arc::clone(&self.pending),
                    replier: self.replier(),
                });
                entry.insert(Arc::clone(&dispatch));
                dispatch
            }
        }
    }

    /// Build a request descriptor for `packet` on `channel`.
    #[must_use]
    pub fn send_packet(self: &Arc<Self>, channel: &str, packet: Packet) -> PacketRequest {
        PacketRequest::new(Arc::clone(self), channel, packet)
    }

    /// Fire-and-forget publish.
    pub(crate) async fn publish(&self, channel: &str, packet: &Packet) -> Result<usize, RequestError> {
        let payload = codec::encode(packet)?;
        let receivers = self.provider.transport()?.publish(channel, &payload).await?;
        debug!(
            channel = channel,
            packet_id = %packet.id(),
            variant = packet.body().variant_name(),
            receivers = receivers,
            "Published packet"
        );
        Ok(receivers)
    }

    /// Register a pending request for `packet`, then publish it.
    pub(crate) async fn request(
        self: &Arc<Self>,
        channel: &str,
        packet: &Packet,
        timeout: Option<Duration>,
    ) -> Result<oneshot::Receiver<Resolution>, RequestError> {
        self.ensure_channel(channel).await?;
        let id: PacketId = packet.id();
        let rx = self.pending.register(id, channel, timeout)?;
        if let Err(e) = self.publish(channel, packet).await {
            self.pending.abandon(id);
            return Err(e);
        }
        Ok(rx)
    }

    /// Re-issue every subscription on the current transport.
    pub async fn resubscribe(self: &Arc<Self>) -> Result<(), TransportError> {
        self.multiplexer.resubscribe().await
    }

    /// Resubscribe every time the supervisor reports a fresh connection.
    pub fn spawn_resubscriber(
        self: &Arc<Self>,
        mut state: watch::Receiver<ConnectionState>,
    ) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        self.handle.spawn(async move {
            while state.changed().await.is_ok() {
                let current = *state.borrow_and_update();
                if current != ConnectionState::Connected {
                    continue;
                }
                let Some(connection) = weak.upgrade() else {
                    break;
                };
                match connection.resubscribe().await {
                    Ok(()) => info!("Restored subscriptions after reconnect"),
                    Err(e) => warn!(error = %e, "Failed to restore subscriptions"),
                }
            }
        })
    }

    #[must_use]
    pub fn pending(&self) -> &Arc<PendingRequests> {
        &self.pending
    }

    #[must_use]
    pub fn multiplexer(&self) -> &Arc<Multiplexer> {
        &self.multiplexer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryBroker, InMemoryTransport};
    use crate::packet::{PacketBody, ResponseType};
    use crate::transport::BroadcastTransport;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const QUERY: &str = "flotilla:query";

    struct FixedProvider(Arc<dyn BroadcastTransport>);

    impl TransportProvider for FixedProvider {
        fn transport(&self) -> Result<Arc<dyn BroadcastTransport>, TransportError> {
            Ok(Arc::clone(&self.0))
        }
    }

    /// Answers every `NodeInfo` with a fixed response.
    struct Answering(Response);

    impl PacketReceiver for Answering {
        fn receive(&self, _channel: &str, packet: &Packet) -> Option<Response> {
            match packet.body() {
                PacketBody::NodeInfo { .. } => Some(self.0.clone()),
                _ => None,
            }
        }
    }

    #[derive(Default)]
    struct Counting {
        seen: Mutex<Vec<String>>,
        responses_seen: AtomicUsize,
    }

    impl PacketReceiver for Counting {
        fn receive(&self, channel: &str, packet: &Packet) -> Option<Response> {
            if packet.is_response() {
                self.responses_seen.fetch_add(1, Ordering::SeqCst);
            }
            self.seen
                .lock()
                .push(format!("{channel}:{}", packet.body().variant_name()));
            Some(Response::none())
        }
    }

    /// Two connections on one broker, as two processes would be.
    fn pair() -> (Arc<InMemoryBroker>, Arc<Connection>, Arc<Connection>) {
        let broker = Arc::new(InMemoryBroker::new());
        let make = |broker: &Arc<InMemoryBroker>| {
            let transport: Arc<dyn BroadcastTransport> =
                Arc::new(InMemoryTransport::new(Arc::clone(broker)));
            Connection::new(Arc::new(FixedProvider(transport)), Duration::from_secs(2))
        };
        let a = make(&broker);
        let b = make(&broker);
        (broker, a, b)
    }

    fn node_info() -> Packet {
        Packet::new(PacketBody::NodeInfo {
            node_id: "lobby-1".into(),
        })
    }

    #[tokio::test]
    async fn test_request_response_round_trip() {
        let (_broker, client, server) = pair();
        server
            .register_receiver(QUERY, Arc::new(Answering(Response::success("{}"))))
            .await
            .unwrap();

        let response = client.send_packet(QUERY, node_info()).response().await.unwrap();
        assert_eq!(response, Response::success("{}"));
        assert_eq!(client.pending().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_error_response_surfaces_as_error() {
        let (_broker, client, server) = pair();
        server
            .register_receiver(QUERY, Arc::new(Answering(Response::not_found("no"))))
            .await
            .unwrap();

        let err = client
            .send_packet(QUERY, node_info())
            .response()
            .await
            .unwrap_err();
        match err {
            RequestError::ErrorResponse(response) => {
                assert_eq!(response.response_type, ResponseType::NotFound)
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_without_responder() {
        let (_broker, client, _server) = pair();

        let err = client
            .send_packet(QUERY, node_info())
            .with_timeout(Duration::from_millis(200))
            .response()
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_callback_fires_once() {
        let (_broker, client, server) = pair();
        server
            .register_receiver(QUERY, Arc::new(Answering(Response::success("ok"))))
            .await
            .unwrap();

        let (tx, rx) = oneshot::channel();
        client
            .send_packet(QUERY, node_info())
            .with_response_callback(move |resolution| {
                let _ = tx.send(resolution);
            })
            .exec()
            .await
            .unwrap();

        assert_eq!(rx.await.unwrap(), Resolution::Succeeded(Response::success("ok")));
    }

    #[tokio::test]
    async fn test_first_responder_wins() {
        let (broker, client, server) = pair();
        server
            .register_receiver(QUERY, Arc::new(Answering(Response::success("first"))))
            .await
            .unwrap();
        server
            .register_receiver(QUERY, Arc::new(Answering(Response::success("second"))))
            .await
            .unwrap();

        let response = client.send_packet(QUERY, node_info()).response().await.unwrap();
        assert_eq!(response.message, "first");

        // Let any stray reply publish before counting.
        tokio::task::yield_now().await;
        // request + exactly one reply
        assert_eq!(broker.messages_published(), 2);
    }

    #[tokio::test]
    async fn test_receivers_never_see_responses() {
        let (_broker, client, server) = pair();
        let counting = Arc::new(Counting::default());
        server
            .register_receiver(QUERY, Arc::new(Answering(Response::success("ok"))))
            .await
            .unwrap();
        client.register_receiver(QUERY, counting.clone()).await.unwrap();

        client.send_packet(QUERY, node_info()).response().await.unwrap();

        assert_eq!(counting.responses_seen.load(Ordering::SeqCst), 0);
        assert_eq!(*counting.seen.lock(), vec![format!("{QUERY}:node_info")]);
    }

    #[tokio::test]
    async fn test_pattern_receiver_sees_matching_channels_only() {
        let (_broker, client, server) = pair();
        let lobby = Arc::new(Counting::default());
        server
            .register_pattern_receiver("lobby-*", lobby.clone())
            .await
            .unwrap();

        client.send_packet("proxy-1", node_info()).exec().await.unwrap();
        client.send_packet("lobby-7", node_info()).exec().await.unwrap();

        assert_eq!(*lobby.seen.lock(), vec!["lobby-7:node_info"]);
    }

    #[tokio::test]
    async fn test_undecodable_message_is_skipped() {
        let (_broker, client, server) = pair();
        let counting = Arc::new(Counting::default());
        server.register_receiver(QUERY, counting.clone()).await.unwrap();

        let transport = client.provider.transport().unwrap();
        transport.publish(QUERY, "garbage").await.unwrap();
        client.send_packet(QUERY, node_info()).exec().await.unwrap();

        assert_eq!(counting.seen.lock().len(), 1);
    }
}
