//! # Pub/Sub Multiplexer
//!
//! Fans one physical transport subscription out to many logical receivers.
//!
//! Two independent registries: exact channel name → receivers, and glob
//! pattern → receivers. Registering the first receiver for a key extends
//! the physical subscription; the existing subscription is never torn down.
//!
//! Dispatch clones the receiver list before invoking it, so registration
//! may race with delivery without corrupting iteration.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::transport::{Delivery, DeliverySink, TransportError, TransportProvider};

/// Logical receiver for an exact channel.
pub trait ChannelReceiver: Send + Sync {
    fn receive(&self, channel: &str, message: &str);
}

/// Logical receiver for a pattern subscription.
pub trait PatternReceiver: Send + Sync {
    fn receive(&self, pattern: &str, channel: &str, message: &str);
}

/// Identity comparison that ignores vtable pointers.
fn same_receiver<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// The process-wide subscription owner.
pub struct Multiplexer {
    channels: DashMap<String, Vec<Arc<dyn ChannelReceiver>>>,
    patterns: DashMap<String, Vec<Arc<dyn PatternReceiver>>>,
    provider: Arc<dyn TransportProvider>,
}

impl Multiplexer {
    #[must_use]
    pub fn new(provider: Arc<dyn TransportProvider>) -> Arc<Self> {
        Arc::new(Self {
            channels: DashMap::new(),
            patterns: DashMap::new(),
            provider,
        })
    }

    /// Add a receiver for an exact channel.
    ///
    /// The receiver is recorded even when the transport subscription fails;
    /// [`Multiplexer::resubscribe`] picks it up after the next reconnect.
    pub async fn register_channel(
        self: &Arc<Self>,
        channel: &str,
        receiver: Arc<dyn ChannelReceiver>,
    ) -> Result<(), TransportError> {
        let first_for_channel = {
            let mut receivers = self.channels.entry(channel.to_string()).or_default();
            if receivers.iter().any(|r| same_receiver(r, &receiver)) {
                return Ok(());
            }
            receivers.push(receiver);
            receivers.len() == 1
        };

        if first_for_channel {
            let transport = self.provider.transport()?;
            transport
                .subscribe(self.sink(), &[channel.to_string()])
                .await?;
            debug!(channel = channel, "Extended subscription with channel");
        }
        Ok(())
    }

    /// Add a receiver for a glob pattern (`*`, `?`, `[...]`).
    pub async fn register_pattern(
        self: &Arc<Self>,
        pattern: &str,
        receiver: Arc<dyn PatternReceiver>,
    ) -> Result<(), TransportError> {
        let first_for_pattern = {
            let mut receivers = self.patterns.entry(pattern.to_string()).or_default();
            if receivers.iter().any(|r| same_receiver(r, &receiver)) {
                return Ok(());
            }
            receivers.push(receiver);
            receivers.len() == 1
        };

        if first_for_pattern {
            let transport = self.provider.transport()?;
            transport
                .psubscribe(self.sink(), &[pattern.to_string()])
                .await?;
            debug!(pattern = pattern, "Extended subscription with pattern");
        }
        Ok(())
    }

    /// Remove a channel receiver. The physical subscription is left in
    /// place; messages for a key with no receivers are ignored.
    pub fn unregister_channel(&self, channel: &str, receiver: &Arc<dyn ChannelReceiver>) -> bool {
        let removed = match self.channels.get_mut(channel) {
            Some(mut receivers) => {
                let before = receivers.len();
                receivers.retain(|r| !same_receiver(r, receiver));
                receivers.len() != before
            }
            None => false,
        };
        self.channels.remove_if(channel, |_, receivers| receivers.is_empty());
        removed
    }

    /// Remove a pattern receiver.
    pub fn unregister_pattern(&self, pattern: &str, receiver: &Arc<dyn PatternReceiver>) -> bool {
        let removed = match self.patterns.get_mut(pattern) {
            Some(mut receivers) => {
                let before = receivers.len();
                receivers.retain(|r| !same_receiver(r, receiver));
                receivers.len() != before
            }
            None => false,
        };
        self.patterns.remove_if(pattern, |_, receivers| receivers.is_empty());
        removed
    }

    /// Re-issue every known channel and pattern on the current transport.
    pub async fn resubscribe(self: &Arc<Self>) -> Result<(), TransportError> {
        let transport = self.provider.transport()?;

        let channels = self.channels_subscribed();
        if !channels.is_empty() {
            transport.subscribe(self.sink(), &channels).await?;
        }
        let patterns = self.patterns_subscribed();
        if !patterns.is_empty() {
            transport.psubscribe(self.sink(), &patterns).await?;
        }

        debug!(
            channels = channels.len(),
            patterns = patterns.len(),
            "Resubscribed"
        );
        Ok(())
    }

    /// Channels with at least one receiver, sorted.
    #[must_use]
    pub fn channels_subscribed(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.channels.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Patterns with at least one receiver, sorted.
    #[must_use]
    pub fn patterns_subscribed(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.patterns.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    fn sink(self: &Arc<Self>) -> Arc<dyn DeliverySink> {
        Arc::clone(self) as Arc<dyn DeliverySink>
    }
}

impl DeliverySink for Multiplexer {
    fn deliver(&self, delivery: Delivery) {
        match delivery {
            Delivery::Message { channel, payload } => {
                // Snapshot, then release the shard lock before calling out.
                let receivers = self.channels.get(&channel).map(|r| r.clone());
                match receivers {
                    Some(receivers) => {
                        for receiver in receivers {
                            receiver.receive(&channel, &payload);
                        }
                    }
                    None => trace!(channel = %channel, "No receivers for channel"),
                }
            }
            Delivery::Pattern {
                pattern,
                channel,
                payload,
            } => {
                let receivers = self.patterns.get(&pattern).map(|r| r.clone());
                if let Some(receivers) = receivers {
                    for receiver in receivers {
                        receiver.receive(&pattern, &channel, &payload);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryBroker, InMemoryTransport};
    use crate::transport::BroadcastTransport;
    use parking_lot::Mutex;

    struct FixedProvider(Arc<dyn BroadcastTransport>);

    impl TransportProvider for FixedProvider {
        fn transport(&self) -> Result<Arc<dyn BroadcastTransport>, TransportError> {
            Ok(Arc::clone(&self.0))
        }
    }

    struct SwapProvider(Mutex<Arc<dyn BroadcastTransport>>);

    impl TransportProvider for SwapProvider {
        fn transport(&self) -> Result<Arc<dyn BroadcastTransport>, TransportError> {
            Ok(Arc::clone(&self.0.lock()))
        }
    }

    struct NoTransport;

    impl TransportProvider for NoTransport {
        fn transport(&self) -> Result<Arc<dyn BroadcastTransport>, TransportError> {
            Err(TransportError::NotConnected)
        }
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl ChannelReceiver for Recorder {
        fn receive(&self, channel: &str, message: &str) {
            self.seen.lock().push(format!("{channel}:{message}"));
        }
    }

    impl PatternReceiver for Recorder {
        fn receive(&self, pattern: &str, channel: &str, message: &str) {
            self.seen.lock().push(format!("{pattern}|{channel}:{message}"));
        }
    }

    fn setup() -> (Arc<InMemoryBroker>, Arc<dyn BroadcastTransport>, Arc<Multiplexer>) {
        let broker = Arc::new(InMemoryBroker::new());
        let transport: Arc<dyn BroadcastTransport> =
            Arc::new(InMemoryTransport::new(Arc::clone(&broker)));
        let mux = Multiplexer::new(Arc::new(FixedProvider(Arc::clone(&transport))));
        (broker, transport, mux)
    }

    #[tokio::test]
    async fn test_fan_out_to_every_channel_receiver() {
        let (_broker, transport, mux) = setup();
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());

        mux.register_channel("lobby-1", a.clone()).await.unwrap();
        mux.register_channel("lobby-1", b.clone()).await.unwrap();

        transport.publish("lobby-1", "one").await.unwrap();
        transport.publish("lobby-1", "two").await.unwrap();

        assert_eq!(*a.seen.lock(), vec!["lobby-1:one", "lobby-1:two"]);
        assert_eq!(*b.seen.lock(), vec!["lobby-1:one", "lobby-1:two"]);
    }

    #[tokio::test]
    async fn test_pattern_receiver_ignores_non_matching_channel() {
        let (_broker, transport, mux) = setup();
        let lobby = Arc::new(Recorder::default());

        mux.register_pattern("lobby-*", lobby.clone()).await.unwrap();

        transport.publish("proxy-1", "x").await.unwrap();
        transport.publish("lobby-2", "y").await.unwrap();

        assert_eq!(*lobby.seen.lock(), vec!["lobby-*|lobby-2:y"]);
    }

    #[tokio::test]
    async fn test_single_physical_subscription() {
        let (broker, _transport, mux) = setup();
        let r = Arc::new(Recorder::default());

        mux.register_channel("a", r.clone()).await.unwrap();
        mux.register_channel("b", r.clone()).await.unwrap();
        mux.register_pattern("c-*", r.clone()).await.unwrap();

        assert_eq!(broker.subscription_count(), 1);
        assert_eq!(broker.subscribed_channels(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_duplicate_registration_is_ignored() {
        let (_broker, transport, mux) = setup();
        let r = Arc::new(Recorder::default());

        mux.register_channel("a", r.clone()).await.unwrap();
        mux.register_channel("a", r.clone()).await.unwrap();
        transport.publish("a", "m").await.unwrap();

        assert_eq!(r.seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_unregister_stops_delivery() {
        let (_broker, transport, mux) = setup();
        let r = Arc::new(Recorder::default());
        let as_receiver: Arc<dyn ChannelReceiver> = r.clone();

        mux.register_channel("a", Arc::clone(&as_receiver)).await.unwrap();
        assert!(mux.unregister_channel("a", &as_receiver));
        assert!(!mux.unregister_channel("a", &as_receiver));
        assert!(mux.channels_subscribed().is_empty());

        transport.publish("a", "m").await.unwrap();
        assert!(r.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_registration_kept_without_transport() {
        let mux = Multiplexer::new(Arc::new(NoTransport));
        let r = Arc::new(Recorder::default());

        let result = mux.register_channel("a", r).await;
        assert_eq!(result, Err(TransportError::NotConnected));
        assert_eq!(mux.channels_subscribed(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_resubscribe_on_fresh_transport() {
        let broker = Arc::new(InMemoryBroker::new());
        let first: Arc<dyn BroadcastTransport> =
            Arc::new(InMemoryTransport::new(Arc::clone(&broker)));
        let provider = Arc::new(SwapProvider(Mutex::new(first)));
        let mux = Multiplexer::new(provider.clone());
        let r = Arc::new(Recorder::default());
        mux.register_channel("a", r.clone()).await.unwrap();
        mux.register_pattern("b-*", r.clone()).await.unwrap();

        broker.set_available(false);
        broker.set_available(true);
        assert_eq!(broker.subscription_count(), 0);

        let fresh: Arc<dyn BroadcastTransport> =
            Arc::new(InMemoryTransport::new(Arc::clone(&broker)));
        *provider.0.lock() = Arc::clone(&fresh);
        mux.resubscribe().await.unwrap();

        fresh.publish("a", "after").await.unwrap();
        fresh.publish("b-1", "too").await.unwrap();
        assert_eq!(*r.seen.lock(), vec!["a:after", "b-*|b-1:too"]);
    }
}
