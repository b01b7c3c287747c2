//! # In-Memory Broker
//!
//! A process-local stand-in for a pub/sub server. Suitable for single-process
//! operation and tests; distributed deployments plug a network client in
//! behind the same [`BroadcastTransport`] trait.
//!
//! Delivery happens synchronously on the publishing task, in publish order.
//! An outage (`set_available(false)`) drops every subscription and
//! invalidates every client built before it, like a server restart would.

use async_trait::async_trait;
use globset::{Glob, GlobMatcher};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::transport::{
    BroadcastTransport, Delivery, DeliverySink, TransportConfig, TransportConnector,
    TransportError,
};

/// One client's physical subscription.
struct ClientSubscription {
    sink: Arc<dyn DeliverySink>,
    channels: HashSet<String>,
    patterns: Vec<(String, GlobMatcher)>,
}

/// The shared "server" side.
pub struct InMemoryBroker {
    clients: RwLock<BTreeMap<u64, ClientSubscription>>,
    next_client_id: AtomicU64,
    /// Bumped on every outage; clients from older epochs are dead.
    epoch: AtomicU64,
    available: AtomicBool,
    password: Option<String>,
    messages_published: AtomicU64,
}

impl InMemoryBroker {
    /// A broker that accepts unauthenticated clients.
    #[must_use]
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(BTreeMap::new()),
            next_client_id: AtomicU64::new(1),
            epoch: AtomicU64::new(0),
            available: AtomicBool::new(true),
            password: None,
            messages_published: AtomicU64::new(0),
        }
    }

    /// A broker that only accepts clients presenting `password`.
    #[must_use]
    pub fn with_password(password: impl Into<String>) -> Self {
        Self {
            password: Some(password.into()),
            ..Self::new()
        }
    }

    /// Simulate an outage (`false`) or recovery (`true`).
    pub fn set_available(&self, available: bool) {
        let was = self.available.swap(available, Ordering::SeqCst);
        if was && !available {
            self.epoch.fetch_add(1, Ordering::SeqCst);
            self.clients.write().clear();
            warn!("In-memory broker went down, all subscriptions dropped");
        } else if !was && available {
            debug!("In-memory broker is back up");
        }
    }

    #[must_use]
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Number of clients holding a subscription.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.clients.read().len()
    }

    /// Every channel subscribed by any client, sorted.
    #[must_use]
    pub fn subscribed_channels(&self) -> Vec<String> {
        let clients = self.clients.read();
        let mut channels: Vec<String> = clients
            .values()
            .flat_map(|sub| sub.channels.iter().cloned())
            .collect();
        channels.sort();
        channels.dedup();
        channels
    }

    /// Total messages accepted for publishing.
    #[must_use]
    pub fn messages_published(&self) -> u64 {
        self.messages_published.load(Ordering::Relaxed)
    }

    fn register_client(&self) -> (u64, u64) {
        let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        (id, self.epoch.load(Ordering::SeqCst))
    }

    fn is_live(&self, epoch: u64) -> bool {
        self.is_available() && self.epoch.load(Ordering::SeqCst) == epoch
    }

    fn add_channels(&self, client_id: u64, sink: Arc<dyn DeliverySink>, channels: &[String]) {
        let mut clients = self.clients.write();
        let sub = clients.entry(client_id).or_insert_with(|| ClientSubscription {
            sink,
            channels: HashSet::new(),
            patterns: Vec::new(),
        });
        sub.channels.extend(channels.iter().cloned());
    }

    fn add_patterns(
        &self,
        client_id: u64,
        sink: Arc<dyn DeliverySink>,
        patterns: &[String],
    ) -> Result<(), TransportError> {
        let mut compiled = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            let matcher = Glob::new(pattern)
                .map_err(|e| TransportError::InvalidPattern {
                    pattern: pattern.clone(),
                    reason: e.to_string(),
                })?
                .compile_matcher();
            compiled.push((pattern.clone(), matcher));
        }

        let mut clients = self.clients.write();
        let sub = clients.entry(client_id).or_insert_with(|| ClientSubscription {
            sink,
            channels: HashSet::new(),
            patterns: Vec::new(),
        });
        for (pattern, matcher) in compiled {
            if !sub.patterns.iter().any(|(existing, _)| *existing == pattern) {
                sub.patterns.push((pattern, matcher));
            }
        }
        Ok(())
    }

    fn remove_client(&self, client_id: u64) {
        self.clients.write().remove(&client_id);
    }

    fn publish(&self, channel: &str, payload: &str) -> usize {
        self.messages_published.fetch_add(1, Ordering::Relaxed);

        // Collect under the lock, deliver outside it: sinks may subscribe re-entrantly.
        let deliveries: Vec<(Arc<dyn DeliverySink>, Delivery)> = {
            let clients = self.clients.read();
            let mut out = Vec::new();
            for sub in clients.values() {
                if sub.channels.contains(channel) {
                    out.push((
                        Arc::clone(&sub.sink),
                        Delivery::Message {
                            channel: channel.to_string(),
                            payload: payload.to_string(),
                        },
                    ));
                }
                for (pattern, matcher) in &sub.patterns {
                    if matcher.is_match(channel) {
                        out.push((
                            Arc::clone(&sub.sink),
                            Delivery::Pattern {
                                pattern: pattern.clone(),
                                channel: channel.to_string(),
                                payload: payload.to_string(),
                            },
                        ));
                    }
                }
            }
            out
        };

        let receivers = deliveries.len();
        for (sink, delivery) in deliveries {
            sink.deliver(delivery);
        }
        receivers
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// A client "pool" connected to an [`InMemoryBroker`].
pub struct InMemoryTransport {
    broker: Arc<InMemoryBroker>,
    client_id: u64,
    epoch: u64,
    closed: AtomicBool,
}

impl InMemoryTransport {
    #[must_use]
    pub fn new(broker: Arc<InMemoryBroker>) -> Self {
        let (client_id, epoch) = broker.register_client();
        Self {
            broker,
            client_id,
            epoch,
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if !self.broker.is_available() {
            return Err(TransportError::Unreachable("in-memory broker".to_string()));
        }
        if !self.broker.is_live(self.epoch) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl BroadcastTransport for InMemoryTransport {
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize, TransportError> {
        self.check()?;
        Ok(self.broker.publish(channel, payload))
    }

    async fn subscribe(
        &self,
        sink: Arc<dyn DeliverySink>,
        channels: &[String],
    ) -> Result<(), TransportError> {
        self.check()?;
        self.broker.add_channels(self.client_id, sink, channels);
        debug!(client = self.client_id, channels = ?channels, "Subscribed");
        Ok(())
    }

    async fn psubscribe(
        &self,
        sink: Arc<dyn DeliverySink>,
        patterns: &[String],
    ) -> Result<(), TransportError> {
        self.check()?;
        self.broker.add_patterns(self.client_id, sink, patterns)?;
        debug!(client = self.client_id, patterns = ?patterns, "Pattern-subscribed");
        Ok(())
    }

    async fn probe(&self) -> Result<(), TransportError> {
        self.check()
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.broker.remove_client(self.client_id);
            debug!(client = self.client_id, "In-memory transport closed");
        }
    }
}

/// Connects [`InMemoryTransport`]s to one shared broker.
pub struct InMemoryConnector {
    broker: Arc<InMemoryBroker>,
    connections: AtomicU64,
}

impl InMemoryConnector {
    #[must_use]
    pub fn new(broker: Arc<InMemoryBroker>) -> Self {
        Self {
            broker,
            connections: AtomicU64::new(0),
        }
    }

    /// Number of pools built so far.
    #[must_use]
    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn broker(&self) -> &Arc<InMemoryBroker> {
        &self.broker
    }
}

#[async_trait]
impl TransportConnector for InMemoryConnector {
    async fn connect(
        &self,
        config: &TransportConfig,
    ) -> Result<Arc<dyn BroadcastTransport>, TransportError> {
        if !self.broker.is_available() {
            return Err(TransportError::Unreachable(config.address()));
        }
        if self.broker.password.is_some() && self.broker.password != config.password {
            return Err(TransportError::AuthenticationFailed);
        }
        self.connections.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(InMemoryTransport::new(Arc::clone(&self.broker))))
    }
}
