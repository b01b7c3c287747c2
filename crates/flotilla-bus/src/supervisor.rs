//! # Connection Resilience Supervisor
//!
//! Sole owner of the pooled transport. Builds it at startup, probes it on a
//! fixed interval, and rebuilds it when a probe fails.
//!
//! ## Lifecycle
//!
//! ```text
//! connect() ──→ establish() ──→ Connected ──→ probe loop ─┐
//!    │ (error: caller aborts)        ▲                    │ probe fails
//!    │                               └── establish() ◄────┘ (Disconnected)
//! disconnect(): stop probe loop, then close pool (idempotent)
//! ```
//!
//! State changes are published on a `watch` channel so the connection can
//! restore its subscriptions after a rebuild.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::transport::{
    BroadcastTransport, TransportConfig, TransportConnector, TransportError, TransportProvider,
};

/// Whether a validated pool is in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to connect to transport at {address}: {source}")]
    ConnectFailed {
        address: String,
        #[source]
        source: TransportError,
    },
}

struct ProbeTask {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Keeps the broadcast transport alive.
pub struct Supervisor {
    config: TransportConfig,
    connector: Arc<dyn TransportConnector>,
    pool: RwLock<Option<Arc<dyn BroadcastTransport>>>,
    state_tx: watch::Sender<ConnectionState>,
    reconnects: AtomicU64,
    probe_task: Mutex<Option<ProbeTask>>,
}

impl Supervisor {
    #[must_use]
    pub fn new(config: TransportConfig, connector: Arc<dyn TransportConnector>) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Self {
            config,
            connector,
            pool: RwLock::new(None),
            state_tx,
            reconnects: AtomicU64::new(0),
            probe_task: Mutex::new(None),
        })
    }

    /// Build and validate the pool, then start the probe loop.
    ///
    /// An error here is meant to be fatal: callers abort instead of retrying.
    pub async fn connect(self: &Arc<Self>) -> Result<(), SupervisorError> {
        self.establish().await?;
        info!(address = %self.config.address(), "Connected to transport");
        self.start_probe_loop();
        Ok(())
    }

    async fn establish(&self) -> Result<(), SupervisorError> {
        let pool = self
            .connector
            .connect(&self.config)
            .await
            .map_err(|e| self.connect_failed(e))?;

        if let Err(e) = pool.probe().await {
            pool.close().await;
            return Err(self.connect_failed(e));
        }

        let previous = self.pool.write().replace(pool);
        if let Some(previous) = previous {
            previous.close().await;
        }
        self.state_tx.send_replace(ConnectionState::Connected);
        Ok(())
    }

    fn connect_failed(&self, source: TransportError) -> SupervisorError {
        SupervisorError::ConnectFailed {
            address: self.config.address(),
            source,
        }
    }

    fn start_probe_loop(self: &Arc<Self>) {
        let mut slot = self.probe_task.lock();
        if slot.is_some() {
            return;
        }
        let (stop, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(Self::probe_loop(
            Arc::downgrade(self),
            self.config.probe_interval,
            stop_rx,
        ));
        *slot = Some(ProbeTask { stop, handle });
    }

    #[instrument(skip_all, name = "transport_probe")]
    async fn probe_loop(weak: Weak<Self>, interval: Duration, mut stop: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = stop.changed() => break,
            }
            let Some(supervisor) = weak.upgrade() else {
                break;
            };
            supervisor.probe_once().await;
        }
        debug!("Probe loop stopped");
    }

    /// Probe the pool once, rebuilding it on failure. Returns probe success.
    pub async fn probe_once(&self) -> bool {
        let pool = self.pool.read().clone();
        let result = match pool {
            Some(pool) => pool.probe().await,
            None => Err(TransportError::NotConnected),
        };

        let Err(e) = result else {
            trace!("Transport probe ok");
            return true;
        };

        warn!(error = %e, "Transport probe failed, rebuilding pool");
        self.state_tx.send_replace(ConnectionState::Disconnected);
        self.reconnects.fetch_add(1, Ordering::Relaxed);
        match self.establish().await {
            Ok(()) => info!(address = %self.config.address(), "Transport pool rebuilt"),
            Err(e) => error!(error = %e, "Transport reconnect failed, retrying next interval"),
        }
        false
    }

    /// Stop the probe loop, then close the pool. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        let task = self.probe_task.lock().take();
        if let Some(task) = task {
            let _ = task.stop.send(true);
            if let Err(e) = task.handle.await {
                warn!(error = %e, "Probe loop ended abnormally");
            }
        }

        let pool = self.pool.write().take();
        if let Some(pool) = pool {
            pool.close().await;
            self.state_tx.send_replace(ConnectionState::Disconnected);
            info!("Disconnected from transport");
        }
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Watch connection state changes.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Number of failed probes that triggered a rebuild.
    #[must_use]
    pub fn reconnect_count(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }
}

impl TransportProvider for Supervisor {
    fn transport(&self) -> Result<Arc<dyn BroadcastTransport>, TransportError> {
        self.pool.read().clone().ok_or(TransportError::NotConnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryBroker, InMemoryConnector};
    use crate::transport::DeliverySink;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Wraps a transport to count `close` calls.
    struct CountingTransport {
        inner: Arc<dyn BroadcastTransport>,
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl BroadcastTransport for CountingTransport {
        async fn publish(&self, channel: &str, payload: &str) -> Result<usize, TransportError> {
            self.inner.publish(channel, payload).await
        }
        async fn subscribe(
            &self,
            sink: Arc<dyn DeliverySink>,
            channels: &[String],
        ) -> Result<(), TransportError> {
            self.inner.subscribe(sink, channels).await
        }
        async fn psubscribe(
            &self,
            sink: Arc<dyn DeliverySink>,
            patterns: &[String],
        ) -> Result<(), TransportError> {
            self.inner.psubscribe(sink, patterns).await
        }
        async fn probe(&self) -> Result<(), TransportError> {
            self.inner.probe().await
        }
        async fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
            self.inner.close().await;
        }
    }

    struct CountingConnector {
        inner: InMemoryConnector,
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TransportConnector for CountingConnector {
        async fn connect(
            &self,
            config: &TransportConfig,
        ) -> Result<Arc<dyn BroadcastTransport>, TransportError> {
            let inner = self.inner.connect(config).await?;
            Ok(Arc::new(CountingTransport {
                inner,
                closes: Arc::clone(&self.closes),
            }))
        }
    }

    fn config() -> TransportConfig {
        TransportConfig {
            probe_interval: Duration::from_secs(1),
            ..TransportConfig::default()
        }
    }

    fn setup() -> (Arc<InMemoryBroker>, Arc<InMemoryConnector>, Arc<Supervisor>) {
        let broker = Arc::new(InMemoryBroker::new());
        let connector = Arc::new(InMemoryConnector::new(Arc::clone(&broker)));
        let supervisor = Supervisor::new(config(), connector.clone());
        (broker, connector, supervisor)
    }

    #[tokio::test]
    async fn test_connect_success() {
        let (_broker, _connector, supervisor) = setup();
        let mut state = supervisor.subscribe_state();

        supervisor.connect().await.unwrap();

        assert!(supervisor.is_connected());
        assert!(supervisor.transport().is_ok());
        assert!(state.has_changed().unwrap());
        assert_eq!(*state.borrow_and_update(), ConnectionState::Connected);
        supervisor.disconnect().await;
    }

    #[tokio::test]
    async fn test_initial_connect_failure_is_reported() {
        let (broker, _connector, supervisor) = setup();
        broker.set_available(false);

        let err = supervisor.connect().await.unwrap_err();
        assert!(err.to_string().contains("localhost:6379"));
        assert_eq!(supervisor.state(), ConnectionState::Disconnected);
        assert_eq!(
            supervisor.transport().err(),
            Some(TransportError::NotConnected)
        );
        assert!(supervisor.probe_task.lock().is_none());
    }

    #[tokio::test]
    async fn test_probe_failure_rebuilds_pool() {
        let (broker, connector, supervisor) = setup();
        supervisor.connect().await.unwrap();

        broker.set_available(false);
        assert!(!supervisor.probe_once().await);
        assert_eq!(supervisor.state(), ConnectionState::Disconnected);
        assert_eq!(connector.connection_count(), 1);

        broker.set_available(true);
        // old pool is stale after the outage
        assert!(!supervisor.probe_once().await);
        assert!(supervisor.is_connected());
        assert_eq!(connector.connection_count(), 2);
        assert_eq!(supervisor.reconnect_count(), 2);

        assert!(supervisor.probe_once().await);
        supervisor.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_loop_heals_in_background() {
        let (broker, connector, supervisor) = setup();
        supervisor.connect().await.unwrap();

        broker.set_available(false);
        broker.set_available(true);
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert!(supervisor.is_connected());
        assert_eq!(connector.connection_count(), 2);
        assert!(supervisor.transport().unwrap().probe().await.is_ok());
        supervisor.disconnect().await;
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let broker = Arc::new(InMemoryBroker::new());
        let closes = Arc::new(AtomicUsize::new(0));
        let connector = Arc::new(CountingConnector {
            inner: InMemoryConnector::new(broker),
            closes: Arc::clone(&closes),
        });
        let supervisor = Supervisor::new(config(), connector);
        supervisor.connect().await.unwrap();

        supervisor.disconnect().await;
        supervisor.disconnect().await;

        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(supervisor.state(), ConnectionState::Disconnected);
        assert!(supervisor.probe_task.lock().is_none());
    }

    #[tokio::test]
    async fn test_disconnect_before_connect() {
        let (_broker, _connector, supervisor) = setup();
        supervisor.disconnect().await;
        assert_eq!(supervisor.state(), ConnectionState::Disconnected);
    }
}
