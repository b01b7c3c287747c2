//! # Node Agent
//!
//! Runs inside a node's container and announces liveness on the
//! `HEARTBEAT` channel. The orchestrator treats any heartbeat as proof of
//! readiness.

use flotilla_bus::{channels, Connection, Packet, PacketBody, PacketId, RequestError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, instrument, warn};

use crate::nodes::NODE_ID_ENV;

/// Default interval between heartbeats.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Periodically publishes `Heartbeat` packets for one application id.
pub struct HeartbeatEmitter {
    connection: Arc<Connection>,
    application_id: String,
    interval: Duration,
}

impl HeartbeatEmitter {
    #[must_use]
    pub fn new(
        connection: Arc<Connection>,
        application_id: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            connection,
            application_id: application_id.into(),
            interval,
        }
    }

    /// Build an emitter for the node id the orchestrator injected into the
    /// container environment. `None` outside a managed container.
    #[must_use]
    pub fn from_env(connection: Arc<Connection>, interval: Duration) -> Option<Self> {
        let application_id = std::env::var(NODE_ID_ENV).ok()?;
        if application_id.is_empty() {
            return None;
        }
        Some(Self::new(connection, application_id, interval))
    }

    #[must_use]
    pub fn application_id(&self) -> &str {
        &self.application_id
    }

    /// Publish a single heartbeat.
    pub async fn beat(&self) -> Result<PacketId, RequestError> {
        let packet = Packet::new(PacketBody::Heartbeat {
            application_id: self.application_id.clone(),
        });
        self.connection
            .send_packet(channels::HEARTBEAT, packet)
            .exec()
            .await
    }

    /// Beat immediately, then every interval until `shutdown` flips to true.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    #[instrument(skip_all, fields(application_id = %self.application_id))]
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.beat().await {
                        warn!(error = %e, "Heartbeat not delivered");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Heartbeat emitter stopped");
    }
}
