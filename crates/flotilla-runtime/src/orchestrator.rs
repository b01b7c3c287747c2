//! # Orchestrator
//!
//! Wires the bus and the node manager together and owns the process-level
//! lifecycle.
//!
//! ## Startup Sequence
//!
//! 1. Connect the supervisor (fatal on failure)
//! 2. Start the resubscriber so bindings survive transport rebuilds
//! 3. Register the query, heartbeat and event receivers
//! 4. Start the health monitor
//! 5. Start autostart templates
//!
//! ## Shutdown Sequence
//!
//! 1. Signal background tasks
//! 2. Stop every node and verify every container (no grace wait)
//! 3. Disconnect the supervisor
//! 4. Abort whatever is still running

use anyhow::{Context, Result};
use flotilla_bus::{channels, Connection, Supervisor, TransportConnector};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::OrchestratorConfig;
use crate::container::ContainerRuntime;
use crate::handlers::{EventReceiver, HeartbeatReceiver, QueryReceiver};
use crate::nodes::{NodeManager, ShutdownReport};

/// The running orchestrator.
pub struct Orchestrator {
    config: OrchestratorConfig,
    supervisor: Arc<Supervisor>,
    connection: Arc<Connection>,
    manager: Arc<NodeManager>,
    events: Arc<EventReceiver>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Assemble the components. Nothing touches the network until
    /// [`Orchestrator::start`].
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    #[must_use]
    pub fn new(
        config: OrchestratorConfig,
        connector: Arc<dyn TransportConnector>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Self {
        let supervisor = Supervisor::new(config.transport.clone(), connector);
        let connection = Connection::new(supervisor.clone(), config.request_timeout);
        let manager = NodeManager::new(
            runtime,
            Arc::clone(&connection),
            config.stack_name.clone(),
            config.nodes.clone(),
        );
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            config,
            supervisor,
            connection,
            manager,
            events: Arc::new(EventReceiver::new()),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Run the startup sequence.
    pub async fn start(&self) -> Result<()> {
        info!(
            stack = %self.config.stack_name,
            transport = %self.config.transport.address(),
            "Starting flotilla orchestrator"
        );

        self.supervisor
            .connect()
            .await
            .context("failed to connect to the broadcast transport")?;

        let resubscriber = self
            .connection
            .spawn_resubscriber(self.supervisor.subscribe_state());
        self.tasks.lock().push(resubscriber);

        self.connection
            .register_receiver(
                channels::QUERY,
                Arc::new(QueryReceiver::new(Arc::clone(&self.manager))),
            )
            .await
            .context("failed to subscribe to the query channel")?;
        self.connection
            .register_receiver(
                channels::HEARTBEAT,
                Arc::new(HeartbeatReceiver::new(Arc::clone(&self.manager))),
            )
            .await
            .context("failed to subscribe to the heartbeat channel")?;
        self.connection
            .register_receiver(channels::EVENT, self.events.clone())
            .await
            .context("failed to subscribe to the event channel")?;

        let monitor = self
            .manager
            .spawn_health_monitor(self.config.nodes.health_interval, self.shutdown_tx.subscribe());
        self.tasks.lock().push(monitor);

        for template in &self.config.nodes.autostart {
            match self.manager.start_node(template).await {
                Ok(node_id) => info!(template = %template, node_id = %node_id, "Autostarted node"),
                Err(e) => error!(template = %template, error = %e, "Autostart failed"),
            }
        }

        info!(nodes = self.manager.node_count(), "Orchestrator running");
        Ok(())
    }

    /// Run the shutdown sequence. Only the first call does any work.
    pub async fn shutdown(&self) -> ShutdownReport {
        if self.shutdown_tx.send_replace(true) {
            return ShutdownReport::default();
        }
        info!("Shutting down orchestrator");

        let report = self.manager.shutdown().await;
        self.supervisor.disconnect().await;

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }

        info!(
            stopped = report.stopped,
            killed = report.killed,
            events_started = self.events.started_count(),
            events_stopped = self.events.stopped_count(),
            "Orchestrator stopped"
        );
        report
    }

    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    #[must_use]
    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    #[must_use]
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    #[must_use]
    pub fn manager(&self) -> &Arc<NodeManager> {
        &self.manager
    }

    #[must_use]
    pub fn events(&self) -> &Arc<EventReceiver> {
        &self.events
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }
}
