//! # Node Lifecycle Manager
//!
//! Creates and destroys containerized nodes and owns their readiness state.
//!
//! ## Readiness signals
//!
//! Two independent signals race to set a node's state:
//!
//! - **Health polling** (passive): [`NodeManager::check_health`] maps the
//!   container's health status through [`NodeState::from_health_status`].
//! - **Heartbeats** (active): [`NodeManager::on_heartbeat`] forces READY.
//!
//! A poll result the state machine rejects (`starting` after READY) is
//! dropped, so a heartbeat's READY survives later polls.
//!
//! ## Stop verification
//!
//! A successful stop only means the engine accepted the request. After the
//! grace period a [`DeferredVerification`] re-lists containers and
//! force-kills a survivor. During [`NodeManager::shutdown`] the wait is
//! skipped and every container is verified before returning.

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use flotilla_bus::{channels, Connection, Packet, PacketBody};
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::{NodeTemplate, NodesConfig};
use crate::container::{ContainerHandle, ContainerRuntime, ContainerSpec, RuntimeError};
use crate::nodes::node::{Node, NodeState, NodeSummary};

/// Environment variable carrying the node id into its container.
pub const NODE_ID_ENV: &str = "FLOTILLA_NODE_ID";

const ID_ATTEMPTS: usize = 4;

/// Node manager errors.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("unknown template '{0}'")]
    UnknownTemplate(String),

    #[error("node '{0}' not found")]
    NotFound(String),

    #[error("could not allocate a unique id for template '{0}'")]
    DuplicateId(String),

    #[error("node '{0}' has no container yet")]
    NotAllocated(String),

    #[error("a stop is already in progress for node '{0}'")]
    AlreadyStopping(String),

    #[error("failed to stop node '{node_id}': {source}")]
    StopFailed {
        node_id: String,
        #[source]
        source: RuntimeError,
    },

    #[error("node manager is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// A scheduled post-stop check: node id plus deadline.
#[derive(Debug, Clone)]
pub struct DeferredVerification {
    pub node_id: String,
    pub container: ContainerHandle,
    pub deadline: Instant,
}

/// Outcome of [`NodeManager::shutdown`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub stopped: usize,
    pub stop_failures: usize,
    pub killed: usize,
}

/// Owns the active node registry.
pub struct NodeManager {
    runtime: Arc<dyn ContainerRuntime>,
    connection: Arc<Connection>,
    stack_name: String,
    config: NodesConfig,
    templates: HashMap<String, NodeTemplate>,
    nodes: DashMap<String, Node>,
    verifications: DashMap<String, DeferredVerification>,
    stopping: AtomicBool,
}

impl NodeManager {
    #[must_use]
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        connection: Arc<Connection>,
        stack_name: impl Into<String>,
        config: NodesConfig,
    ) -> Arc<Self> {
        let templates = config
            .templates
            .iter()
            .map(|t| (t.name.clone(), t.clone()))
            .collect();
        Arc::new(Self {
            runtime,
            connection,
            stack_name: stack_name.into(),
            config,
            templates,
            nodes: DashMap::new(),
            verifications: DashMap::new(),
            stopping: AtomicBool::new(false),
        })
    }

    // =========================================================================
    // START
    // =========================================================================

    /// Start a node from `template` and return its id.
    ///
    /// Returns once the container exists and the started event is out;
    /// readiness arrives later through polling or heartbeats.
    pub async fn start_node(&self, template: &str) -> Result<String, NodeError> {
        let node_id = self.reserve_node(template)?;
        self.launch(&node_id).await?;
        Ok(node_id)
    }

    /// Register a STARTING node for `template` without touching the engine.
    pub fn reserve_node(&self, template: &str) -> Result<String, NodeError> {
        if self.is_stopping() {
            return Err(NodeError::ShuttingDown);
        }
        let template = self
            .templates
            .get(template)
            .ok_or_else(|| NodeError::UnknownTemplate(template.to_string()))?;

        for _ in 0..ID_ATTEMPTS {
            let node_id = generate_node_id(&template.name);
            if let Entry::Vacant(slot) = self.nodes.entry(node_id.clone()) {
                slot.insert(Node::new(node_id.clone(), template));
                debug!(node_id = %node_id, template = %template.name, "Reserved node");
                return Ok(node_id);
            }
        }
        Err(NodeError::DuplicateId(template.name.clone()))
    }

    /// Allocate the container for a reserved node and announce it.
    pub async fn launch(&self, node_id: &str) -> Result<(), NodeError> {
        let template = {
            let node = self
                .nodes
                .get(node_id)
                .ok_or_else(|| NodeError::NotFound(node_id.to_string()))?;
            self.templates
                .get(node.template())
                .cloned()
                .ok_or_else(|| NodeError::UnknownTemplate(node.template().to_string()))?
        };

        let spec = self.container_spec(node_id, &template);
        let handle = match self.runtime.create(&spec).await {
            Ok(handle) => handle,
            Err(e) => {
                self.nodes.remove(node_id);
                warn!(node_id = node_id, error = %e, "Container creation failed");
                return Err(e.into());
            }
        };

        let allocated = match self.nodes.get_mut(node_id) {
            Some(mut node) => {
                node.allocate(handle.clone(), Utc::now());
                true
            }
            None => false,
        };
        if !allocated {
            // Registry was swept while the engine was creating.
            self.discard_container(node_id, &handle).await;
            return Err(NodeError::NotFound(node_id.to_string()));
        }
        if self.is_stopping() {
            // Shutdown began during create. Whoever removes the node owns its container.
            if self.nodes.remove(node_id).is_some() {
                self.discard_container(node_id, &handle).await;
            }
            return Err(NodeError::ShuttingDown);
        }

        match self.runtime.inspect(&handle).await {
            Ok(inspection) => match inspection.ports.get(&template.exposed_port) {
                Some(host_port) => {
                    if let Some(mut node) = self.nodes.get_mut(node_id) {
                        node.set_address(&self.config.advertised_host, *host_port);
                    }
                }
                None => warn!(
                    node_id = node_id,
                    port = template.exposed_port,
                    "Container did not publish the expected port"
                ),
            },
            Err(e) => warn!(node_id = node_id, error = %e, "Could not resolve node address"),
        }

        self.publish_event(PacketBody::NodeStarted {
            node_id: node_id.to_string(),
            template: template.name.clone(),
            kind: template.kind,
        })
        .await;

        info!(
            node_id = node_id,
            template = %template.name,
            container = %handle,
            "Node started"
        );
        Ok(())
    }

    async fn discard_container(&self, node_id: &str, handle: &ContainerHandle) {
        match self.runtime.kill(handle).await {
            Ok(()) => warn!(
                node_id = node_id,
                container = %handle,
                "Killed container of a node that left the registry"
            ),
            Err(e) => error!(
                node_id = node_id,
                container = %handle,
                error = %e,
                "Failed to kill container of a node that left the registry"
            ),
        }
    }

    fn container_spec(&self, node_id: &str, template: &NodeTemplate) -> ContainerSpec {
        let hostname = format!("{}_{}", self.stack_name, node_id);
        let mut env = template.env.clone();
        env.insert(NODE_ID_ENV.to_string(), node_id.to_string());
        ContainerSpec {
            name: hostname.clone(),
            image: template.image.clone(),
            hostname,
            env,
            published_port: template.exposed_port,
        }
    }

    // =========================================================================
    // STOP
    // =========================================================================

    /// Stop a node's container and drop it from the registry.
    ///
    /// Only one stop per node runs at a time; a concurrent caller gets
    /// [`NodeError::AlreadyStopping`]. On failure the node stays registered
    /// and is not retried until the shutdown sweep.
    pub async fn stop_node(self: &Arc<Self>, node_id: &str) -> Result<(), NodeError> {
        let (container, template, kind) = {
            let mut node = self
                .nodes
                .get_mut(node_id)
                .ok_or_else(|| NodeError::NotFound(node_id.to_string()))?;
            let container = node
                .container()
                .cloned()
                .ok_or_else(|| NodeError::NotAllocated(node_id.to_string()))?;
            if !node.claim_stop() {
                return Err(NodeError::AlreadyStopping(node_id.to_string()));
            }
            (container, node.template().to_string(), node.kind())
        };

        if let Err(e) = self.runtime.stop(&container).await {
            if let Some(mut node) = self.nodes.get_mut(node_id) {
                node.release_stop();
            }
            warn!(
                node_id = node_id,
                container = %container,
                error = %e,
                "Failed to stop node, leaving it registered"
            );
            return Err(NodeError::StopFailed {
                node_id: node_id.to_string(),
                source: e,
            });
        }

        if let Some(mut node) = self.nodes.get_mut(node_id) {
            node.transition(NodeState::Shutdown);
        }
        self.publish_event(PacketBody::NodeStopped {
            node_id: node_id.to_string(),
            template,
            kind,
        })
        .await;
        self.nodes.remove(node_id);
        info!(node_id = node_id, container = %container, "Node stopped");

        if !self.is_stopping() {
            self.schedule_verification(node_id, container);
        }
        Ok(())
    }

    /// Issue `stop_node` for every active node without waiting.
    pub fn stop_all_nodes(self: &Arc<Self>) -> usize {
        let ids = self.node_ids();
        for node_id in &ids {
            let manager = Arc::clone(self);
            let node_id = node_id.clone();
            tokio::spawn(async move {
                if let Err(e) = manager.stop_node(&node_id).await {
                    debug!(node_id = %node_id, error = %e, "Stop request did not complete");
                }
            });
        }
        ids.len()
    }

    fn schedule_verification(self: &Arc<Self>, node_id: &str, container: ContainerHandle) {
        let deadline = Instant::now() + self.config.grace_period;
        self.verifications.insert(
            node_id.to_string(),
            DeferredVerification {
                node_id: node_id.to_string(),
                container,
                deadline,
            },
        );

        let weak = Arc::downgrade(self);
        let node_id = node_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let Some(manager) = weak.upgrade() else {
                return;
            };
            // Whoever removes the record runs it; shutdown may have already.
            if let Some((_, record)) = manager.verifications.remove(&node_id) {
                if let Err(e) = manager.verify_stopped(&record.node_id, &record.container).await {
                    warn!(node_id = %node_id, error = %e, "Stop verification failed");
                }
            }
        });
    }

    /// Force-kill `container` if it is still listed. Returns whether it was.
    pub async fn verify_stopped(
        &self,
        node_id: &str,
        container: &ContainerHandle,
    ) -> Result<bool, NodeError> {
        let running = self.runtime.list().await?;
        if !running.contains(container) {
            debug!(node_id = node_id, container = %container, "Container exited cleanly");
            return Ok(false);
        }

        error!(
            node_id = node_id,
            container = %container,
            "Container still running after stop, force-killing"
        );
        self.runtime.kill(container).await?;
        warn!(node_id = node_id, container = %container, "Recovered container by force-kill");
        Ok(true)
    }

    /// Stop everything and verify every container synchronously.
    ///
    /// New starts are refused from here on.
    #[instrument(skip(self))]
    pub async fn shutdown(self: &Arc<Self>) -> ShutdownReport {
        self.stopping.store(true, Ordering::SeqCst);

        let targets: Vec<(String, ContainerHandle)> = self
            .nodes
            .iter()
            .filter_map(|entry| {
                entry
                    .container()
                    .map(|c| (entry.key().clone(), c.clone()))
            })
            .collect();

        let results = join_all(targets.iter().map(|(id, _)| self.stop_node(id))).await;
        let mut report = ShutdownReport::default();
        for result in results {
            match result {
                Ok(()) => report.stopped += 1,
                // the other stop owns the event; verification below still runs
                Err(NodeError::AlreadyStopping(_)) => {}
                Err(_) => report.stop_failures += 1,
            }
        }
        let target_ids: HashSet<String> = targets.iter().map(|(id, _)| id.clone()).collect();

        let deferred: Vec<DeferredVerification> = self
            .verifications
            .iter()
            .map(|entry| entry.key().clone())
            .collect::<Vec<_>>()
            .into_iter()
            .filter_map(|id| self.verifications.remove(&id).map(|(_, record)| record))
            .collect();

        let checks = targets
            .into_iter()
            .chain(deferred.into_iter().map(|r| (r.node_id, r.container)));
        for (node_id, container) in checks {
            match self.verify_stopped(&node_id, &container).await {
                Ok(true) => report.killed += 1,
                Ok(false) => {}
                Err(e) => error!(node_id = %node_id, error = %e, "Shutdown verification failed"),
            }
        }

        // Launches that allocated after the first snapshot.
        let stragglers: Vec<(String, ContainerHandle)> = self
            .nodes
            .iter()
            .filter(|entry| !target_ids.contains(entry.key()))
            .filter_map(|entry| {
                entry
                    .container()
                    .map(|c| (entry.key().clone(), c.clone()))
            })
            .collect();
        for (node_id, container) in stragglers {
            if self.nodes.remove(&node_id).is_none() {
                continue;
            }
            match self.verify_stopped(&node_id, &container).await {
                Ok(true) => report.killed += 1,
                Ok(false) => {}
                Err(e) => error!(node_id = %node_id, error = %e, "Shutdown verification failed"),
            }
        }

        self.nodes.clear();
        info!(
            stopped = report.stopped,
            stop_failures = report.stop_failures,
            killed = report.killed,
            "Node manager shut down"
        );
        report
    }

    // =========================================================================
    // READINESS
    // =========================================================================

    /// Poll the container's health and apply it. Returns the node's state.
    pub async fn check_health(&self, node_id: &str) -> Result<NodeState, NodeError> {
        let container = {
            let node = self
                .nodes
                .get(node_id)
                .ok_or_else(|| NodeError::NotFound(node_id.to_string()))?;
            node.container()
                .cloned()
                .ok_or_else(|| NodeError::NotAllocated(node_id.to_string()))?
        };

        let inspection = self.runtime.inspect(&container).await?;
        let status = inspection.health_status.unwrap_or_default();
        let observed = NodeState::from_health_status(&status);

        let mut node = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| NodeError::NotFound(node_id.to_string()))?;
        let previous = node.state();
        if node.transition(observed) {
            info!(node_id = node_id, from = %previous, to = %observed, "Node state from health poll");
        } else if observed != previous {
            debug!(
                node_id = node_id,
                state = %previous,
                polled = %observed,
                "Ignoring health poll"
            );
        }
        Ok(node.state())
    }

    /// Apply a heartbeat: READY unless the node is already shut down.
    pub fn on_heartbeat(&self, node_id: &str) -> bool {
        let Some(mut node) = self.nodes.get_mut(node_id) else {
            debug!(node_id = node_id, "Heartbeat for unknown node");
            return false;
        };
        node.record_heartbeat(Utc::now());
        let previous = node.state();
        if node.transition(NodeState::Ready) {
            info!(node_id = node_id, from = %previous, "Node is ready (heartbeat)");
        }
        true
    }

    /// Poll every allocated node once.
    pub async fn poll_health(&self) {
        let ids: Vec<String> = self
            .nodes
            .iter()
            .filter(|entry| entry.is_allocated() && !entry.state().is_terminal())
            .map(|entry| entry.key().clone())
            .collect();
        for node_id in ids {
            if let Err(e) = self.check_health(&node_id).await {
                debug!(node_id = %node_id, error = %e, "Health poll failed");
            }
        }
    }

    /// Poll health every `interval` until `shutdown` flips to true.
    pub fn spawn_health_monitor(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                }
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                manager.poll_health().await;
            }
            debug!("Health monitor stopped");
        })
    }

    // =========================================================================
    // QUERIES
    // =========================================================================

    #[must_use]
    pub fn get_node(&self, node_id: &str) -> Option<Node> {
        self.nodes.get(node_id).map(|n| n.clone())
    }

    #[must_use]
    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    /// Summaries of every active node, sorted by id.
    #[must_use]
    pub fn nodes(&self) -> Vec<NodeSummary> {
        let mut summaries: Vec<NodeSummary> = self.nodes.iter().map(|n| n.summary()).collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    #[must_use]
    pub fn node_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.nodes.iter().map(|n| n.key().clone()).collect();
        ids.sort();
        ids
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn pending_verifications(&self) -> usize {
        self.verifications.len()
    }

    #[must_use]
    pub fn template(&self, name: &str) -> Option<&NodeTemplate> {
        self.templates.get(name)
    }

    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    async fn publish_event(&self, body: PacketBody) {
        let variant = body.variant_name();
        let result = self
            .connection
            .send_packet(channels::EVENT, Packet::new(body))
            .exec()
            .await;
        if let Err(e) = result {
            warn!(variant = variant, error = %e, "Failed to publish lifecycle event");
        }
    }
}

fn generate_node_id(template: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{template}-{}", &suffix[..8])
}
