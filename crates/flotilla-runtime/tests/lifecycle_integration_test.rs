//! # Node Lifecycle Integration Tests
//!
//! Drive the full stack the way a deployment does:
//!
//! ```text
//! client Connection ──QUERY──→ InMemoryBroker ──→ Orchestrator
//!                                                   ├─ Supervisor / Connection
//!                                                   ├─ receivers
//!                                                   └─ NodeManager ──→ InMemoryContainerRuntime
//! ```
//!
//! 1. **Lifecycle**: STARTING → READY (poll, heartbeat) → SHUTDOWN → removed
//! 2. **Query RPC**: start/info/stop over the bus, with correlated responses
//! 3. **Agent**: heartbeat emitter drives readiness
//! 4. **Resilience**: subscriptions come back after a broker outage

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use flotilla_bus::{
    channels, Connection, InMemoryBroker, InMemoryConnector, Packet, PacketBody, RequestError,
    ResponseType, Supervisor, TransportConfig,
};
use flotilla_runtime::{
    HeartbeatEmitter, InMemoryContainerRuntime, NodeState, NodeSummary, Orchestrator,
    OrchestratorConfig,
};

struct Stack {
    broker: Arc<InMemoryBroker>,
    runtime: Arc<InMemoryContainerRuntime>,
    orchestrator: Orchestrator,
}

async fn stack() -> Stack {
    let broker = Arc::new(InMemoryBroker::new());
    let runtime = Arc::new(InMemoryContainerRuntime::new());
    let mut config = OrchestratorConfig::default();
    config.nodes.grace_period = Duration::from_millis(50);
    config.nodes.health_interval = Duration::from_secs(3600);

    let orchestrator = Orchestrator::new(
        config,
        Arc::new(InMemoryConnector::new(Arc::clone(&broker))),
        runtime.clone(),
    );
    orchestrator.start().await.expect("orchestrator starts");
    Stack {
        broker,
        runtime,
        orchestrator,
    }
}

/// A second process on the same broker.
async fn client(broker: &Arc<InMemoryBroker>) -> (Arc<Supervisor>, Arc<Connection>) {
    let supervisor = Supervisor::new(
        TransportConfig::default(),
        Arc::new(InMemoryConnector::new(Arc::clone(broker))),
    );
    supervisor.connect().await.expect("client connects");
    let connection = Connection::new(supervisor.clone(), Duration::from_secs(1));
    (supervisor, connection)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

/// The full lifecycle of one lobby node, including the stale-poll race.
#[tokio::test(start_paused = true)]
async fn test_lobby_lifecycle_end_to_end() {
    // Arrange
    let stack = stack().await;
    let manager = Arc::clone(stack.orchestrator.manager());

    // Act: start
    let node_id = manager.start_node("lobby").await.unwrap();
    let node = manager.get_node(&node_id).unwrap();
    let container = node.container().cloned().unwrap();

    // Assert: STARTING with a resolved address
    assert_eq!(node.state(), NodeState::Starting);
    assert!(node.address().is_some());

    // healthy poll → READY
    stack.runtime.set_health(&container, "healthy");
    assert_eq!(manager.check_health(&node_id).await.unwrap(), NodeState::Ready);

    // heartbeat keeps it READY
    assert!(manager.on_heartbeat(&node_id));
    assert_eq!(manager.get_node(&node_id).unwrap().state(), NodeState::Ready);

    // a late "starting" poll is not applied
    stack.runtime.set_health(&container, "starting");
    assert_eq!(manager.check_health(&node_id).await.unwrap(), NodeState::Ready);

    // Act: stop
    manager.stop_node(&node_id).await.unwrap();

    // Assert: removed, announced once, never force-killed
    assert!(!manager.contains(&node_id));
    assert_eq!(stack.orchestrator.events().stopped_count(), 1);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(stack.runtime.kill_log().is_empty());
    assert_eq!(manager.pending_verifications(), 0);

    stack.orchestrator.shutdown().await;
}

/// Start, inspect and stop a node from another process over the bus.
#[tokio::test]
async fn test_query_rpc_round_trip() {
    // Arrange
    let stack = stack().await;
    let (_supervisor, client) = client(&stack.broker).await;
    let manager = Arc::clone(stack.orchestrator.manager());

    // Act: StartNode
    let started = client
        .send_packet(
            channels::QUERY,
            Packet::new(PacketBody::StartNode {
                template: "proxy".into(),
            }),
        )
        .response()
        .await
        .unwrap();

    // Assert: the reserved id comes back before the container exists
    assert_eq!(started.response_type, ResponseType::Success);
    let node_id = started.message;
    assert!(node_id.starts_with("proxy-"));
    wait_until(|| manager.get_node(&node_id).is_some_and(|n| n.is_allocated())).await;

    // Act: NodeInfo
    let info = client
        .send_packet(
            channels::QUERY,
            Packet::new(PacketBody::NodeInfo {
                node_id: node_id.clone(),
            }),
        )
        .response()
        .await
        .unwrap();
    let summary: NodeSummary = serde_json::from_str(&info.message).unwrap();
    assert_eq!(summary.id, node_id);
    assert_eq!(summary.template, "proxy");
    assert!(summary.container.is_some());

    // Act: StopNode
    let stopped = client
        .send_packet(
            channels::QUERY,
            Packet::new(PacketBody::StopNode {
                node_id: node_id.clone(),
            }),
        )
        .response()
        .await
        .unwrap();
    assert_eq!(stopped.response_type, ResponseType::Success);
    wait_until(|| !manager.contains(&node_id)).await;
    assert_eq!(stack.runtime.running_count(), 0);

    // unknown template surfaces as an error response
    let err = client
        .send_packet(
            channels::QUERY,
            Packet::new(PacketBody::StartNode {
                template: "survival".into(),
            }),
        )
        .response()
        .await
        .unwrap_err();
    match err {
        RequestError::ErrorResponse(response) => {
            assert_eq!(response.response_type, ResponseType::NotFound);
        }
        other => panic!("expected an error response, got {other:?}"),
    }

    let stats = client.pending().stats();
    assert_eq!(stats.total_succeeded.load(Ordering::Relaxed), 3);
    assert_eq!(stats.total_failed.load(Ordering::Relaxed), 1);
    assert_eq!(client.pending().pending_count(), 0);

    stack.orchestrator.shutdown().await;
}

/// Heartbeats from a node agent mark the node READY.
#[tokio::test]
async fn test_agent_heartbeat_marks_ready() {
    // Arrange
    let stack = stack().await;
    let manager = Arc::clone(stack.orchestrator.manager());
    let node_id = manager.start_node("lobby").await.unwrap();
    let (_supervisor, agent_connection) = client(&stack.broker).await;

    // Act
    let emitter = HeartbeatEmitter::new(agent_connection, node_id.clone(), Duration::from_secs(1));
    emitter.beat().await.unwrap();

    // Assert
    let node = manager.get_node(&node_id).unwrap();
    assert_eq!(node.state(), NodeState::Ready);
    assert!(node.last_heartbeat().is_some());

    stack.orchestrator.shutdown().await;
}

/// After a broker outage the supervisor rebuilds the pool and every
/// binding is live again.
#[tokio::test]
async fn test_subscriptions_restored_after_outage() {
    // Arrange
    let stack = stack().await;
    let supervisor = Arc::clone(stack.orchestrator.supervisor());
    let manager = Arc::clone(stack.orchestrator.manager());
    let node_id = manager.start_node("lobby").await.unwrap();

    // Act: outage, then recovery
    stack.broker.set_available(false);
    assert!(!supervisor.probe_once().await);
    assert!(!supervisor.is_connected());
    assert!(stack.broker.subscribed_channels().is_empty());

    stack.broker.set_available(true);
    assert!(!supervisor.probe_once().await);
    assert!(supervisor.is_connected());
    assert_eq!(supervisor.reconnect_count(), 2);

    // Assert: bindings restored by the resubscriber
    wait_until(|| stack.broker.subscribed_channels().len() == 3).await;

    let (_client_supervisor, agent_connection) = client(&stack.broker).await;
    HeartbeatEmitter::new(agent_connection, node_id.clone(), Duration::from_secs(1))
        .beat()
        .await
        .unwrap();
    assert_eq!(manager.get_node(&node_id).unwrap().state(), NodeState::Ready);

    stack.orchestrator.shutdown().await;
}

/// Shutdown stops and verifies every node, even ones whose container
/// ignored the stop request.
#[tokio::test]
async fn test_shutdown_leaves_no_containers() {
    // Arrange
    let stack = stack().await;
    let manager = Arc::clone(stack.orchestrator.manager());
    manager.start_node("proxy").await.unwrap();
    manager.start_node("lobby").await.unwrap();
    stack.runtime.set_ignore_stops(true);

    // Act
    let report = stack.orchestrator.shutdown().await;

    // Assert
    assert_eq!(report.stopped, 2);
    assert_eq!(report.killed, 2);
    assert_eq!(stack.runtime.running_count(), 0);
    assert_eq!(manager.node_count(), 0);
    assert_eq!(stack.orchestrator.events().stopped_count(), 2);
}
