//! # Query Handler
//!
//! Answers node-management requests on the `QUERY` channel.
//!
//! ## Query Flow
//!
//! ```text
//! remote client
//!       │ StartNode / StopNode / NodeInfo
//!       ▼
//! ┌─────────────────────────────────────┐
//! │  QueryReceiver (delivery path)      │
//! │  - validates against the registry   │
//! │  - reserves ids synchronously       │
//! │  - spawns container work            │
//! └─────────────────────────────────────┘
//!       │ Response (same channel, correlated)
//!       ▼
//! remote client
//! ```
//!
//! | Request     | SUCCESS message     | NOT_FOUND when       |
//! |-------------|---------------------|----------------------|
//! | `StartNode` | reserved node id    | template is unknown  |
//! | `StopNode`  | node id             | node is not active   |
//! | `NodeInfo`  | JSON `NodeSummary`  | node is not active   |

use flotilla_bus::{Packet, PacketBody, PacketReceiver, Response};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::nodes::{NodeError, NodeManager};

/// Node-management request handler.
pub struct QueryReceiver {
    manager: Arc<NodeManager>,
    handle: Handle,
}

impl QueryReceiver {
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    #[must_use]
    pub fn new(manager: Arc<NodeManager>) -> Self {
        Self {
            manager,
            handle: Handle::current(),
        }
    }

    fn start(&self, template: &str) -> Response {
        match self.manager.reserve_node(template) {
            Ok(node_id) => {
                let manager = Arc::clone(&self.manager);
                let id = node_id.clone();
                self.handle.spawn(async move {
                    if let Err(e) = manager.launch(&id).await {
                        warn!(node_id = %id, error = %e, "Requested node failed to start");
                    }
                });
                Response::success(node_id)
            }
            Err(NodeError::UnknownTemplate(name)) => {
                Response::not_found(format!("unknown template '{name}'"))
            }
            Err(e) => Response::error(e.to_string()),
        }
    }

    fn stop(&self, node_id: &str) -> Response {
        if !self.manager.contains(node_id) {
            return Response::not_found(format!("node '{node_id}' not found"));
        }
        let manager = Arc::clone(&self.manager);
        let id = node_id.to_string();
        self.handle.spawn(async move {
            if let Err(e) = manager.stop_node(&id).await {
                warn!(node_id = %id, error = %e, "Requested stop failed");
            }
        });
        Response::success(node_id)
    }

    fn info(&self, node_id: &str) -> Response {
        let Some(node) = self.manager.get_node(node_id) else {
            return Response::not_found(format!("node '{node_id}' not found"));
        };
        match serde_json::to_string(&node.summary()) {
            Ok(json) => Response::success(json),
            Err(e) => Response::error(e.to_string()),
        }
    }
}

impl PacketReceiver for QueryReceiver {
    fn receive(&self, _channel: &str, packet: &Packet) -> Option<Response> {
        let response = match packet.body() {
            PacketBody::StartNode { template } => self.start(template),
            PacketBody::StopNode { node_id } => self.stop(node_id),
            PacketBody::NodeInfo { node_id } => self.info(node_id),
            _ => return None,
        };
        debug!(
            packet_id = %packet.id(),
            variant = packet.body().variant_name(),
            response_type = ?response.response_type,
            "Answered query"
        );
        Some(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodesConfig;
    use crate::container::InMemoryContainerRuntime;
    use crate::nodes::{NodeState, NodeSummary};
    use flotilla_bus::{
        BroadcastTransport, Connection, ResponseType, TransportError, TransportProvider,
    };
    use std::time::Duration;

    struct Offline;

    impl TransportProvider for Offline {
        fn transport(&self) -> Result<Arc<dyn BroadcastTransport>, TransportError> {
            Err(TransportError::NotConnected)
        }
    }

    fn receiver() -> (QueryReceiver, Arc<NodeManager>) {
        let connection = Connection::new(Arc::new(Offline), Duration::from_secs(1));
        let manager = NodeManager::new(
            Arc::new(InMemoryContainerRuntime::new()),
            connection,
            "test",
            NodesConfig::default(),
        );
        (QueryReceiver::new(Arc::clone(&manager)), manager)
    }

    fn ask(receiver: &QueryReceiver, body: PacketBody) -> Response {
        receiver
            .receive("flotilla:query", &Packet::new(body))
            .expect("queries are always answered")
    }

    #[tokio::test]
    async fn test_start_reserves_id_immediately() {
        let (receiver, manager) = receiver();

        let response = ask(
            &receiver,
            PacketBody::StartNode {
                template: "lobby".into(),
            },
        );

        assert_eq!(response.response_type, ResponseType::Success);
        assert!(response.message.starts_with("lobby-"));
        assert!(manager.contains(&response.message));
    }

    #[tokio::test]
    async fn test_unknown_template_not_found() {
        let (receiver, _) = receiver();
        let response = ask(
            &receiver,
            PacketBody::StartNode {
                template: "survival".into(),
            },
        );
        assert_eq!(response.response_type, ResponseType::NotFound);
    }

    #[tokio::test]
    async fn test_info_returns_summary() {
        let (receiver, manager) = receiver();
        let node_id = manager.reserve_node("proxy").unwrap();

        let response = ask(
            &receiver,
            PacketBody::NodeInfo {
                node_id: node_id.clone(),
            },
        );
        assert_eq!(response.response_type, ResponseType::Success);
        let summary: NodeSummary = serde_json::from_str(&response.message).unwrap();
        assert_eq!(summary.id, node_id);
        assert_eq!(summary.state, NodeState::Starting);

        let missing = ask(
            &receiver,
            PacketBody::NodeInfo {
                node_id: "proxy-00000000".into(),
            },
        );
        assert_eq!(missing.response_type, ResponseType::NotFound);
    }

    #[tokio::test]
    async fn test_stop_unknown_node_not_found() {
        let (receiver, _) = receiver();
        let response = ask(
            &receiver,
            PacketBody::StopNode {
                node_id: "lobby-00000000".into(),
            },
        );
        assert_eq!(response.response_type, ResponseType::NotFound);
    }

    #[tokio::test]
    async fn test_ignores_other_packets() {
        let (receiver, _) = receiver();
        let packet = Packet::new(PacketBody::Heartbeat {
            application_id: "lobby-1".into(),
        });
        assert!(receiver.receive("flotilla:query", &packet).is_none());
    }
}
