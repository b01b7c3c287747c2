//! Heartbeat receiver.

use flotilla_bus::{Packet, PacketBody, PacketReceiver, Response};
use std::sync::Arc;
use tracing::trace;

use crate::nodes::NodeManager;

/// Forwards agent heartbeats to the node manager. Never answers.
pub struct HeartbeatReceiver {
    manager: Arc<NodeManager>,
}

impl HeartbeatReceiver {
    #[must_use]
    pub fn new(manager: Arc<NodeManager>) -> Self {
        Self { manager }
    }
}

impl PacketReceiver for HeartbeatReceiver {
    fn receive(&self, _channel: &str, packet: &Packet) -> Option<Response> {
        if let PacketBody::Heartbeat { application_id } = packet.body() {
            trace!(application_id = %application_id, "Heartbeat");
            self.manager.on_heartbeat(application_id);
        }
        None
    }
}
