//! Lifecycle event observer.

use flotilla_bus::{Packet, PacketBody, PacketReceiver, Response};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Logs and counts `NodeStarted`/`NodeStopped` events.
#[derive(Debug, Default)]
pub struct EventReceiver {
    started: AtomicU64,
    stopped: AtomicU64,
}

impl EventReceiver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn started_count(&self) -> u64 {
        self.started.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn stopped_count(&self) -> u64 {
        self.stopped.load(Ordering::Relaxed)
    }
}

impl PacketReceiver for EventReceiver {
    fn receive(&self, channel: &str, packet: &Packet) -> Option<Response> {
        match packet.body() {
            PacketBody::NodeStarted {
                node_id,
                template,
                kind,
            } => {
                self.started.fetch_add(1, Ordering::Relaxed);
                info!(channel = channel, node_id = %node_id, template = %template, kind = %kind, "Event: node started");
            }
            PacketBody::NodeStopped {
                node_id,
                template,
                kind,
            } => {
                self.stopped.fetch_add(1, Ordering::Relaxed);
                info!(channel = channel, node_id = %node_id, template = %template, kind = %kind, "Event: node stopped");
            }
            _ => {}
        }
        None
    }
}
