//! # Packet Receivers
//!
//! One receiver per application concern, each bound to its channel by the
//! orchestrator:
//!
//! - [`QueryReceiver`] on `QUERY`: start/stop/info requests, answered.
//! - [`HeartbeatReceiver`] on `HEARTBEAT`: readiness announcements.
//! - [`EventReceiver`] on `EVENT`: lifecycle notifications, observed only.

pub mod events;
pub mod heartbeat;
pub mod query;

pub use events::EventReceiver;
pub use heartbeat::HeartbeatReceiver;
pub use query::QueryReceiver;
