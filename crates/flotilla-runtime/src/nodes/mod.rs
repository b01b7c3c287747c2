//! Node registry and lifecycle.

pub mod manager;
pub mod node;

pub use manager::{DeferredVerification, NodeError, NodeManager, ShutdownReport, NODE_ID_ENV};
pub use node::{Node, NodeState, NodeSummary};
