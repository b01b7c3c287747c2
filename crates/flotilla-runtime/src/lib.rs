//! # Flotilla Runtime - Node Lifecycle Orchestration
//!
//! Starts, supervises and stops containerized proxy and game-server nodes,
//! coordinated over the flotilla bus.
//!
//! ## Architecture
//!
//! ```text
//!   QUERY ──────→ QueryReceiver ─────┐
//!   HEARTBEAT ──→ HeartbeatReceiver ─┼──→ NodeManager ──→ ContainerRuntime
//!   EVENT ←───────────────────────────┘        │
//!     │                                        └── health monitor (poll)
//!     └──→ EventReceiver (observe)
//! ```
//!
//! ## Modules
//!
//! - `config` - Typed configuration with environment overrides
//! - `container` - Container runtime port and in-memory engine
//! - `nodes` - Node model, readiness state machine and lifecycle manager
//! - `handlers` - Packet receivers bound to the well-known channels
//! - `agent` - Heartbeat emitter run inside node containers
//! - `orchestrator` - Startup and shutdown wiring

// Nursery lints that are too strict
#![allow(clippy::missing_const_for_fn)]
// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod agent;
pub mod config;
pub mod container;
pub mod handlers;
pub mod nodes;
pub mod orchestrator;

pub use agent::{HeartbeatEmitter, DEFAULT_HEARTBEAT_INTERVAL};
pub use config::{ConfigError, NodeTemplate, NodesConfig, OrchestratorConfig};
pub use container::{
    ContainerHandle, ContainerInspection, ContainerRuntime, ContainerSpec,
    InMemoryContainerRuntime, RuntimeError,
};
pub use handlers::{EventReceiver, HeartbeatReceiver, QueryReceiver};
pub use nodes::{
    DeferredVerification, Node, NodeError, NodeManager, NodeState, NodeSummary, ShutdownReport,
    NODE_ID_ENV,
};
pub use orchestrator::Orchestrator;
