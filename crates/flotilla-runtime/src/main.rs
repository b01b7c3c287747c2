//! # Flotilla Orchestrator
//!
//! Process entry point.
//!
//! ## Startup Sequence
//!
//! 1. Install the tracing subscriber (`RUST_LOG`, default `info`)
//! 2. Load configuration from the environment and validate it
//! 3. Start the orchestrator
//! 4. Wait for Ctrl+C, then run the shutdown sweep

use std::sync::Arc;

use anyhow::{Context, Result};
use flotilla_bus::{InMemoryBroker, InMemoryConnector};
use flotilla_runtime::{InMemoryContainerRuntime, Orchestrator, OrchestratorConfig};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .with_thread_ids(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Load configuration
    let config = OrchestratorConfig::from_env();
    config.validate().context("invalid configuration")?;

    warn!("Using the in-memory broker and container engine; nodes live only in this process");
    let broker = match &config.transport.password {
        Some(password) => InMemoryBroker::with_password(password.clone()),
        None => InMemoryBroker::new(),
    };
    let connector = Arc::new(InMemoryConnector::new(Arc::new(broker)));
    let runtime = Arc::new(InMemoryContainerRuntime::new());

    let orchestrator = Orchestrator::new(config, connector, runtime);
    orchestrator.start().await?;

    info!("Orchestrator is running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;

    // Graceful shutdown
    let report = orchestrator.shutdown().await;
    info!(
        stopped = report.stopped,
        stop_failures = report.stop_failures,
        killed = report.killed,
        "Goodbye"
    );
    Ok(())
}
