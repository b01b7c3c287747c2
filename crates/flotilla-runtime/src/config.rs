//! # Orchestrator Configuration
//!
//! Typed configuration with built-in defaults, overridden from environment
//! variables at startup.
//!
//! | Variable                        | Field                          | Default     |
//! |---------------------------------|--------------------------------|-------------|
//! | `FLOTILLA_STACK`                | `stack_name`                   | `flotilla`  |
//! | `FLOTILLA_TRANSPORT_HOST`       | `transport.host`               | `localhost` |
//! | `FLOTILLA_TRANSPORT_PORT`       | `transport.port`               | `6379`      |
//! | `FLOTILLA_TRANSPORT_PASSWORD`   | `transport.password`           | none        |
//! | `FLOTILLA_PROBE_INTERVAL_SECS`  | `transport.probe_interval`     | `10`        |
//! | `FLOTILLA_REQUEST_TIMEOUT_MS`   | `request_timeout`              | `5000`      |
//! | `FLOTILLA_GRACE_PERIOD_SECS`    | `nodes.grace_period`           | `60`        |
//! | `FLOTILLA_HEALTH_INTERVAL_SECS` | `nodes.health_interval`        | `5`         |
//! | `FLOTILLA_ADVERTISED_HOST`      | `nodes.advertised_host`        | `127.0.0.1` |
//! | `FLOTILLA_AUTOSTART`            | `nodes.autostart` (comma list) | empty       |
//!
//! Values that fail to parse are logged and ignored.

use flotilla_bus::{NodeKind, TransportConfig, DEFAULT_REQUEST_TIMEOUT};
use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Complete orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Prefix for container hostnames.
    pub stack_name: String,
    /// Broadcast transport connection.
    pub transport: TransportConfig,
    /// Default wait for request responses.
    pub request_timeout: Duration,
    /// Node lifecycle settings.
    pub nodes: NodesConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            stack_name: "flotilla".to_string(),
            transport: TransportConfig::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            nodes: NodesConfig::default(),
        }
    }
}

/// Node lifecycle configuration.
#[derive(Debug, Clone)]
pub struct NodesConfig {
    /// Delay before verifying that a stopped container really exited.
    pub grace_period: Duration,
    /// Interval between passive health polls.
    pub health_interval: Duration,
    /// Host reported as the address of every node.
    pub advertised_host: String,
    /// Templates nodes can be started from.
    pub templates: Vec<NodeTemplate>,
    /// Templates started once at boot.
    pub autostart: Vec<String>,
}

impl Default for NodesConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(60),
            health_interval: Duration::from_secs(5),
            advertised_host: "127.0.0.1".to_string(),
            templates: vec![NodeTemplate::default_proxy(), NodeTemplate::default_lobby()],
            autostart: Vec::new(),
        }
    }
}

/// Blueprint for a node's container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeTemplate {
    pub name: String,
    pub kind: NodeKind,
    pub image: String,
    pub env: BTreeMap<String, String>,
    /// Container port published to a host port.
    pub exposed_port: u16,
}

impl NodeTemplate {
    /// The network proxy template.
    #[must_use]
    pub fn default_proxy() -> Self {
        Self {
            name: "proxy".to_string(),
            kind: NodeKind::Proxy,
            image: "itzg/bungeecord".to_string(),
            env: BTreeMap::from([("TYPE".to_string(), "BUNGEECORD".to_string())]),
            exposed_port: 25577,
        }
    }

    /// The lobby game-server template.
    #[must_use]
    pub fn default_lobby() -> Self {
        Self {
            name: "lobby".to_string(),
            kind: NodeKind::Server,
            image: "itzg/minecraft-server".to_string(),
            env: BTreeMap::from([
                ("EULA".to_string(), "TRUE".to_string()),
                ("TYPE".to_string(), "PAPER".to_string()),
            ]),
            exposed_port: 25565,
        }
    }
}

/// Configuration errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("stack name must not be empty")]
    EmptyStackName,

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("template '{0}' is defined more than once")]
    DuplicateTemplate(String),

    #[error("template '{name}' is invalid: {reason}")]
    InvalidTemplate { name: String, reason: String },

    #[error("autostart names unknown template '{0}'")]
    UnknownAutostart(String),
}

impl OrchestratorConfig {
    /// Defaults overridden from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().apply_env(|key| std::env::var(key).ok())
    }

    /// Apply overrides read through `lookup`.
    #[must_use]
    pub fn apply_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(stack) = lookup("FLOTILLA_STACK") {
            self.stack_name = stack;
        }
        if let Some(host) = lookup("FLOTILLA_TRANSPORT_HOST") {
            self.transport.host = host;
        }
        if let Some(port) = parse_var(&lookup, "FLOTILLA_TRANSPORT_PORT") {
            self.transport.port = port;
        }
        if let Some(password) = lookup("FLOTILLA_TRANSPORT_PASSWORD") {
            self.transport.password = if password.is_empty() {
                None
            } else {
                Some(password)
            };
        }
        if let Some(secs) = parse_var(&lookup, "FLOTILLA_PROBE_INTERVAL_SECS") {
            self.transport.probe_interval = Duration::from_secs(secs);
        }
        if let Some(ms) = parse_var(&lookup, "FLOTILLA_REQUEST_TIMEOUT_MS") {
            self.request_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_var(&lookup, "FLOTILLA_GRACE_PERIOD_SECS") {
            self.nodes.grace_period = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var(&lookup, "FLOTILLA_HEALTH_INTERVAL_SECS") {
            self.nodes.health_interval = Duration::from_secs(secs);
        }
        if let Some(host) = lookup("FLOTILLA_ADVERTISED_HOST") {
            self.nodes.advertised_host = host;
        }
        if let Some(list) = lookup("FLOTILLA_AUTOSTART") {
            self.nodes.autostart = list
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect();
        }
        self
    }

    /// Check internal consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stack_name.trim().is_empty() {
            return Err(ConfigError::EmptyStackName);
        }
        if self.transport.probe_interval.is_zero() {
            return Err(ConfigError::ZeroDuration("probe interval"));
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("request timeout"));
        }
        if self.nodes.health_interval.is_zero() {
            return Err(ConfigError::ZeroDuration("health interval"));
        }

        let mut names = HashSet::new();
        for template in &self.nodes.templates {
            if template.name.is_empty() || template.name.contains(char::is_whitespace) {
                return Err(ConfigError::InvalidTemplate {
                    name: template.name.clone(),
                    reason: "name must be non-empty without whitespace".to_string(),
                });
            }
            if template.image.is_empty() {
                return Err(ConfigError::InvalidTemplate {
                    name: template.name.clone(),
                    reason: "image must be set".to_string(),
                });
            }
            if !names.insert(template.name.as_str()) {
                return Err(ConfigError::DuplicateTemplate(template.name.clone()));
            }
        }
        for name in &self.nodes.autostart {
            if !names.contains(name.as_str()) {
                return Err(ConfigError::UnknownAutostart(name.clone()));
            }
        }
        Ok(())
    }

    /// Look up a template by name.
    #[must_use]
    pub fn template(&self, name: &str) -> Option<&NodeTemplate> {
        self.nodes.templates.iter().find(|t| t.name == name)
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(variable = key, value = %raw, "Ignoring unparsable environment value");
            None
        }
    }
}
