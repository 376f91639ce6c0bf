//! Runtime configuration
//!
//! Loaded from YAML or TOML, then overridden by `ATTRMESH_*` environment
//! variables.

use attrmesh_core::{Error, Result, config::DEFAULT_NAMESPACE};
use attrmesh_observability::LoggingConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Attribute whose value encodes the caller's namespace
    #[serde(default = "default_identity_attribute")]
    pub identity_attribute: String,

    /// Namespace whose rules apply to every namespace
    #[serde(default = "default_namespace")]
    pub default_namespace: String,

    /// Concurrent handler invocations across all dispatch calls
    #[serde(default = "default_workers")]
    pub dispatch_workers: usize,

    /// Concurrent background work items across all handlers
    #[serde(default = "default_workers")]
    pub handler_workers: usize,

    /// Minimum time between a route change and closing superseded handlers
    #[serde(default = "default_drain_grace_period_ms")]
    pub drain_grace_period_ms: u64,

    /// How often a superseded routing table is checked for in-flight calls
    #[serde(default = "default_drain_poll_interval_ms")]
    pub drain_poll_interval_ms: u64,

    /// Keep match texts and instance names in routing tables and log them
    #[serde(default)]
    pub debug_info: bool,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            identity_attribute: default_identity_attribute(),
            default_namespace: default_namespace(),
            dispatch_workers: default_workers(),
            handler_workers: default_workers(),
            drain_grace_period_ms: default_drain_grace_period_ms(),
            drain_poll_interval_ms: default_drain_poll_interval_ms(),
            debug_info: false,
            logging: LoggingConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;

        let config = if path.extension().and_then(|s| s.to_str()) == Some("toml") {
            toml::from_str(&contents).map_err(|e| Error::Config(format!("Invalid TOML: {}", e)))?
        } else {
            // Default to YAML
            serde_yaml::from_str(&contents)
                .map_err(|e| Error::Config(format!("Invalid YAML: {}", e)))?
        };

        Ok(config)
    }

    /// Apply `ATTRMESH_*` environment overrides
    pub fn merge_env(&mut self) {
        if let Ok(val) = std::env::var("ATTRMESH_IDENTITY_ATTRIBUTE") {
            self.identity_attribute = val;
        }

        if let Ok(val) = std::env::var("ATTRMESH_DEFAULT_NAMESPACE") {
            self.default_namespace = val;
        }

        if let Ok(val) = std::env::var("ATTRMESH_DISPATCH_WORKERS") {
            match val.parse() {
                Ok(workers) => self.dispatch_workers = workers,
                Err(_) => warn!(value = %val, "Invalid ATTRMESH_DISPATCH_WORKERS, using configured value"),
            }
        }

        if let Ok(val) = std::env::var("ATTRMESH_HANDLER_WORKERS") {
            match val.parse() {
                Ok(workers) => self.handler_workers = workers,
                Err(_) => warn!(value = %val, "Invalid ATTRMESH_HANDLER_WORKERS, using configured value"),
            }
        }

        if let Ok(val) = std::env::var("ATTRMESH_DRAIN_GRACE_PERIOD_MS") {
            match val.parse() {
                Ok(ms) => self.drain_grace_period_ms = ms,
                Err(_) => warn!(value = %val, "Invalid ATTRMESH_DRAIN_GRACE_PERIOD_MS, using configured value"),
            }
        }

        if let Ok(val) = std::env::var("ATTRMESH_DEBUG_INFO")
            && let Ok(enabled) = val.parse::<bool>()
        {
            self.debug_info = enabled;
        }

        // Logging settings
        if let Ok(val) = std::env::var("ATTRMESH_LOG_LEVEL") {
            self.logging.level = val;
        }

        if let Ok(val) = std::env::var("ATTRMESH_LOG_JSON")
            && let Ok(json) = val.parse::<bool>()
        {
            self.logging.json = json;
        }
    }

    pub fn drain_grace_period(&self) -> Duration {
        Duration::from_millis(self.drain_grace_period_ms)
    }

    pub fn drain_poll_interval(&self) -> Duration {
        Duration::from_millis(self.drain_poll_interval_ms)
    }
}

fn default_identity_attribute() -> String {
    "destination.service".to_string()
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_workers() -> usize {
    1024
}

fn default_drain_grace_period_ms() -> u64 {
    1000
}

fn default_drain_poll_interval_ms() -> u64 {
    100
}
