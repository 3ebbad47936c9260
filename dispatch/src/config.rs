//! Connection and ingress configuration.
//!
//! Configuration is read from a YAML document and then overridden by a small
//! set of environment variables, so a deployment can toggle the worker routes
//! without shipping a new file.

use crate::{
    error::{Error, Result},
    jobs::{QueueName, DEFAULT_MAX_ATTEMPTS},
};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::Path, time::Duration};
use tracing::warn;

pub const ENV_REGISTER_ROUTES: &str = "REGISTER_WORKER_ROUTES";
pub const ENV_BIND: &str = "DISPATCH_BIND";
pub const ENV_REQUEST_TIMEOUT_MS: &str = "DISPATCH_REQUEST_TIMEOUT_MS";

pub const DEFAULT_CONNECTION: &str = "default";

/// Settings for one named connection. Every driver reads the fields it needs
/// and ignores the rest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Registry key of the driver, e.g. `redis` or `sqs`.
    pub driver: String,
    /// Backend-side queue, tube or table key. Defaults to the connection name.
    #[serde(default)]
    pub queue: Option<String>,
    /// DSN, redis URL, `host:port` or queue URL depending on the driver.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,
    /// Where exhausted jobs go, for backends without a native dead-letter store.
    #[serde(default)]
    pub dead_letter: Option<String>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl ConnectionConfig {
    pub fn new<S>(driver: S) -> Self
    where
        S: Into<String>,
    {
        Self {
            driver: driver.into(),
            queue: None,
            url: None,
            region: None,
            max_attempts: default_max_attempts(),
            visibility_timeout_secs: default_visibility_timeout_secs(),
            dead_letter: None,
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }

    pub fn with_url<S: Into<String>>(mut self, url: S) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_queue<S: Into<String>>(mut self, queue: S) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout_secs = timeout.as_secs();
        self
    }

    pub fn with_dead_letter<S: Into<String>>(mut self, target: S) -> Self {
        self.dead_letter = Some(target.into());
        self
    }

    pub(crate) fn or_queue(mut self, connection: &str) -> Self {
        if self.queue.is_none() {
            self.queue = Some(connection.to_string());
        }
        self
    }

    pub fn queue_name(&self) -> QueueName {
        QueueName::from(self.queue.as_deref().unwrap_or(DEFAULT_CONNECTION))
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn require_url(&self) -> Result<&str> {
        self.url
            .as_deref()
            .ok_or_else(|| Error::Config(format!("driver '{}' requires a url", self.driver)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Mount `/worker/schedule` and `/worker/queue`.
    #[serde(default = "default_register_routes")]
    pub register_routes: bool,
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_connections")]
    pub connections: HashMap<String, ConnectionConfig>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            register_routes: default_register_routes(),
            bind: default_bind(),
            request_timeout_ms: default_request_timeout_ms(),
            connections: default_connections(),
        }
    }
}

impl DispatchConfig {
    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        serde_yaml::from_str(contents).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!("cannot read {}: {}", path.as_ref().display(), e))
        })?;
        Self::from_yaml_str(&contents)
    }

    pub fn with_connection<S: Into<String>>(mut self, name: S, config: ConnectionConfig) -> Self {
        self.connections.insert(name.into(), config);
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Applies process environment overrides.
    pub fn apply_env(self) -> Self {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    pub fn apply_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_REGISTER_ROUTES) {
            match parse_bool(&value) {
                Some(register) => self.register_routes = register,
                None => warn!("ignoring {}={:?}: not a boolean", ENV_REGISTER_ROUTES, value),
            }
        }

        if let Some(bind) = lookup(ENV_BIND) {
            self.bind = bind;
        }

        if let Some(timeout) = lookup(ENV_REQUEST_TIMEOUT_MS) {
            match timeout.parse() {
                Ok(ms) => self.request_timeout_ms = ms,
                Err(_) => warn!("ignoring {}={:?}", ENV_REQUEST_TIMEOUT_MS, timeout),
            }
        }

        self
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

fn default_register_routes() -> bool {
    true
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_request_timeout_ms() -> u64 {
    5_000
}

fn default_connections() -> HashMap<String, ConnectionConfig> {
    let mut connections = HashMap::new();
    connections.insert(DEFAULT_CONNECTION.to_string(), ConnectionConfig::new("sync"));
    connections
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_visibility_timeout_secs() -> u64 {
    60
}

fn default_connect_timeout_ms() -> u64 {
    2_000
}
