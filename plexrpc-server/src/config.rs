//! Node configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via PLEXRPC_CONFIG or --config)
//! 3. Environment variables

use crate::builtin;
use plexrpc_cluster::ExchangeConfig;
use plexrpc_core::ControllerBinding;
use plexrpc_protocol::{NodeAddress, DEFAULT_PORT};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node: NodeConfig,
    pub network: NetworkConfig,
    pub http: HttpConfig,
    pub cluster: ClusterConfig,
    pub queue: QueueConfig,
    pub metrics: MetricsConfig,
    pub errors: ErrorsConfig,
    /// Controller exposures; the built-in `Echo` bindings when omitted.
    pub controllers: Vec<ControllerBinding>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            network: NetworkConfig::default(),
            http: HttpConfig::default(),
            cluster: ClusterConfig::default(),
            queue: QueueConfig::default(),
            metrics: MetricsConfig::default(),
            errors: ErrorsConfig::default(),
            controllers: builtin::default_bindings(),
        }
    }
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("PLEXRPC_CONFIG") {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Applies `PLEXRPC_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Applies overrides from any key lookup.
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        self.node.apply_overrides(&var);
        self.network.apply_overrides(&var);
        self.http.apply_overrides(&var);
        self.cluster.apply_overrides(&var);
        self.metrics.apply_overrides(&var);

        if let Some(mask) = var("PLEXRPC_MASK_HANDLER_ERRORS") {
            self.errors.mask_handler_errors = is_truthy(&mask);
        }
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::Io(path.to_path_buf(), e))
    }

    /// Checks settings that cannot be expressed in the types.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network.max_connections == 0 {
            return Err(ConfigError::Validation(
                "network.max_connections must be positive".to_string(),
            ));
        }

        let mut listeners = vec![("network", self.network.bind_addr)];
        if self.http.enabled {
            listeners.push(("http", self.http.bind_addr));
        }
        if self.metrics.enabled {
            listeners.push(("metrics", self.metrics.bind_addr));
        }
        for (i, (name, addr)) in listeners.iter().enumerate() {
            if addr.port() == 0 {
                continue;
            }
            if let Some((other, _)) = listeners[..i].iter().find(|(_, a)| a == addr) {
                return Err(ConfigError::Validation(format!(
                    "{} and {} both bind {}",
                    other, name, addr
                )));
            }
        }

        if self.cluster.enabled {
            for seed in &self.cluster.seeds {
                if seed.socket_addr().is_none() {
                    return Err(ConfigError::Validation(format!(
                        "cluster seed '{}' is not a socket address",
                        seed
                    )));
                }
            }
            if self.cluster.probe_interval_ms == 0 {
                return Err(ConfigError::Validation(
                    "cluster.probe_interval_ms must be positive".to_string(),
                ));
            }
        }

        for binding in &self.controllers {
            if binding.transports.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "controller {}.{} lists no transports",
                    binding.service, binding.method
                )));
            }
        }
        Ok(())
    }
}

/// Identity of this node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Server name reported by HELLO.
    pub name: Option<String>,
    /// Address peers reach this node at. Defaults to the socket listener's
    /// bound address.
    pub address: Option<NodeAddress>,
}

impl NodeConfig {
    fn apply_overrides(&mut self, var: &impl Fn(&str) -> Option<String>) {
        if let Some(name) = var("PLEXRPC_NODE_NAME") {
            self.name = Some(name);
        }
        if let Some(addr) = var("PLEXRPC_NODE_ADDRESS") {
            self.address = Some(NodeAddress::new(addr));
        }
    }
}

/// How the socket listener serves requests on one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SocketMode {
    /// One request at a time, answered in order.
    #[default]
    Sync,
    /// Requests run concurrently, answered as they complete.
    Async,
}

/// Socket listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    pub mode: SocketMode,
    /// Idle connection timeout in seconds.
    pub idle_timeout_secs: u64,
    /// Maximum concurrent connections.
    pub max_connections: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            mode: SocketMode::default(),
            idle_timeout_secs: 300,
            max_connections: 1000,
        }
    }
}

impl NetworkConfig {
    fn apply_overrides(&mut self, var: &impl Fn(&str) -> Option<String>) {
        if let Some(addr) = var("PLEXRPC_BIND").and_then(|a| a.parse().ok()) {
            self.bind_addr = addr;
        }
        if let Some(mode) = var("PLEXRPC_SOCKET_MODE") {
            match mode.to_lowercase().as_str() {
                "sync" => self.mode = SocketMode::Sync,
                "async" => self.mode = SocketMode::Async,
                other => tracing::warn!("Ignoring unknown PLEXRPC_SOCKET_MODE '{}'", other),
            }
        }
        if let Some(secs) = var("PLEXRPC_IDLE_TIMEOUT").and_then(|s| s.parse().ok()) {
            self.idle_timeout_secs = secs;
        }
        if let Some(n) = var("PLEXRPC_MAX_CONNECTIONS").and_then(|s| s.parse().ok()) {
            self.max_connections = n;
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub enabled: bool,
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 7480)),
        }
    }
}

impl HttpConfig {
    fn apply_overrides(&mut self, var: &impl Fn(&str) -> Option<String>) {
        if let Some(enabled) = var("PLEXRPC_HTTP_ENABLED") {
            self.enabled = is_truthy(&enabled);
        }
        if let Some(addr) = var("PLEXRPC_HTTP_BIND").and_then(|a| a.parse().ok()) {
            self.bind_addr = addr;
        }
    }
}

/// Cluster membership configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub enabled: bool,
    /// Socket addresses of the other nodes.
    pub seeds: Vec<NodeAddress>,
    /// How often seeds are probed for liveness.
    pub probe_interval_ms: u64,
    #[serde(flatten)]
    pub exchange: ExchangeConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            seeds: Vec::new(),
            probe_interval_ms: 2000,
            exchange: ExchangeConfig::default(),
        }
    }
}

impl ClusterConfig {
    fn apply_overrides(&mut self, var: &impl Fn(&str) -> Option<String>) {
        if let Some(enabled) = var("PLEXRPC_CLUSTER_ENABLED") {
            self.enabled = is_truthy(&enabled);
        }
        if let Some(seeds) = var("PLEXRPC_CLUSTER_SEEDS") {
            self.seeds = seeds
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(NodeAddress::new)
                .collect();
        }
        if let Some(secs) = var("PLEXRPC_CLUSTER_REFRESH").and_then(|s| s.parse().ok()) {
            self.exchange.refresh_interval = Duration::from_secs(secs);
        }
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }
}

/// In-process queue listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Queue name prefix; a service is consumed from `<prefix><service>`.
    pub prefix: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            prefix: "rpc.".to_string(),
        }
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable metrics HTTP server.
    pub enabled: bool,
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 9090)),
        }
    }
}

impl MetricsConfig {
    fn apply_overrides(&mut self, var: &impl Fn(&str) -> Option<String>) {
        if let Some(enabled) = var("PLEXRPC_METRICS_ENABLED") {
            self.enabled = is_truthy(&enabled);
        }
        if let Some(addr) = var("PLEXRPC_METRICS_BIND").and_then(|a| a.parse().ok()) {
            self.bind_addr = addr;
        }
    }
}

/// Error reporting configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorsConfig {
    /// Replace handler failure messages with a generic one on the wire.
    pub mask_handler_errors: bool,
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {1}", .0.display())]
    Io(PathBuf, std::io::Error),

    #[error("failed to parse config file '{}': {1}", .0.display())]
    Parse(PathBuf, String),

    #[error("configuration validation failed: {0}")]
    Validation(String),
}

fn is_truthy(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

/// Custom serde module for SocketAddr (to handle as string in YAML).
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(addr)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        String::deserialize(deserializer)?
            .parse()
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plexrpc_core::TransportKind;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.bind_addr.port(), DEFAULT_PORT);
        assert_eq!(config.network.mode, SocketMode::Sync);
        assert!(!config.cluster.enabled);
        assert_eq!(config.cluster.exchange.refresh_interval, Duration::ZERO);
        assert!(!config.controllers.is_empty());
        config.validate().unwrap();
    }

    #[test]
    fn test_yaml_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("plexrpc.yaml");
        std::fs::write(
            &path,
            r#"
network:
  bind_addr: "0.0.0.0:7500"
  mode: async
http:
  enabled: true
cluster:
  enabled: true
  seeds: ["10.0.0.2:7411", "10.0.0.3:7411"]
  refresh_interval: 30
errors:
  mask_handler_errors: true
controllers:
  - service: Echo
    method: ping
    transports: [async_socket, cluster]
"#,
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.network.bind_addr.port(), 7500);
        assert_eq!(config.network.mode, SocketMode::Async);
        assert_eq!(config.network.max_connections, 1000);
        assert!(config.http.enabled);
        assert_eq!(config.cluster.seeds.len(), 2);
        assert_eq!(
            config.cluster.exchange.refresh_interval,
            Duration::from_secs(30)
        );
        assert!(config.errors.mask_handler_errors);
        assert_eq!(
            config.controllers[0].transports,
            vec![TransportKind::AsyncSocket, TransportKind::Cluster]
        );
        config.validate().unwrap();
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("saved.yaml");

        let mut config = Config::default();
        config.node.address = Some(NodeAddress::from("10.1.1.1:7411"));
        config.save(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.network.bind_addr, config.network.bind_addr);
        assert_eq!(loaded.node.address, config.node.address);
        assert_eq!(loaded.controllers, config.controllers);
    }

    #[test]
    fn test_missing_file() {
        let err = Config::from_file("/nonexistent/plexrpc.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(..)));
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("PLEXRPC_BIND", "0.0.0.0:8000"),
            ("PLEXRPC_SOCKET_MODE", "ASYNC"),
            ("PLEXRPC_CLUSTER_ENABLED", "1"),
            ("PLEXRPC_CLUSTER_SEEDS", "10.0.0.2:7411, 10.0.0.3:7411,"),
            ("PLEXRPC_MASK_HANDLER_ERRORS", "true"),
            ("PLEXRPC_METRICS_BIND", "not an address"),
        ]);
        let mut config = Config::default();
        config.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.network.bind_addr.port(), 8000);
        assert_eq!(config.network.mode, SocketMode::Async);
        assert!(config.cluster.enabled);
        assert_eq!(
            config.cluster.seeds,
            vec![NodeAddress::from("10.0.0.2:7411"), NodeAddress::from("10.0.0.3:7411")]
        );
        assert!(config.errors.mask_handler_errors);
        // Unparseable values keep the default
        assert_eq!(config.metrics.bind_addr.port(), 9090);
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.http.enabled = true;
        config.http.bind_addr = config.network.bind_addr;
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));

        let mut config = Config::default();
        config.cluster.enabled = true;
        config.cluster.seeds = vec![NodeAddress::from("node-b")];
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.controllers[0].transports.clear();
        assert!(config.validate().is_err());
    }
}
