//! Broker configuration
//!
//! Loaded once at startup from a YAML file. Everything here is static for
//! the lifetime of the process: backends, port range, polling budgets.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default HTTP port of the broker API
pub const DEFAULT_BROKER_PORT: u16 = 8889;

/// Default public port range handed out by the router
pub const DEFAULT_PORT_RANGE: (u16, u16) = (30000, 30999);

/// Default config file location: ~/.pgbroker/config.yml
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".pgbroker")
        .join("config.yml")
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Invalid path {0}: {1}")]
    InvalidPath(String, String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Complete broker configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub broker: ApiConfig,

    /// Shared store; the in-process memory store is used when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kv_store: Option<KvStoreConfig>,

    #[serde(default)]
    pub routing: RoutingConfig,

    #[serde(default)]
    pub status: StatusConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub tasks: TaskConfig,

    pub backends: Vec<BackendConfig>,

    /// Backup callbacks; recreation data is kept in memory when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callbacks: Option<CallbacksConfig>,
}

/// HTTP adapter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_broker_port")]
    pub port: u16,

    /// Host written into binding credentials (the routing tier's address)
    #[serde(default = "default_bind_host")]
    pub bind_host: String,

    /// Bearer key required on every request when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            port: DEFAULT_BROKER_PORT,
            bind_host: default_bind_host(),
            api_key: None,
        }
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_broker_port() -> u16 {
    DEFAULT_BROKER_PORT
}

fn default_bind_host() -> String {
    "127.0.0.1".to_string()
}

/// etcd connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvStoreConfig {
    /// e.g. `http://10.0.0.5:2379`
    pub endpoint: String,

    /// Key prefix all broker keys live under
    #[serde(default)]
    pub prefix: String,

    #[serde(default = "default_kv_timeout_ms")]
    pub timeout_ms: u64,
}

impl KvStoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_kv_timeout_ms() -> u64 {
    5_000
}

/// Public port allocation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(default = "default_port_min")]
    pub port_min: u16,

    #[serde(default = "default_port_max")]
    pub port_max: u16,

    /// Polls of the allocation key before giving up (reference: 10)
    #[serde(default = "default_wait_attempts")]
    pub wait_attempts: u32,

    /// Delay between polls (reference: 1s)
    #[serde(default = "default_poll_interval_ms")]
    pub wait_interval_ms: u64,
}

impl RoutingConfig {
    pub fn wait_interval(&self) -> Duration {
        Duration::from_millis(self.wait_interval_ms)
    }

    pub fn capacity(&self) -> usize {
        if self.port_max < self.port_min {
            0
        } else {
            (self.port_max - self.port_min) as usize + 1
        }
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            port_min: DEFAULT_PORT_RANGE.0,
            port_max: DEFAULT_PORT_RANGE.1,
            wait_attempts: default_wait_attempts(),
            wait_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_port_min() -> u16 {
    DEFAULT_PORT_RANGE.0
}

fn default_port_max() -> u16 {
    DEFAULT_PORT_RANGE.1
}

fn default_wait_attempts() -> u32 {
    10
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

/// Member health polling settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Budget for all members to reach "running" (reference: 120s)
    #[serde(default = "default_wait_timeout_ms")]
    pub wait_timeout_ms: u64,
}

impl StatusConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            wait_timeout_ms: default_wait_timeout_ms(),
        }
    }
}

fn default_wait_timeout_ms() -> u64 {
    120_000
}

/// How the scheduler chooses nodes to remove when shrinking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RemovalPolicyKind {
    /// Random replica, primary only when nothing else is left
    #[default]
    PrimaryAvoiding,
    /// Any node at random, primary included
    Random,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub removal_policy: RemovalPolicyKind,

    /// Largest node count a request may ask for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_node_count: Option<i64>,
}

/// Background worker pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
        }
    }
}

fn default_max_concurrent() -> usize {
    8
}

/// A provisioning target
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendConfig {
    pub guid: String,
    pub uri: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    pub availability_zone: String,
}

/// External backup commands
///
/// Both get the instance id as their last argument. `backup_cmd` receives
/// the recreation data as JSON on stdin; `restore_cmd` prints it as JSON on
/// stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbacksConfig {
    pub backup_cmd: Vec<String>,
    pub restore_cmd: Vec<String>,
}

// ============================================================================
// SBIO: Pure functions (no I/O)
// ============================================================================

impl BrokerConfig {
    /// Minimal configuration with the given backends and defaults elsewhere
    pub fn with_backends(backends: Vec<BackendConfig>) -> Self {
        Self {
            broker: ApiConfig::default(),
            kv_store: None,
            routing: RoutingConfig::default(),
            status: StatusConfig::default(),
            scheduler: SchedulerConfig::default(),
            tasks: TaskConfig::default(),
            backends,
            callbacks: None,
        }
    }

    /// Parse configuration from YAML
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: BrokerConfig =
            serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants the rest of the broker relies on
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backends.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one backend must be configured".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for backend in &self.backends {
            if backend.guid.is_empty() {
                return Err(ConfigError::Invalid("backend guid cannot be empty".to_string()));
            }
            if !seen.insert(backend.guid.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate backend guid '{}'",
                    backend.guid
                )));
            }
            if backend.availability_zone.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "backend '{}' has no availability_zone",
                    backend.guid
                )));
            }
        }

        if self.routing.capacity() == 0 {
            return Err(ConfigError::Invalid(format!(
                "routing port range {}-{} is empty",
                self.routing.port_min, self.routing.port_max
            )));
        }

        if let Some(max) = self.scheduler.max_node_count {
            if max < 1 {
                return Err(ConfigError::Invalid(
                    "scheduler.max_node_count must be at least 1".to_string(),
                ));
            }
        }

        if let Some(callbacks) = &self.callbacks {
            if callbacks.backup_cmd.is_empty() || callbacks.restore_cmd.is_empty() {
                return Err(ConfigError::Invalid(
                    "callbacks need both backup_cmd and restore_cmd".to_string(),
                ));
            }
        }

        if self.tasks.max_concurrent == 0 {
            return Err(ConfigError::Invalid(
                "tasks.max_concurrent must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

// ============================================================================
// SBIO: I/O wrapper - thin layer over pure functions
// ============================================================================

/// Load and validate a config file. `~` and `$VAR` in the path are expanded.
pub fn load_config_file(path: &Path) -> Result<BrokerConfig, ConfigError> {
    let raw = path.to_string_lossy();
    let expanded = shellexpand::full(&raw)
        .map_err(|e| ConfigError::InvalidPath(raw.to_string(), e.to_string()))?;
    let content = std::fs::read_to_string(expanded.as_ref())?;
    BrokerConfig::from_yaml(&content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = r#"
broker:
  port: 9000
  bind_host: pg.example.com
kv_store:
  endpoint: http://127.0.0.1:2379
  prefix: broker
routing:
  port_min: 31000
  port_max: 31009
scheduler:
  removal_policy: random
backends:
  - guid: cell-a
    uri: http://10.0.0.1:8888
    availability_zone: z1
  - guid: cell-b
    uri: http://10.0.0.2:8888
    availability_zone: z2
"#;

    fn backend(guid: &str, az: &str) -> BackendConfig {
        BackendConfig {
            guid: guid.to_string(),
            uri: format!("http://{}", guid),
            username: String::new(),
            password: String::new(),
            availability_zone: az.to_string(),
        }
    }

    fn create_temp_file(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_parse_sample_config() {
        let config = BrokerConfig::from_yaml(SAMPLE).unwrap();

        assert_eq!(config.broker.port, 9000);
        assert_eq!(config.broker.bind_host, "pg.example.com");
        assert_eq!(config.kv_store.as_ref().unwrap().prefix, "broker");
        assert_eq!(config.routing.capacity(), 10);
        assert_eq!(config.routing.wait_attempts, 10);
        assert_eq!(config.status.wait_timeout(), Duration::from_secs(120));
        assert_eq!(config.scheduler.removal_policy, RemovalPolicyKind::Random);
        assert_eq!(config.backends.len(), 2);
    }

    #[test]
    fn test_defaults_applied() {
        let config = BrokerConfig::with_backends(vec![backend("cell-a", "z1")]);
        assert!(config.validate().is_ok());
        assert_eq!(config.broker.port, DEFAULT_BROKER_PORT);
        assert_eq!(config.status.poll_interval(), Duration::from_secs(1));
        assert_eq!(
            config.scheduler.removal_policy,
            RemovalPolicyKind::PrimaryAvoiding
        );
    }

    #[test]
    fn test_rejects_duplicate_backends() {
        let config =
            BrokerConfig::with_backends(vec![backend("cell-a", "z1"), backend("cell-a", "z2")]);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_empty_backends_and_bad_range() {
        let config = BrokerConfig::with_backends(vec![]);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = BrokerConfig::with_backends(vec![backend("cell-a", "z1")]);
        config.routing.port_min = 10;
        config.routing.port_max = 9;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_load_config_file() {
        let file = create_temp_file(SAMPLE);
        let config = load_config_file(file.path()).unwrap();
        assert_eq!(config.backends[1].availability_zone, "z2");
    }

    #[test]
    fn test_load_nonexistent_file() {
        let result = load_config_file(Path::new("/nonexistent/config.yml"));
        assert!(matches!(result, Err(ConfigError::IoError(_))));
    }
}
