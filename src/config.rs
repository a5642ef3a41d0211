//! ConfSync Configuration
//!
//! This module provides configuration structures for a ConfSync node.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Role of a node in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The single writable node; owns the registry and replication pipeline
    Master,
    /// Read replica; registers with the master and receives full-snapshot syncs
    Slave,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Master => write!(f, "master"),
            Role::Slave => write!(f, "slave"),
        }
    }
}

/// Main ConfSync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfSyncConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Cluster configuration
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Notification endpoint configuration
    pub notify: NotifyConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node role (master or slave)
    pub role: Role,

    /// Address to bind the HTTP endpoint (host:port)
    pub bind_address: String,

    /// Advertised address for other nodes to connect
    #[serde(default)]
    pub advertise_address: Option<String>,

    /// Data directory for the embedded store
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Keep all state in memory (no durable store)
    #[serde(default)]
    pub ephemeral: bool,

    /// Sort tags before building config keys, so that two pushes with the
    /// same tag set but different ordering address the same entry
    #[serde(default)]
    pub canonical_tags: bool,
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Master address a slave registers against (host:port); required for slaves
    #[serde(default)]
    pub master_address: Option<String>,

    /// Health monitor tick interval in seconds
    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,

    /// Liveness probe attempts before eviction
    #[serde(default = "default_probe_retries")]
    pub probe_retries: u32,

    /// Backoff between probe attempts in seconds
    #[serde(default = "default_retry_backoff_secs")]
    pub probe_backoff_secs: u64,

    /// Sync fan-out attempts per slave
    #[serde(default = "default_sync_retries")]
    pub sync_retries: u32,

    /// Backoff between sync attempts in seconds
    #[serde(default = "default_retry_backoff_secs")]
    pub sync_backoff_secs: u64,

    /// Bounded depth of the replication event queue
    #[serde(default = "default_event_queue_depth")]
    pub event_queue_depth: usize,

    /// Timeout for outbound HTTP calls in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Notification endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Address to bind the persistent-connection endpoint.
    /// Defaults to the HTTP bind address with the port incremented by one.
    #[serde(default)]
    pub bind_address: Option<String>,

    /// Shared secret every connection must present before any other frame
    pub secret: String,

    /// Heartbeat deadline for subscribers in seconds
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value functions
fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/confsync")
}

fn default_health_interval_secs() -> u64 {
    10
}

fn default_probe_retries() -> u32 {
    3
}

fn default_retry_backoff_secs() -> u64 {
    1
}

fn default_sync_retries() -> u32 {
    3
}

fn default_event_queue_depth() -> usize {
    5
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_heartbeat_secs() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            master_address: None,
            health_interval_secs: default_health_interval_secs(),
            probe_retries: default_probe_retries(),
            probe_backoff_secs: default_retry_backoff_secs(),
            sync_retries: default_sync_retries(),
            sync_backoff_secs: default_retry_backoff_secs(),
            event_queue_depth: default_event_queue_depth(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl ConfSyncConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: ConfSyncConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        parse_host_port(&self.node.bind_address)
            .ok_or_else(|| crate::Error::Config("node.bind_address must be host:port".into()))?;

        if let Some(advertise) = &self.node.advertise_address {
            parse_host_port(advertise).ok_or_else(|| {
                crate::Error::Config("node.advertise_address must be host:port".into())
            })?;
        }

        if self.node.role == Role::Slave {
            match &self.cluster.master_address {
                Some(addr) => {
                    parse_host_port(addr).ok_or_else(|| {
                        crate::Error::Config("cluster.master_address must be host:port".into())
                    })?;
                }
                None => {
                    return Err(crate::Error::Config(
                        "cluster.master_address is required for slave nodes".into(),
                    ));
                }
            }
        }

        if self.notify.secret.is_empty() {
            return Err(crate::Error::Config("notify.secret cannot be empty".into()));
        }

        Ok(())
    }

    /// Get the advertised address (or bind address if not set)
    pub fn advertise_address(&self) -> &str {
        self.node
            .advertise_address
            .as_deref()
            .unwrap_or(&self.node.bind_address)
    }

    /// Address the notification endpoint binds to
    pub fn notify_bind_address(&self) -> crate::Result<String> {
        match &self.notify.bind_address {
            Some(addr) => Ok(addr.clone()),
            None => next_port(&self.node.bind_address),
        }
    }

    /// Get the health monitor tick interval as Duration
    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.cluster.health_interval_secs)
    }

    /// Get the probe backoff as Duration
    pub fn probe_backoff(&self) -> Duration {
        Duration::from_secs(self.cluster.probe_backoff_secs)
    }

    /// Get the sync backoff as Duration
    pub fn sync_backoff(&self) -> Duration {
        Duration::from_secs(self.cluster.sync_backoff_secs)
    }

    /// Get the outbound request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.cluster.request_timeout_secs)
    }

    /// Get the subscriber heartbeat deadline as Duration
    pub fn heartbeat_deadline(&self) -> Duration {
        Duration::from_secs(self.notify.heartbeat_secs)
    }
}

/// Split a host:port address, returning None when malformed
pub fn parse_host_port(addr: &str) -> Option<(&str, u16)> {
    let (host, port) = addr.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    Some((host, port))
}

/// Same host, port incremented by one
fn next_port(addr: &str) -> crate::Result<String> {
    let (host, port) = parse_host_port(addr)
        .ok_or_else(|| crate::Error::Config(format!("invalid address: {}", addr)))?;
    Ok(format!("{}:{}", host, port + 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_master_config() {
        let toml = r#"
[node]
role = "master"
bind_address = "0.0.0.0:9019"
data_dir = "/var/lib/confsync"

[notify]
secret = "s3cr3t"
"#;

        let config = ConfSyncConfig::from_str(toml).unwrap();
        assert_eq!(config.node.role, Role::Master);
        assert_eq!(config.cluster.health_interval_secs, 10);
        assert_eq!(config.notify_bind_address().unwrap(), "0.0.0.0:9020");
    }

    #[test]
    fn test_slave_requires_master_address() {
        let toml = r#"
[node]
role = "slave"
bind_address = "0.0.0.0:9019"

[notify]
secret = "s3cr3t"
"#;

        let err = ConfSyncConfig::from_str(toml).unwrap_err();
        assert!(matches!(err, crate::Error::Config(_)));
    }

    #[test]
    fn test_empty_secret_rejected() {
        let toml = r#"
[node]
role = "master"
bind_address = "127.0.0.1:9019"

[notify]
secret = ""
"#;

        assert!(ConfSyncConfig::from_str(toml).is_err());
    }

    #[test]
    fn test_parse_host_port() {
        assert_eq!(parse_host_port("127.0.0.1:9019"), Some(("127.0.0.1", 9019)));
        assert!(parse_host_port("no-port").is_none());
        assert!(parse_host_port("host:notaport").is_none());
    }
}
