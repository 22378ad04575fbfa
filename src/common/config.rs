//! Configuration for telestar components
//!
//! Values are layered: built-in defaults, then an optional `telestar.toml`
//! (path overridable with `TELESTAR_CONFIG`), then `TELESTAR__*` environment
//! variables. The binaries apply CLI flags last.

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_CONFIG_FILE: &str = "telestar.toml";

/// Global configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server replica config
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<NodeConfig>,

    /// Sensor client config
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensor: Option<SensorConfig>,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load layered configuration. A missing file is not an error.
    pub fn load() -> Result<Self> {
        let path =
            std::env::var("TELESTAR_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        let settings = config::Config::builder()
            .set_default("log_level", default_log_level())?
            .add_source(config::File::with_name(&path).required(false))
            .add_source(config::Environment::with_prefix("TELESTAR").separator("__"))
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}

/// Configuration-assigned starting role of a replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Primary,
    Backup,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Primary => write!(f, "primary"),
            NodeRole::Backup => write!(f, "backup"),
        }
    }
}

/// Server replica configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub role: NodeRole,

    /// TCP address sensors connect to
    pub client_addr: SocketAddr,

    /// Local UDP address heartbeats are published from and received on
    pub heartbeat_addr: SocketAddr,

    /// The peer's heartbeat address
    pub peer_heartbeat_addr: SocketAddr,

    /// Directory holding the replica artifacts
    pub data_dir: PathBuf,

    /// Peer storage directory artifacts are mirrored into (None = shared storage)
    #[serde(default)]
    pub replica_mirror_dir: Option<PathBuf>,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// Rolling window width for averages
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Bounded queue between connection tasks and the event loop
    #[serde(default = "default_inbox_capacity")]
    pub inbox_capacity: usize,

    /// JSON-lines journal of role transitions
    #[serde(default)]
    pub audit_log: Option<PathBuf>,
}

fn default_heartbeat_interval() -> u64 {
    1000
}
fn default_window_secs() -> u64 {
    5
}
fn default_inbox_capacity() -> usize {
    1024
}

impl NodeConfig {
    /// Defaults for a role, using the classic two-node port plan.
    pub fn for_role(role: NodeRole) -> Self {
        let (client, local_hb, peer_hb) = match role {
            NodeRole::Primary => (5001, 5003, 5004),
            NodeRole::Backup => (5002, 5004, 5003),
        };
        Self {
            role,
            client_addr: SocketAddr::from(([0, 0, 0, 0], client)),
            heartbeat_addr: SocketAddr::from(([0, 0, 0, 0], local_hb)),
            peer_heartbeat_addr: SocketAddr::from(([127, 0, 0, 1], peer_hb)),
            data_dir: PathBuf::from(format!("./{}-data", role)),
            replica_mirror_dir: None,
            heartbeat_interval_ms: default_heartbeat_interval(),
            window_secs: default_window_secs(),
            inbox_capacity: default_inbox_capacity(),
            audit_log: None,
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval_ms == 0 {
            return Err(Error::InvalidConfig("heartbeat_interval_ms must be > 0".into()));
        }
        if self.window_secs == 0 {
            return Err(Error::InvalidConfig("window_secs must be > 0".into()));
        }
        if self.inbox_capacity == 0 {
            return Err(Error::InvalidConfig("inbox_capacity must be > 0".into()));
        }
        if self.heartbeat_addr == self.peer_heartbeat_addr {
            return Err(Error::InvalidConfig(
                "heartbeat_addr and peer_heartbeat_addr must differ".into(),
            ));
        }
        Ok(())
    }
}

/// Sensor client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    pub sensor_id: u32,

    /// The two server replicas, tried round-robin
    pub endpoints: Vec<String>,

    #[serde(default = "default_reply_timeout")]
    pub reply_timeout_ms: u64,

    /// Pause between network cycles
    #[serde(default = "default_idle_delay")]
    pub idle_delay_ms: u64,

    #[serde(default = "default_reading_interval")]
    pub reading_interval_ms: u64,

    /// Consecutive reply-less cycles tolerated before switching endpoint
    #[serde(default = "default_silent_cycles")]
    pub silent_cycles_before_failover: u32,

    /// Bounded queue between the reading generator and the network loop
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_reply_timeout() -> u64 {
    1000
}
fn default_idle_delay() -> u64 {
    250
}
fn default_reading_interval() -> u64 {
    1000
}
fn default_silent_cycles() -> u32 {
    1
}
fn default_channel_capacity() -> usize {
    64
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            sensor_id: 1,
            endpoints: vec!["127.0.0.1:5001".to_string(), "127.0.0.1:5002".to_string()],
            reply_timeout_ms: default_reply_timeout(),
            idle_delay_ms: default_idle_delay(),
            reading_interval_ms: default_reading_interval(),
            silent_cycles_before_failover: default_silent_cycles(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl SensorConfig {
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    pub fn idle_delay(&self) -> Duration {
        Duration::from_millis(self.idle_delay_ms)
    }

    pub fn reading_interval(&self) -> Duration {
        Duration::from_millis(self.reading_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.endpoints.len() != 2 {
            return Err(Error::InvalidConfig(format!(
                "exactly two endpoints required, got {}",
                self.endpoints.len()
            )));
        }
        if self.reply_timeout_ms == 0 || self.reading_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "reply_timeout_ms and reading_interval_ms must be > 0".into(),
            ));
        }
        if self.silent_cycles_before_failover == 0 {
            return Err(Error::InvalidConfig(
                "silent_cycles_before_failover must be > 0".into(),
            ));
        }
        if self.channel_capacity == 0 {
            return Err(Error::InvalidConfig("channel_capacity must be > 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_port_plan_mirrors() {
        let primary = NodeConfig::for_role(NodeRole::Primary);
        let backup = NodeConfig::for_role(NodeRole::Backup);
        assert_eq!(primary.client_addr.port(), 5001);
        assert_eq!(backup.client_addr.port(), 5002);
        assert_eq!(
            primary.heartbeat_addr.port(),
            backup.peer_heartbeat_addr.port()
        );
        assert_eq!(
            backup.heartbeat_addr.port(),
            primary.peer_heartbeat_addr.port()
        );
        assert!(primary.validate().is_ok());
        assert!(backup.validate().is_ok());
    }

    #[test]
    fn test_sensor_requires_two_endpoints() {
        let mut cfg = SensorConfig::default();
        assert!(cfg.validate().is_ok());
        cfg.endpoints.pop();
        assert!(matches!(cfg.validate(), Err(Error::InvalidConfig(_))));
        cfg.endpoints = vec!["a:1".into(), "b:2".into(), "c:3".into()];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_node_rejects_zero_interval() {
        let mut cfg = NodeConfig::for_role(NodeRole::Primary);
        cfg.heartbeat_interval_ms = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let raw = r#"
            log_level = "debug"

            [sensor]
            sensor_id = 9
            endpoints = ["10.0.0.1:5001", "10.0.0.2:5002"]
            idle_delay_ms = 100
        "#;
        let cfg: Config = config::Config::builder()
            .add_source(config::File::from_str(raw, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(cfg.log_level, "debug");
        let sensor = cfg.sensor.unwrap();
        assert_eq!(sensor.sensor_id, 9);
        assert_eq!(sensor.idle_delay_ms, 100);
        assert_eq!(sensor.reply_timeout_ms, 1000);
        assert!(cfg.node.is_none());
    }
}
