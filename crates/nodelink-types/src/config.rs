//! Configuration types and loading from `~/.nodelink/config.toml`.
//!
//! Every section is optional; missing values fall back to their defaults.

use crate::error::{NodeLinkError, NodeLinkResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeLinkConfig {
    pub node: NodeConfig,
    pub routing: RoutingConfig,
    pub rpc: RpcConfig,
    pub health: HealthCheckConfig,
    pub uplink: UplinkConfig,
}

impl NodeLinkConfig {
    /// Parse a configuration from TOML text.
    pub fn from_toml_str(contents: &str) -> NodeLinkResult<Self> {
        toml::from_str(contents).map_err(|e| NodeLinkError::Config(e.to_string()))
    }
}

/// Identity, listeners and outgoing connections of a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Persistent installation id.
    pub instance_id: String,
    /// Human-readable node name.
    pub display_name: String,
    /// Whether this node forwards requests for other nodes.
    pub is_relay: bool,
    /// Contact points to listen on (`tcp:host:port` or `inproc:name`).
    pub listen: Vec<String>,
    /// Configured outgoing connections.
    pub connections: Vec<ConnectionConfig>,
    /// Optional pre-shared key; when set, handshakes are HMAC-authenticated.
    pub shared_secret: Option<String>,
    /// Remote IPs allowed to connect. Empty accepts everyone.
    pub allowed_ips: Vec<String>,
    pub handshake_timeout_ms: u64,
    pub request_timeout_ms: u64,
    /// Timeout for requests forwarded on behalf of other nodes.
    pub forwarding_timeout_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            instance_id: uuid::Uuid::new_v4().simple().to_string(),
            display_name: "nodelink-node".to_string(),
            is_relay: false,
            listen: Vec::new(),
            connections: Vec::new(),
            shared_secret: None,
            allowed_ips: Vec::new(),
            handshake_timeout_ms: 5_000,
            request_timeout_ms: 40_000,
            forwarding_timeout_ms: 30_000,
        }
    }
}

/// One configured outgoing connection and its reconnect policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub contact_point: String,
    /// Connect when the node starts.
    pub auto_start: bool,
    /// Reconnect after failures and unexpected disconnects.
    pub auto_retry: bool,
    pub retry_initial_delay_ms: u64,
    pub retry_delay_multiplier: f64,
    pub retry_max_delay_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            contact_point: String::new(),
            auto_start: true,
            auto_retry: true,
            retry_initial_delay_ms: 5_000,
            retry_delay_multiplier: 1.5,
            retry_max_delay_ms: 300_000,
        }
    }
}

/// How a second live session of an already connected installation is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollisionPolicyKind {
    /// The newer session replaces the existing one.
    #[default]
    PreferNewest,
    /// The existing session stays; the newcomer is refused.
    KeepExisting,
}

/// A route that is not learned from a direct link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticRouteConfig {
    /// Destination node id (`instance:session`).
    pub destination: String,
    /// Directly connected node id used as next hop.
    pub via: String,
}

/// Request routing settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub collision_policy: CollisionPolicyKind,
    pub static_routes: Vec<StaticRouteConfig>,
}

/// Remote service call settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub call_timeout_ms: u64,
    /// Lifetime of callback objects and proxies without renewal.
    pub callback_ttl_secs: u64,
    /// How often expired callback entries are swept and proxies renewed.
    pub callback_sweep_interval_secs: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 40_000,
            callback_ttl_secs: 600,
            callback_sweep_interval_secs: 60,
        }
    }
}

/// Periodic health checks on outgoing channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    /// Maximum random deviation added to or subtracted from the interval.
    pub jitter_ms: u64,
    pub timeout_ms: u64,
    /// Consecutive failures after which a channel is considered broken.
    pub max_consecutive_failures: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 20_000,
            jitter_ms: 5_000,
            timeout_ms: 10_000,
            max_consecutive_failures: 3,
        }
    }
}

/// What the relay does with unknown message types on the default channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownMessagePolicy {
    /// Send the message back to its sender unchanged (development setups).
    Echo,
    /// Log and drop the message.
    #[default]
    Reject,
}

/// Uplink relay and session settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UplinkConfig {
    /// Address the relay listens on, if any.
    pub listen_addr: Option<String>,
    /// Honor the test-simulation handshake keys.
    pub allow_test_handshake_flags: bool,
    pub unknown_message_policy: UnknownMessagePolicy,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_jitter_ms: u64,
    /// How long a heartbeat may stay unanswered.
    pub heartbeat_response_timeout_ms: u64,
    /// A session with no incoming traffic for this long is closed.
    pub idle_timeout_ms: u64,
    pub channel_init_attempts: u32,
    pub channel_init_retry_delay_ms: u64,
}

impl Default for UplinkConfig {
    fn default() -> Self {
        Self {
            listen_addr: None,
            allow_test_handshake_flags: false,
            unknown_message_policy: UnknownMessagePolicy::Reject,
            heartbeat_interval_ms: 30_000,
            heartbeat_jitter_ms: 5_000,
            heartbeat_response_timeout_ms: 20_000,
            idle_timeout_ms: 120_000,
            channel_init_attempts: 5,
            channel_init_retry_delay_ms: 500,
        }
    }
}

/// Load configuration from a TOML file, with defaults.
pub fn load_config(path: Option<&Path>) -> NodeLinkConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(path = %config_path.display(), "No config file found, using defaults");
        return NodeLinkConfig::default();
    }

    match std::fs::read_to_string(&config_path) {
        Ok(contents) => match NodeLinkConfig::from_toml_str(&contents) {
            Ok(config) => {
                info!(path = %config_path.display(), "Loaded configuration");
                config
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Failed to parse config, using defaults"
                );
                NodeLinkConfig::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to read config file, using defaults"
            );
            NodeLinkConfig::default()
        }
    }
}

/// `~/.nodelink/config.toml`, or `./config.toml` without a home directory.
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".nodelink"))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("config.toml")
}
