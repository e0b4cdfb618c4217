//! # Client Configuration
//!
//! JSON-backed configuration for the HSM driver. Field names follow the
//! camelCase keys used by existing deployment files, e.g.:
//!
//! ```text
//! {
//!   "provider": "UTIMACO",
//!   "loadBalancingType": "CLIENT_SIDE_FAILOVER",
//!   "hsmNodes": [{ "ip": "10.0.0.1", "port": 1500 }],
//!   "maxConnections": 4,
//!   "idleConnections": 2,
//!   "keyBlocks": { "HDFC_VISA_CAVV_GEN": "S1012..." }
//! }
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use hsm_common::{HsmError, HsmResult, LoadBalancingType, Node, Provider};

use crate::balancer::{BalancerSettings, WarmupMode};
use crate::connection::ConnectionSettings;
use crate::pool::PoolConfig;

pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 45_000;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 400;
pub const DEFAULT_PING_TIMEOUT_MS: u64 = 100;
pub const DEFAULT_BORROW_TIMEOUT_MS: u64 = 1_000;
pub const DEFAULT_PROBE_WAIT_MS: u64 = 1_000;
pub const DEFAULT_HEALTH_CHECK_INTERVAL_SECS: u64 = 30;

/// TLS settings shared by every node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsConfig {
    /// PEM bundle of CA certificates trusted for HSM endpoints.
    pub ca_file: PathBuf,
    /// Name to verify instead of each node's ip.
    #[serde(default)]
    pub server_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HsmConfig {
    #[serde(default)]
    pub provider: Provider,
    pub load_balancing_type: LoadBalancingType,
    #[serde(default)]
    pub hsm_nodes: Vec<Node>,
    /// `host:port`, mandatory for network-level balancing.
    #[serde(default)]
    pub vip: Option<String>,
    #[serde(default = "default_connections")]
    pub max_connections: usize,
    #[serde(default = "default_connections")]
    pub idle_connections: usize,
    #[serde(default)]
    pub key_blocks: HashMap<String, String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,
    #[serde(default = "default_borrow_timeout_ms")]
    pub borrow_timeout_ms: u64,
    #[serde(default = "default_probe_wait_ms")]
    pub probe_wait_ms: u64,
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
    #[serde(default)]
    pub warmup: WarmupMode,
}

fn default_connections() -> usize {
    1
}

fn default_enabled() -> bool {
    true
}

fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

fn default_read_timeout_ms() -> u64 {
    DEFAULT_READ_TIMEOUT_MS
}

fn default_request_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}

fn default_ping_timeout_ms() -> u64 {
    DEFAULT_PING_TIMEOUT_MS
}

fn default_borrow_timeout_ms() -> u64 {
    DEFAULT_BORROW_TIMEOUT_MS
}

fn default_probe_wait_ms() -> u64 {
    DEFAULT_PROBE_WAIT_MS
}

fn default_health_check_interval_secs() -> u64 {
    DEFAULT_HEALTH_CHECK_INTERVAL_SECS
}

impl HsmConfig {
    /// A config with default limits and timeouts and no nodes.
    pub fn new(load_balancing_type: LoadBalancingType) -> Self {
        HsmConfig {
            provider: Provider::default(),
            load_balancing_type,
            hsm_nodes: Vec::new(),
            vip: None,
            max_connections: default_connections(),
            idle_connections: default_connections(),
            key_blocks: HashMap::new(),
            enabled: true,
            tls: None,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            ping_timeout_ms: DEFAULT_PING_TIMEOUT_MS,
            borrow_timeout_ms: DEFAULT_BORROW_TIMEOUT_MS,
            probe_wait_ms: DEFAULT_PROBE_WAIT_MS,
            health_check_interval_secs: DEFAULT_HEALTH_CHECK_INTERVAL_SECS,
            warmup: WarmupMode::default(),
        }
    }

    /// Parses and validates a JSON document.
    pub fn from_json_str(json: &str) -> HsmResult<Self> {
        let mut config: HsmConfig = serde_json::from_str(json)
            .map_err(|e| HsmError::Config(format!("invalid HSM config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> HsmResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| HsmError::Config(format!("{}: {e}", path.display())))?;
        HsmConfig::from_json_str(&json)
    }

    /// Checks limits and node addresses; resolves the VIP for network-level mode.
    ///
    /// A disabled config is accepted as-is.
    pub fn validate(&mut self) -> HsmResult<()> {
        if !self.enabled {
            return Ok(());
        }

        match self.load_balancing_type {
            LoadBalancingType::NetworkLevel => {
                let vip = self
                    .vip
                    .as_deref()
                    .map(str::trim)
                    .filter(|vip| !vip.is_empty())
                    .ok_or_else(|| {
                        HsmError::Config("Vip is mandatory for NETWORK_LEVEL load balancing".to_string())
                    })?;
                let node = Node::parse(vip)?;
                if !self.hsm_nodes.is_empty() {
                    warn!("HSM nodes configuration is ignored for NETWORK_LEVEL load balancing");
                }
                self.hsm_nodes = vec![node];
            }
            LoadBalancingType::ClientSideRoundRobin | LoadBalancingType::ClientSideFailover => {
                if self.hsm_nodes.is_empty() {
                    return Err(HsmError::Config(
                        "HSM nodes must be configured for CLIENT_SIDE load balancing".to_string(),
                    ));
                }
                for node in &self.hsm_nodes {
                    if node.ip.trim().is_empty() {
                        return Err(HsmError::Config("Node IP is required for all nodes".to_string()));
                    }
                    if node.port == 0 {
                        return Err(HsmError::Config(format!(
                            "Invalid port number for node: {}",
                            node.ip
                        )));
                    }
                }
            }
        }

        if self.max_connections < 1 {
            return Err(HsmError::Config("Max connections must be at least 1".to_string()));
        }
        if self.idle_connections < 1 {
            return Err(HsmError::Config("Idle connections must be at least 1".to_string()));
        }
        if self.idle_connections > self.max_connections {
            return Err(HsmError::Config(
                "Idle connections cannot exceed max connections".to_string(),
            ));
        }

        info!(
            provider = %self.provider,
            strategy = ?self.load_balancing_type,
            nodes = self.hsm_nodes.len(),
            key_blocks = self.key_blocks.len(),
            "HSM configuration validated"
        );
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            ping_timeout: Duration::from_millis(self.ping_timeout_ms),
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_total: self.max_connections,
            min_idle: self.idle_connections,
            borrow_timeout: Duration::from_millis(self.borrow_timeout_ms),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            probe_wait: Duration::from_millis(self.probe_wait_ms),
        }
    }

    pub fn balancer_settings(&self) -> BalancerSettings {
        BalancerSettings {
            strategy: self.load_balancing_type,
            health_check_interval: Duration::from_secs(self.health_check_interval_secs),
            warmup: self.warmup,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_client_side_config_with_defaults() {
        let config = HsmConfig::from_json_str(
            r#"{
                "loadBalancingType": "CLIENT_SIDE_ROUND_ROBIN",
                "hsmNodes": [{ "ip": "10.0.0.1", "port": 1500 }, { "ip": "10.0.0.2", "port": 1500 }],
                "keyBlocks": { "K": "V" }
            }"#,
        )
        .unwrap();

        assert_eq!(config.provider, Provider::Utimaco);
        assert_eq!(config.hsm_nodes.len(), 2);
        assert_eq!(config.max_connections, 1);
        assert_eq!(config.idle_connections, 1);
        assert_eq!(config.pool_config().borrow_timeout, Duration::from_secs(1));
        assert_eq!(config.pool_config().request_timeout, Duration::from_millis(400));
        assert_eq!(config.connection_settings().read_timeout, Duration::from_secs(45));
        assert_eq!(config.connection_settings().ping_timeout, Duration::from_millis(100));
        assert_eq!(config.connect_timeout(), Duration::from_secs(5));
        assert_eq!(config.balancer_settings().health_check_interval, Duration::from_secs(30));
        assert_eq!(config.warmup, WarmupMode::Strict);
    }

    #[test]
    fn network_level_replaces_nodes_with_vip() {
        let config = HsmConfig::from_json_str(
            r#"{
                "loadBalancingType": "NETWORK_LEVEL",
                "vip": "10.1.1.1:1600",
                "hsmNodes": [{ "ip": "10.0.0.1", "port": 1500 }]
            }"#,
        )
        .unwrap();
        assert_eq!(config.hsm_nodes, vec![Node::new("10.1.1.1", 1600)]);
    }

    #[test]
    fn network_level_requires_vip() {
        let mut config = HsmConfig::new(LoadBalancingType::NetworkLevel);
        let err = config.validate().unwrap_err();
        assert!(matches!(err, HsmError::Config(ref msg) if msg.contains("Vip is mandatory")));
    }

    #[test]
    fn client_side_requires_nodes_with_valid_ports() {
        let mut config = HsmConfig::new(LoadBalancingType::ClientSideFailover);
        assert!(config.validate().is_err());

        config.hsm_nodes = vec![Node::new("10.0.0.1", 0)];
        assert!(config.validate().is_err());

        config.hsm_nodes = vec![Node::new(" ", 1500)];
        assert!(config.validate().is_err());

        config.hsm_nodes = vec![Node::new("10.0.0.1", 1500)];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn idle_cannot_exceed_max() {
        let mut config = HsmConfig::new(LoadBalancingType::ClientSideFailover);
        config.hsm_nodes = vec![Node::new("10.0.0.1", 1500)];
        config.max_connections = 2;
        config.idle_connections = 3;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, HsmError::Config(ref msg) if msg.contains("cannot exceed")));
    }

    #[test]
    fn disabled_config_skips_validation() {
        let mut config = HsmConfig::new(LoadBalancingType::NetworkLevel);
        config.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_port_and_unknown_strategy() {
        let err = HsmConfig::from_json_str(
            r#"{ "loadBalancingType": "CLIENT_SIDE_FAILOVER", "hsmNodes": [{ "ip": "a", "port": 70000 }] }"#,
        )
        .unwrap_err();
        assert!(matches!(err, HsmError::Config(_)));

        let err = HsmConfig::from_json_str(r#"{ "loadBalancingType": "RANDOM" }"#).unwrap_err();
        assert!(matches!(err, HsmError::Config(_)));
    }

    #[test]
    fn parses_tls_and_ping_warmup() {
        let config = HsmConfig::from_json_str(
            r#"{
                "loadBalancingType": "CLIENT_SIDE_FAILOVER",
                "hsmNodes": [{ "ip": "10.0.0.1", "port": 1500 }],
                "tls": { "caFile": "/etc/hsm/ca.pem", "serverName": "hsm.internal" },
                "warmup": "PING"
            }"#,
        )
        .unwrap();
        let tls = config.tls.unwrap();
        assert_eq!(tls.ca_file, PathBuf::from("/etc/hsm/ca.pem"));
        assert_eq!(tls.server_name.as_deref(), Some("hsm.internal"));
        assert_eq!(config.warmup, WarmupMode::Ping);
    }
}
