//! # Node and Routing Types
//!
//! Small value types shared by configuration, pools and the balancer.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{HsmError, HsmResult};

/// One physical HSM endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    pub ip: String,
    pub port: u16,
}

impl Node {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Node { ip: ip.into(), port }
    }

    /// Parses `host:port`, as used by a network-level VIP.
    pub fn parse(addr: &str) -> HsmResult<Self> {
        let parts: Vec<&str> = addr.split(':').collect();
        if parts.len() != 2 {
            return Err(HsmError::Config(
                "VIP must be in the format host:port (e.g., 10.0.0.1:1500)".to_string(),
            ));
        }
        let host = parts[0].trim();
        if host.is_empty() {
            return Err(HsmError::Config(format!("missing host in VIP: {addr}")));
        }
        let port: u16 = parts[1]
            .trim()
            .parse()
            .map_err(|_| HsmError::Config(format!("Invalid port in VIP: {addr}")))?;
        if port == 0 {
            return Err(HsmError::Config(format!("Invalid port in VIP: {addr}")));
        }
        Ok(Node::new(host, port))
    }

    /// Returns `ip:port` suitable for `TcpStream::connect`.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// How logical commands are spread across configured nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadBalancingType {
    /// A single VIP fronted by a network load balancer.
    NetworkLevel,
    ClientSideRoundRobin,
    /// Sticky primary-first ordering.
    ClientSideFailover,
}

/// HSM vendor whose wire syntax the codec speaks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Provider {
    #[default]
    Utimaco,
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provider::Utimaco => f.write_str("UTIMACO"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_vip() {
        let node = Node::parse(" 10.0.0.1 : 1500 ").unwrap();
        assert_eq!(node, Node::new("10.0.0.1", 1500));
        assert_eq!(node.addr(), "10.0.0.1:1500");
    }

    #[test]
    fn rejects_bad_vip() {
        assert!(Node::parse("10.0.0.1").is_err());
        assert!(Node::parse("10.0.0.1:abc").is_err());
        assert!(Node::parse("10.0.0.1:0").is_err());
        assert!(Node::parse("a:1:2").is_err());
    }

    #[test]
    fn strategy_names_match_config_files() {
        let parsed: LoadBalancingType = serde_json::from_str("\"CLIENT_SIDE_ROUND_ROBIN\"").unwrap();
        assert_eq!(parsed, LoadBalancingType::ClientSideRoundRobin);
        let parsed: Provider = serde_json::from_str("\"UTIMACO\"").unwrap();
        assert_eq!(parsed, Provider::Utimaco);
    }
}
