//! Node identity.
//!
//! A node is named `name@host:port`, where `host:port` is the address of its
//! RPC listener. The name is fixed for the lifetime of the process.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Default RPC port when a node name carries none.
pub const DEFAULT_RPC_PORT: u16 = 9000;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeId {
    name: String,
    host: String,
    port: u16,
}

/// Parse a node name string into (name_part, host, port).
///
/// Accepted formats:
/// - `"name@host"` -> (name, host, 9000)
/// - `"name@host:port"` -> (name, host, port)
pub fn parse_node_name(name: &str) -> Result<(&str, &str, u16), String> {
    let (name_part, host_port) = name
        .split_once('@')
        .ok_or_else(|| format!("invalid node name '{}': missing '@' separator", name))?;

    if name_part.is_empty() {
        return Err(format!("invalid node name '{}': empty name part", name));
    }
    if host_port.is_empty() {
        return Err(format!("invalid node name '{}': empty host part", name));
    }

    match host_port.rsplit_once(':') {
        Some((host, port_str)) => {
            if host.is_empty() {
                return Err(format!("invalid node name '{}': empty host part", name));
            }
            let port: u16 = port_str
                .parse()
                .map_err(|_| format!("invalid node name '{}': invalid port '{}'", name, port_str))?;
            Ok((name_part, host, port))
        }
        None => Ok((name_part, host_port, DEFAULT_RPC_PORT)),
    }
}

impl NodeId {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        NodeId {
            name: name.into(),
            host: host.into(),
            port,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port` of the node's RPC listener.
    pub fn rpc_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The same node on another port; used once an ephemeral port is bound.
    pub fn with_port(&self, port: u16) -> NodeId {
        NodeId {
            port,
            ..self.clone()
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.name, self.host, self.port)
    }
}

impl FromStr for NodeId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, host, port) = parse_node_name(s)?;
        Ok(NodeId::new(name, host, port))
    }
}

impl TryFrom<String> for NodeId {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<NodeId> for String {
    fn from(node: NodeId) -> String {
        node.to_string()
    }
}
