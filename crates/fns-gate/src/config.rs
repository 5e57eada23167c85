//! Gateway configuration, loaded from TOML.
//!
//! Every field has a default, so an empty file is a valid single-node
//! configuration listening on `0.0.0.0:8080`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use fns_ws::{deflate, OriginCheck, Upgrader};

use crate::node::NodeId;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatewayConfig {
    /// Address of the WebSocket listener.
    pub listen: String,
    pub websocket: WebsocketConfig,
    pub cluster: ClusterConfig,
    pub registry: RegistryConfig,
    pub log: LogSettings,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            listen: "0.0.0.0:8080".to_string(),
            websocket: WebsocketConfig::default(),
            cluster: ClusterConfig::default(),
            registry: RegistryConfig::default(),
            log: LogSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OriginPolicy {
    /// Absent `Origin`, or an `Origin` whose host equals `Host`.
    #[default]
    SameHost,
    Any,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WebsocketConfig {
    pub max_connections: usize,
    /// 0 disables the handshake deadline.
    pub handshake_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub read_buffer_size: usize,
    pub write_timeout_ms: u64,
    pub write_buffer_size: usize,
    pub enable_compression: bool,
    pub compression_level: i32,
    pub max_request_message_size: u64,
    pub origin_check_policy: OriginPolicy,
    pub subprotocols: Vec<String>,
}

impl Default for WebsocketConfig {
    fn default() -> Self {
        WebsocketConfig {
            max_connections: 10240,
            handshake_timeout_ms: 0,
            read_timeout_ms: 10_000,
            read_buffer_size: 4096,
            write_timeout_ms: 60_000,
            write_buffer_size: 4096,
            enable_compression: false,
            compression_level: deflate::DEFAULT_COMPRESSION_LEVEL,
            max_request_message_size: 4096,
            origin_check_policy: OriginPolicy::SameHost,
            subprotocols: Vec::new(),
        }
    }
}

impl WebsocketConfig {
    pub fn handshake_timeout(&self) -> Option<Duration> {
        match self.handshake_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Build the upgrader. `check_origin` overrides the configured policy.
    pub fn upgrader(&self, check_origin: Option<OriginCheck>) -> Upgrader {
        let check_origin = check_origin.or_else(|| match self.origin_check_policy {
            OriginPolicy::SameHost => None,
            OriginPolicy::Any => Some(Arc::new(|_: &fns_ws::HandshakeRequest| true) as OriginCheck),
        });
        Upgrader {
            handshake_timeout: self.handshake_timeout(),
            read_buffer_size: self.read_buffer_size,
            write_buffer_size: self.write_buffer_size,
            subprotocols: self.subprotocols.clone(),
            enable_compression: self.enable_compression,
            compression_level: self.compression_level,
            check_origin,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClusterConfig {
    /// `name@host[:port]` of this node's RPC listener. Port 0 binds an
    /// ephemeral port, which then becomes part of the node id.
    pub node: String,
    /// Shared secret for inter-node RPC.
    pub cookie: String,
    pub rpc_timeout_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            node: "fns@127.0.0.1:0".to_string(),
            cookie: String::new(),
            rpc_timeout_ms: 5000,
        }
    }
}

impl ClusterConfig {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryBackend {
    /// In-process store; also served to other nodes as service `kv`.
    #[default]
    Memory,
    /// The store hosted by `store_node`.
    Node,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegistryConfig {
    pub backend: RegistryBackend,
    pub store_node: Option<String>,
    pub prefix: String,
    pub ttl_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            backend: RegistryBackend::Memory,
            store_node: None,
            prefix: "ws:".to_string(),
            ttl_secs: 3600,
        }
    }
}

impl RegistryConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    #[default]
    Plain,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogSettings {
    pub format: LogFormat,
    pub level: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        LogSettings {
            format: LogFormat::Plain,
            level: "info".to_string(),
        }
    }
}

impl GatewayConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: GatewayConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let ws = &self.websocket;
        if ws.read_buffer_size == 0 || ws.write_buffer_size == 0 {
            return Err(ConfigError::Invalid("buffer sizes must be non-zero".into()));
        }
        if ws.max_request_message_size == 0 {
            return Err(ConfigError::Invalid("max_request_message_size must be non-zero".into()));
        }
        if ws.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be non-zero".into()));
        }
        if !deflate::is_valid_level(ws.compression_level) {
            return Err(ConfigError::Invalid(format!(
                "compression_level {} outside -1..=9",
                ws.compression_level
            )));
        }
        if self.registry.ttl_secs == 0 {
            return Err(ConfigError::Invalid("registry.ttl_secs must be non-zero".into()));
        }
        self.node_id()?;
        if self.registry.backend == RegistryBackend::Node {
            match &self.registry.store_node {
                Some(node) => {
                    node.parse::<NodeId>().map_err(ConfigError::Invalid)?;
                }
                None => {
                    return Err(ConfigError::Invalid(
                        "registry backend 'node' needs registry.store_node".into(),
                    ))
                }
            }
        }
        Ok(())
    }

    pub fn node_id(&self) -> Result<NodeId, ConfigError> {
        self.cluster.node.parse().map_err(ConfigError::Invalid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_file_uses_defaults() {
        let config = GatewayConfig::from_toml_str("").unwrap();
        assert_eq!(config, GatewayConfig::default());
        assert_eq!(config.websocket.max_connections, 10240);
        assert_eq!(config.websocket.handshake_timeout(), None);
        assert_eq!(config.websocket.read_timeout(), Duration::from_secs(10));
        assert_eq!(config.websocket.write_timeout(), Duration::from_secs(60));
        assert_eq!(config.websocket.max_request_message_size, 4096);
        assert_eq!(config.registry.prefix, "ws:");
        assert_eq!(config.registry.ttl(), Duration::from_secs(3600));
    }

    #[test]
    fn parses_full_file() {
        let text = r#"
            listen = "127.0.0.1:9001"

            [websocket]
            max_connections = 2
            handshake_timeout_ms = 500
            enable_compression = true
            compression_level = 6
            origin_check_policy = "any"
            subprotocols = ["fns.v1"]

            [cluster]
            node = "gw2@10.0.0.2:9100"
            cookie = "secret"

            [registry]
            backend = "node"
            store_node = "gw1@10.0.0.1:9100"
            ttl_secs = 60

            [log]
            format = "json"
            level = "debug"
        "#;
        let config = GatewayConfig::from_toml_str(text).unwrap();
        assert_eq!(config.websocket.handshake_timeout(), Some(Duration::from_millis(500)));
        assert_eq!(config.websocket.origin_check_policy, OriginPolicy::Any);
        assert_eq!(config.registry.backend, RegistryBackend::Node);
        assert_eq!(config.log.format, LogFormat::Json);
        assert_eq!(config.node_id().unwrap().to_string(), "gw2@10.0.0.2:9100");

        let upgrader = config.websocket.upgrader(None);
        assert!(upgrader.enable_compression);
        assert!(upgrader.check_origin.is_some());
    }

    #[test]
    fn rejects_invalid_values() {
        let bad = [
            "[websocket]\nwrite_buffer_size = 0",
            "[websocket]\ncompression_level = 11",
            "[websocket]\nmax_request_message_size = 0",
            "[registry]\nttl_secs = 0",
            "[cluster]\nnode = \"no-at-sign\"",
            "[registry]\nbackend = \"node\"",
            "unknown_key = 1",
        ];
        for text in bad {
            assert!(GatewayConfig::from_toml_str(text).is_err(), "{text:?} should fail");
        }
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "listen = \"127.0.0.1:0\"").unwrap();
        let config = GatewayConfig::load(file.path()).unwrap();
        assert_eq!(config.listen, "127.0.0.1:0");

        let err = GatewayConfig::load("/nonexistent/fns.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
