//! Diagnostic client configuration
//!
//! Immutable once loaded; the manager and each conversation receive their
//! slice of it by value.
//!
//! # Example
//!
//! ```json
//! {
//!   "discovery": { "broadcast_address": "172.16.255.255" },
//!   "conversations": [
//!     { "name": "DiagTesterOne", "source_address": 1 },
//!     { "name": "DiagTesterTwo", "source_address": 2, "response_timeout_ms": 1000 }
//!   ],
//!   "servers": [
//!     { "logical_address": 64037, "host": "172.16.25.128" }
//!   ]
//! }
//! ```

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::{LogicalAddress, DEFAULT_MAX_PAYLOAD_LEN, DEFAULT_PROTOCOL_VERSION};
use crate::error::ConfigError;

/// Standard DoIP port for both UDP and TCP
pub const DOIP_PORT: u16 = 13400;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagClientConfig {
    /// DoIP protocol version written into every header
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u8,
    /// Vehicle discovery settings
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    /// One entry per tester identity
    #[serde(default)]
    pub conversations: Vec<ConversationConfig>,
    /// Known server logical address to IP mappings
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

fn default_protocol_version() -> u8 {
    DEFAULT_PROTOCOL_VERSION
}

impl Default for DiagClientConfig {
    fn default() -> Self {
        Self {
            protocol_version: DEFAULT_PROTOCOL_VERSION,
            discovery: DiscoveryConfig::default(),
            conversations: Vec::new(),
            servers: Vec::new(),
        }
    }
}

/// UDP vehicle discovery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Local address the discovery socket binds to
    #[serde(default = "default_local_address")]
    pub local_address: IpAddr,
    /// Destination of the identification request
    #[serde(default = "default_broadcast_address")]
    pub broadcast_address: IpAddr,
    /// Destination UDP port
    #[serde(default = "default_doip_port")]
    pub port: u16,
    /// Response collection window in milliseconds
    #[serde(default = "default_discovery_timeout")]
    pub timeout_ms: u64,
}

fn default_local_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_broadcast_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::BROADCAST)
}

fn default_doip_port() -> u16 {
    DOIP_PORT
}

fn default_discovery_timeout() -> u64 {
    2000
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            local_address: default_local_address(),
            broadcast_address: default_broadcast_address(),
            port: DOIP_PORT,
            timeout_ms: default_discovery_timeout(),
        }
    }
}

impl DiscoveryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Per-tester conversation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationConfig {
    /// Unique conversation name used for lookup
    pub name: String,
    /// Tester logical address
    pub source_address: LogicalAddress,
    /// Routing activation type (default: 0x00)
    #[serde(default)]
    pub activation_type: u8,
    /// TCP port used when connecting to an address not in the server list
    #[serde(default = "default_doip_port")]
    pub tcp_port: u16,
    /// TCP connect timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Routing activation timeout in milliseconds
    #[serde(default = "default_activation_timeout")]
    pub activation_timeout_ms: u64,
    /// Diagnostic message acknowledgement timeout in milliseconds
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_ms: u64,
    /// Diagnostic response timeout in milliseconds
    #[serde(default = "default_response_timeout")]
    pub response_timeout_ms: u64,
    /// Largest inbound payload accepted on this conversation
    #[serde(default = "default_max_payload_size")]
    pub max_payload_size: u32,
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_activation_timeout() -> u64 {
    2000
}

fn default_ack_timeout() -> u64 {
    2000
}

fn default_response_timeout() -> u64 {
    5000
}

fn default_max_payload_size() -> u32 {
    DEFAULT_MAX_PAYLOAD_LEN
}

impl ConversationConfig {
    /// Conversation with default timeouts
    pub fn new(name: impl Into<String>, source_address: LogicalAddress) -> Self {
        Self {
            name: name.into(),
            source_address,
            activation_type: 0,
            tcp_port: DOIP_PORT,
            connect_timeout_ms: default_connect_timeout(),
            activation_timeout_ms: default_activation_timeout(),
            ack_timeout_ms: default_ack_timeout(),
            response_timeout_ms: default_response_timeout(),
            max_payload_size: DEFAULT_MAX_PAYLOAD_LEN,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn activation_timeout(&self) -> Duration {
        Duration::from_millis(self.activation_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

/// Known diagnostic server endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub logical_address: LogicalAddress,
    pub host: IpAddr,
    #[serde(default = "default_doip_port")]
    pub port: u16,
}

impl DiagClientConfig {
    /// Load from a `.json` or `.toml` file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let config: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => {
                toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?
            }
            _ => serde_json::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.discovery.timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "discovery.timeout_ms must be non-zero".into(),
            ));
        }

        let mut names = HashSet::new();
        for conv in &self.conversations {
            if conv.name.trim().is_empty() {
                return Err(ConfigError::Invalid("conversation name is empty".into()));
            }
            if !names.insert(conv.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate conversation name: {}",
                    conv.name
                )));
            }
            let timeouts = [
                ("connect_timeout_ms", conv.connect_timeout_ms),
                ("activation_timeout_ms", conv.activation_timeout_ms),
                ("ack_timeout_ms", conv.ack_timeout_ms),
                ("response_timeout_ms", conv.response_timeout_ms),
            ];
            if let Some((field, _)) = timeouts.iter().find(|(_, v)| *v == 0) {
                return Err(ConfigError::Invalid(format!(
                    "{}: {} must be non-zero",
                    conv.name, field
                )));
            }
        }

        let mut addresses = HashSet::new();
        for server in &self.servers {
            if !addresses.insert(server.logical_address) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate server logical address 0x{:04X}",
                    server.logical_address
                )));
            }
        }
        Ok(())
    }

    pub fn conversation(&self, name: &str) -> Option<&ConversationConfig> {
        self.conversations.iter().find(|c| c.name == name)
    }

    pub fn server(&self, logical_address: LogicalAddress) -> Option<&ServerConfig> {
        self.servers
            .iter()
            .find(|s| s.logical_address == logical_address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SAMPLE: &str = r#"{
        "conversations": [
            { "name": "DiagTesterOne", "source_address": 1 },
            { "name": "DiagTesterTwo", "source_address": 2, "response_timeout_ms": 1000 }
        ],
        "servers": [ { "logical_address": 64037, "host": "172.16.25.128" } ]
    }"#;

    #[test]
    fn test_defaults_applied() {
        let config = DiagClientConfig::from_json_str(SAMPLE).unwrap();
        assert_eq!(config.protocol_version, 0x02);
        assert_eq!(config.discovery.port, 13400);
        assert_eq!(config.discovery.timeout_ms, 2000);

        let one = config.conversation("DiagTesterOne").unwrap();
        assert_eq!(one.source_address, 0x0001);
        assert_eq!(one.activation_type, 0x00);
        assert_eq!(one.tcp_port, 13400);
        assert_eq!(one.response_timeout(), Duration::from_secs(5));

        let two = config.conversation("DiagTesterTwo").unwrap();
        assert_eq!(two.response_timeout_ms, 1000);

        let server = config.server(0xFA25).unwrap();
        assert_eq!(server.host.to_string(), "172.16.25.128");
        assert_eq!(server.port, 13400);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let json = r#"{ "conversations": [
            { "name": "A", "source_address": 1 },
            { "name": "A", "source_address": 2 }
        ] }"#;
        assert!(matches!(
            DiagClientConfig::from_json_str(json),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let json = r#"{ "conversations": [
            { "name": "A", "source_address": 1, "ack_timeout_ms": 0 }
        ] }"#;
        let err = DiagClientConfig::from_json_str(json).unwrap_err();
        assert!(err.to_string().contains("ack_timeout_ms"));
    }

    #[test]
    fn test_load_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.toml");
        std::fs::write(
            &path,
            r#"
protocol_version = 3

[discovery]
broadcast_address = "127.0.0.1"
timeout_ms = 500

[[conversations]]
name = "DiagTesterOne"
source_address = 0x0E80
"#,
        )
        .unwrap();

        let config = DiagClientConfig::load(&path).unwrap();
        assert_eq!(config.protocol_version, 3);
        assert_eq!(config.discovery.timeout(), Duration::from_millis(500));
        assert_eq!(config.conversations[0].source_address, 0x0E80);
    }

    #[test]
    fn test_missing_file() {
        let err = DiagClientConfig::load("/nonexistent/client.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
