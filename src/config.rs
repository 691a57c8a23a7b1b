//! Configuration module for Shroud
//!
//! One JSON document configures either end of the tunnel:
//!
//! ```json
//! {
//!   "log": { "level": "info" },
//!   "key": "pre-shared secret",
//!   "server_addr": "203.0.113.7:8388",
//!   "client_addr": "127.0.0.1:1080",
//!   "mux": { "version": 1 }
//! }
//! ```
//!
//! `serveraddr` / `clientaddr` are accepted as aliases. A server with
//! `"egress": "host:port"` forwards every stream there instead of speaking
//! SOCKS5.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::Level;

use crate::common::Address;
use crate::error::{Error, Result};
use crate::mux::MuxConfig;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log configuration
    #[serde(default)]
    pub log: LogConfig,

    /// Pre-shared secret both ends derive their keys from
    pub key: String,

    /// Tunnel server address: dialed by the client, bound by the server
    #[serde(alias = "serveraddr")]
    pub server_addr: String,

    /// Local listen address of the tunnel client
    #[serde(alias = "clientaddr", default, skip_serializing_if = "Option::is_none")]
    pub client_addr: Option<String>,

    /// Fixed server-side target; unset means SOCKS5 per stream
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub egress: Option<String>,

    /// Bound on outbound TCP dials
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_secs: u64,

    /// Multiplexer tunables
    #[serde(default)]
    pub mux: MuxConfig,
}

fn default_dial_timeout() -> u64 {
    10
}

impl Config {
    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;
        Self::from_json(&content)
    }

    /// Parse configuration from JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Create a default client configuration
    pub fn default_client() -> Self {
        Config {
            log: LogConfig::default(),
            key: "change-me".to_string(),
            server_addr: "127.0.0.1:8388".to_string(),
            client_addr: Some("127.0.0.1:1080".to_string()),
            egress: None,
            dial_timeout_secs: default_dial_timeout(),
            mux: MuxConfig::default(),
        }
    }

    /// Create a default server configuration
    pub fn default_server() -> Self {
        Config {
            log: LogConfig::default(),
            key: "change-me".to_string(),
            server_addr: "0.0.0.0:8388".to_string(),
            client_addr: None,
            egress: None,
            dial_timeout_secs: default_dial_timeout(),
            mux: MuxConfig::default(),
        }
    }

    /// Check everything both roles need
    pub fn validate(&self) -> Result<()> {
        if self.key.is_empty() {
            return Err(Error::Config("key must not be empty".into()));
        }
        self.server_address()?;
        if let Some(addr) = &self.client_addr {
            addr.parse::<Address>()?;
        }
        self.egress_address()?;
        if self.dial_timeout_secs == 0 {
            return Err(Error::Config("dial_timeout_secs must be positive".into()));
        }
        self.mux.verify()
    }

    pub fn server_address(&self) -> Result<Address> {
        self.server_addr.parse()
    }

    /// Client listen address; required to run the client
    pub fn client_address(&self) -> Result<Address> {
        match &self.client_addr {
            Some(addr) => addr.parse(),
            None => Err(Error::Config("client_addr is required in client mode".into())),
        }
    }

    pub fn egress_address(&self) -> Result<Option<Address>> {
        self.egress.as_deref().map(str::parse::<Address>).transpose()
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }
}

/// Log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level: trace, debug, info, warning, error, none
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl LogConfig {
    /// Tracing level for the configured name; `None` turns logging off.
    /// Unknown names fall back to `info`.
    pub fn max_level(&self) -> Option<Level> {
        match self.level.to_ascii_lowercase().as_str() {
            "none" | "off" => None,
            "warning" => Some(Level::WARN),
            other => Some(other.parse().unwrap_or(Level::INFO)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_configs_are_valid() {
        let client = Config::default_client();
        client.validate().unwrap();
        assert_eq!(client.client_address().unwrap(), "127.0.0.1:1080".parse().unwrap());

        let server = Config::default_server();
        server.validate().unwrap();
        assert!(matches!(server.client_address(), Err(Error::Config(_))));
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default_client();
        let json = serde_json::to_string_pretty(&config).unwrap();
        let parsed = Config::from_json(&json).unwrap();
        assert_eq!(parsed.client_addr, config.client_addr);
        assert_eq!(parsed.mux, config.mux);
    }

    #[test]
    fn test_legacy_field_names() {
        let config = Config::from_json(
            r#"{"key": "secret", "serveraddr": "10.0.0.1:443", "clientaddr": "127.0.0.1:1080"}"#,
        )
        .unwrap();
        assert_eq!(config.server_addr, "10.0.0.1:443");
        assert_eq!(config.client_addr.as_deref(), Some("127.0.0.1:1080"));
        assert_eq!(config.dial_timeout(), Duration::from_secs(10));
        assert_eq!(config.mux, MuxConfig::default());
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(Config::from_json(r#"{"key": "", "server_addr": "1.2.3.4:1"}"#).is_err());
        assert!(Config::from_json(r#"{"key": "k", "server_addr": "nowhere"}"#).is_err());
        assert!(Config::from_json(r#"{"key": "k", "server_addr": "1.2.3.4:1", "mux": {"version": 9}}"#).is_err());
        assert!(Config::from_json(r#"{"server_addr": "1.2.3.4:1"}"#).is_err());
    }

    #[test]
    fn test_egress_forwarding_target() {
        let config = Config::from_json(r#"{"key": "k", "server_addr": "0.0.0.0:8388", "egress": "127.0.0.1:22"}"#)
            .unwrap();
        assert_eq!(config.egress_address().unwrap(), Some("127.0.0.1:22".parse().unwrap()));

        assert_eq!(Config::default_server().egress_address().unwrap(), None);
        let json = serde_json::to_string(&Config::default_server()).unwrap();
        assert!(!json.contains("egress"));

        assert!(Config::from_json(r#"{"key": "k", "server_addr": "0.0.0.0:8388", "egress": "no port"}"#).is_err());
    }

    #[test]
    fn test_log_levels() {
        let level = |name: &str| LogConfig { level: name.into() }.max_level();
        assert_eq!(level("debug"), Some(Level::DEBUG));
        assert_eq!(level("warning"), Some(Level::WARN));
        assert_eq!(level("none"), None);
        assert_eq!(level("bogus"), Some(Level::INFO));
    }
}
