//! Configuration management

use std::net::Ipv4Addr;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Messaging backend configuration
    pub backend: BackendConfig,
    /// TUN device configuration
    pub tun: TunConfig,
    /// Batch flushes per second; zero sends every packet immediately
    #[serde(default)]
    pub cache_flush_rate: f32,
    /// Peer whose messages carry inbound tunnel traffic
    pub receive_from_user_id: i64,
    /// Chat that receives outbound tunnel traffic
    pub send_to_chat_id: i64,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }
}

/// Messaging backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Address of the local bridge process
    pub bridge_addr: String,
    /// Directory for the session database
    pub database_directory: String,
    /// Application id issued by the messaging service
    pub api_id: i32,
    /// Application hash issued by the messaging service
    pub api_hash: String,
    /// Key for the local session database
    #[serde(default)]
    pub database_encryption_key: String,
    /// Phone number; prompted for interactively when absent
    #[serde(default)]
    pub phone_number: Option<String>,
}

/// TUN device configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunConfig {
    /// Interface name; empty lets the kernel pick one
    #[serde(default)]
    pub name: String,
    /// Interface address
    pub ip: Ipv4Addr,
    /// Network prefix length
    #[serde(default = "default_prefix")]
    pub prefix: u8,
    /// Maximum transmission unit
    #[serde(default = "default_mtu")]
    pub mtu: u16,
}

fn default_prefix() -> u8 {
    24
}

fn default_mtu() -> u16 {
    1500
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
        cache_flush_rate = 2.0
        receive_from_user_id = 111
        send_to_chat_id = 222

        [backend]
        bridge_addr = "127.0.0.1:9090"
        database_directory = "/var/lib/gramtun"
        api_id = 12345
        api_hash = "abcdef"

        [tun]
        name = "tun0"
        ip = "10.8.0.1"
    "#;

    #[test]
    fn test_parse_example() {
        let config: Config = toml::from_str(EXAMPLE).unwrap();
        assert_eq!(config.cache_flush_rate, 2.0);
        assert_eq!(config.receive_from_user_id, 111);
        assert_eq!(config.send_to_chat_id, 222);
        assert_eq!(config.backend.bridge_addr, "127.0.0.1:9090");
        assert_eq!(config.backend.phone_number, None);
        assert_eq!(config.tun.ip, Ipv4Addr::new(10, 8, 0, 1));
        // defaults
        assert_eq!(config.tun.prefix, 24);
        assert_eq!(config.tun.mtu, 1500);
    }

    #[test]
    fn test_missing_section_fails() {
        let result: Result<Config, _> = toml::from_str("send_to_chat_id = 1");
        assert!(result.is_err());
    }
}
