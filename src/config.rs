use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RpcError};
use crate::protocol::DEFAULT_MAX_PAYLOAD_SIZE;
use crate::transport::Protocol;

/// Port the reference RPC server listens on.
pub const DEFAULT_PORT: u16 = 13001;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Remote address: `ip`, `ip:port`, `host` or `host:port`.
    pub address: Option<String>,
    /// Port used when `address` does not carry one.
    pub port: u16,
    pub protocol: Protocol,
    /// Default per-call timeout; `None` waits forever.
    pub call_timeout_ms: Option<u64>,
    pub max_payload_size: u32,
    pub log_level: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            address: None,
            port: DEFAULT_PORT,
            protocol: Protocol::Tcp,
            call_timeout_ms: None,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            log_level: "info".to_string(),
        }
    }
}

impl ClientConfig {
    /// Load a JSON config file; absent keys keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| RpcError::config(format!("cannot read {}: {}", path.display(), e)))?;
        serde_json::from_str(&text)
            .map_err(|e| RpcError::config(format!("invalid config {}: {}", path.display(), e)))
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }

    /// Validated `host:port` to connect to. Performs no network I/O.
    pub fn endpoint(&self) -> Result<String> {
        let address = self
            .address
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .ok_or_else(|| RpcError::config("a remote address is required"))?;

        if address.chars().any(char::is_whitespace) {
            return Err(RpcError::config(format!(
                "invalid remote address: {:?}",
                address
            )));
        }
        if let Ok(addr) = address.parse::<SocketAddr>() {
            return Ok(addr.to_string());
        }
        if let Ok(ip) = address.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, self.port).to_string());
        }

        match address.rsplit_once(':') {
            Some((host, port)) => {
                if host.is_empty() || port.parse::<u16>().is_err() {
                    return Err(RpcError::config(format!(
                        "invalid remote address: {:?}",
                        address
                    )));
                }
                Ok(address.to_string())
            }
            None => Ok(format!("{}:{}", address, self.port)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub max_payload_size: u32,
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_address: format!("0.0.0.0:{}", DEFAULT_PORT),
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            log_level: "info".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| RpcError::config(format!("cannot read {}: {}", path.display(), e)))?;
        serde_json::from_str(&text)
            .map_err(|e| RpcError::config(format!("invalid config {}: {}", path.display(), e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn with_address(address: &str) -> ClientConfig {
        ClientConfig {
            address: Some(address.to_string()),
            ..ClientConfig::default()
        }
    }

    #[test]
    fn test_endpoint_forms() {
        assert_eq!(with_address("192.168.1.20").endpoint().unwrap(), "192.168.1.20:13001");
        assert_eq!(with_address("10.0.0.1:9000").endpoint().unwrap(), "10.0.0.1:9000");
        assert_eq!(with_address("::1").endpoint().unwrap(), "[::1]:13001");
        assert_eq!(with_address("device.local").endpoint().unwrap(), "device.local:13001");
        assert_eq!(with_address("device.local:42").endpoint().unwrap(), "device.local:42");
    }

    #[test]
    fn test_endpoint_rejects_bad_addresses() {
        assert!(matches!(ClientConfig::default().endpoint(), Err(RpcError::Config(_))));
        assert!(matches!(with_address("  ").endpoint(), Err(RpcError::Config(_))));
        assert!(matches!(with_address("bad host").endpoint(), Err(RpcError::Config(_))));
        assert!(matches!(with_address("host:port").endpoint(), Err(RpcError::Config(_))));
        assert!(matches!(with_address(":80").endpoint(), Err(RpcError::Config(_))));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"address": "127.0.0.1", "call_timeout_ms": 250, "protocol": "tcp"}}"#
        )
        .unwrap();

        let config = ClientConfig::from_file(file.path()).unwrap();
        assert_eq!(config.address.as_deref(), Some("127.0.0.1"));
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.call_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_invalid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(
            ClientConfig::from_file(file.path()),
            Err(RpcError::Config(_))
        ));
        assert!(matches!(
            ServerConfig::from_file("/nonexistent/protorpc.json"),
            Err(RpcError::Config(_))
        ));
    }
}
