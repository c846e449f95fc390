//! Configuration system for the LANSHARE CLI.

use lanshare_core::connection::{ConnectionConfig, MAX_FRAME_PAYLOAD};
use lanshare_core::node::{NodeConfig as CoreNodeConfig, default_display_name};
use lanshare_core::transfer::TransferConfig as CoreTransferConfig;
use lanshare_discovery::RelayServerConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// LANSHARE configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Node configuration
    #[serde(default)]
    pub node: NodeConfig,
    /// Relay server configuration
    #[serde(default)]
    pub relay: RelayConfig,
    /// Connection configuration
    #[serde(default)]
    pub connection: ConnectionSection,
    /// Transfer configuration
    #[serde(default)]
    pub transfer: TransferConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Name shown to other devices (host name if unset)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Relay to register with
    #[serde(default = "default_relay_addr")]
    pub relay_addr: String,
    /// Heartbeat interval in seconds
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
}

/// Relay server configuration (`lanshare relay`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Bind address
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Maximum registered devices
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    /// Signals per device per second
    #[serde(default = "default_rate_limit")]
    pub rate_limit: usize,
    /// Seconds since the last heartbeat a device counts as online
    #[serde(default = "default_online_window_secs")]
    pub online_window_secs: u64,
    /// Seconds of silence before a device is removed
    #[serde(default = "default_expiry_secs")]
    pub expiry_secs: u64,
}

/// Connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSection {
    /// Seconds from offer to open channel
    #[serde(default = "default_negotiation_timeout_secs")]
    pub negotiation_timeout_secs: u64,
    /// Seconds per candidate dial
    #[serde(default = "default_dial_timeout_secs")]
    pub dial_timeout_secs: u64,
    /// Address to accept channels on
    #[serde(default = "default_listen_ip")]
    pub listen_ip: String,
}

/// Transfer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Chunk size in bytes
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Largest accepted incoming file in bytes
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    /// Where `receive` stores files (current directory if unset)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_dir: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_relay_addr() -> String {
    "127.0.0.1:9470".to_string()
}

fn default_heartbeat_secs() -> u64 {
    15
}

fn default_bind_addr() -> String {
    "0.0.0.0:9470".to_string()
}

fn default_max_clients() -> usize {
    10_000
}

fn default_rate_limit() -> usize {
    100
}

fn default_online_window_secs() -> u64 {
    30
}

fn default_expiry_secs() -> u64 {
    60
}

fn default_negotiation_timeout_secs() -> u64 {
    30
}

fn default_dial_timeout_secs() -> u64 {
    5
}

fn default_listen_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_chunk_size() -> usize {
    16 * 1024
}

fn default_max_file_size() -> u64 {
    4 * 1024 * 1024 * 1024
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            display_name: None,
            relay_addr: default_relay_addr(),
            heartbeat_secs: default_heartbeat_secs(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            max_clients: default_max_clients(),
            rate_limit: default_rate_limit(),
            online_window_secs: default_online_window_secs(),
            expiry_secs: default_expiry_secs(),
        }
    }
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            negotiation_timeout_secs: default_negotiation_timeout_secs(),
            dial_timeout_secs: default_dial_timeout_secs(),
            listen_ip: default_listen_ip(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_file_size: default_max_file_size(),
            download_dir: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("lanshare/config.toml")
    }

    /// Load `path` if it exists, defaults otherwise
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or parsed.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Relay address to register with
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be parsed.
    pub fn parse_relay_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.node.relay_addr.parse()?)
    }

    /// Relay server bind address
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be parsed.
    pub fn parse_bind_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.relay.bind_addr.parse()?)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.parse_relay_addr()?;
        self.parse_bind_addr()?;
        self.connection.listen_ip.parse::<IpAddr>()?;

        if self
            .node
            .display_name
            .as_deref()
            .is_some_and(|name| name.trim().is_empty())
        {
            anyhow::bail!("Display name must not be blank");
        }

        if self.node.heartbeat_secs == 0 {
            anyhow::bail!("Heartbeat interval must be at least 1 second");
        }

        // Devices must get a heartbeat in before they show offline
        if self.relay.online_window_secs <= self.node.heartbeat_secs {
            anyhow::bail!(
                "Online window ({}s) must exceed the heartbeat interval ({}s)",
                self.relay.online_window_secs,
                self.node.heartbeat_secs
            );
        }
        if self.relay.expiry_secs < self.relay.online_window_secs {
            anyhow::bail!("Expiry must not be shorter than the online window");
        }

        if self.relay.max_clients == 0 || self.relay.rate_limit == 0 {
            anyhow::bail!("Relay limits must be positive");
        }

        if self.connection.negotiation_timeout_secs == 0 || self.connection.dial_timeout_secs == 0 {
            anyhow::bail!("Connection timeouts must be at least 1 second");
        }

        if self.transfer.chunk_size == 0 || self.transfer.chunk_size > MAX_FRAME_PAYLOAD {
            anyhow::bail!("Chunk size must be between 1 byte and 1MB");
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }

    /// Node configuration for the core library
    ///
    /// # Errors
    ///
    /// Returns an error if an address cannot be parsed.
    pub fn node_config(&self) -> anyhow::Result<CoreNodeConfig> {
        let display_name = self
            .node
            .display_name
            .clone()
            .unwrap_or_else(default_display_name);

        Ok(CoreNodeConfig {
            relay_addr: self.parse_relay_addr()?,
            display_name,
            heartbeat_interval: Duration::from_secs(self.node.heartbeat_secs),
            connection: ConnectionConfig {
                negotiation_timeout: Duration::from_secs(self.connection.negotiation_timeout_secs),
                dial_timeout: Duration::from_secs(self.connection.dial_timeout_secs),
                listen_ip: self.connection.listen_ip.parse()?,
                ..ConnectionConfig::default()
            },
            transfer: CoreTransferConfig {
                chunk_size: self.transfer.chunk_size,
                max_file_size: self.transfer.max_file_size,
            },
            ..CoreNodeConfig::default()
        })
    }

    /// Relay server configuration
    #[must_use]
    pub fn relay_server_config(&self) -> RelayServerConfig {
        RelayServerConfig {
            max_clients: self.relay.max_clients,
            rate_limit: self.relay.rate_limit,
            online_window: Duration::from_secs(self.relay.online_window_secs),
            client_timeout: Duration::from_secs(self.relay.expiry_secs),
            ..RelayServerConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.node.relay_addr, "127.0.0.1:9470");
        assert_eq!(config.transfer.chunk_size, 16 * 1024);
        assert_eq!(config.relay.online_window_secs, 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());

        config.logging.level = "debug".to_string();
        config.transfer.chunk_size = 0;
        assert!(config.validate().is_err());

        config.transfer.chunk_size = 16 * 1024;
        config.relay.online_window_secs = 10;
        assert!(config.validate().is_err());

        config.relay.online_window_secs = 30;
        config.node.relay_addr = "not an address".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [node]
            display_name = "desk"

            [transfer]
            chunk_size = 8192
            "#,
        )
        .unwrap();

        assert_eq!(config.node.display_name.as_deref(), Some("desk"));
        assert_eq!(config.node.relay_addr, "127.0.0.1:9470");
        assert_eq!(config.transfer.chunk_size, 8192);
        assert_eq!(config.connection.negotiation_timeout_secs, 30);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");

        let mut config = Config::default();
        config.node.display_name = Some("laptop".to_string());
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.node.display_name.as_deref(), Some("laptop"));
        assert_eq!(loaded.relay.bind_addr, config.relay.bind_addr);
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_default(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_node_config_conversion() {
        let mut config = Config::default();
        config.node.display_name = Some("desk".to_string());
        config.connection.negotiation_timeout_secs = 12;

        let node = config.node_config().unwrap();
        assert_eq!(node.display_name, "desk");
        assert_eq!(node.connection.negotiation_timeout, Duration::from_secs(12));
        assert_eq!(node.relay_addr.port(), 9470);
        assert!(node.validate().is_ok());
    }
}
