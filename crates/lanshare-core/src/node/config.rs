//! Node configuration

use crate::connection::{ConnectionConfig, MAX_FRAME_PAYLOAD};
use crate::error::NodeError;
use crate::event::DEFAULT_EVENT_CAPACITY;
use crate::transfer::TransferConfig;
use lanshare_discovery::HEARTBEAT_INTERVAL;
use lanshare_discovery::relay::DEFAULT_RELAY_PORT;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Node configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Relay server address
    pub relay_addr: SocketAddr,

    /// Name shown to other devices
    pub display_name: String,

    /// Heartbeat cadence towards the relay
    pub heartbeat_interval: Duration,

    /// Connection negotiation configuration
    pub connection: ConnectionConfig,

    /// Transfer configuration
    pub transfer: TransferConfig,

    /// Event bus capacity per subscriber
    pub event_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            relay_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_RELAY_PORT)),
            display_name: default_display_name(),
            heartbeat_interval: HEARTBEAT_INTERVAL,
            connection: ConnectionConfig::default(),
            transfer: TransferConfig::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl NodeConfig {
    /// Config for a relay address, everything else default
    #[must_use]
    pub fn with_relay(relay_addr: SocketAddr, display_name: impl Into<String>) -> Self {
        Self {
            relay_addr,
            display_name: display_name.into(),
            ..Self::default()
        }
    }

    /// Check values before starting a node
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` naming the first bad value.
    pub fn validate(&self) -> Result<(), NodeError> {
        if self.heartbeat_interval.is_zero() {
            return Err(NodeError::invalid_config("heartbeat interval must be positive"));
        }
        if self.connection.negotiation_timeout.is_zero() {
            return Err(NodeError::invalid_config("negotiation timeout must be positive"));
        }
        if self.connection.dial_timeout.is_zero() {
            return Err(NodeError::invalid_config("dial timeout must be positive"));
        }
        if self.connection.channel_buffer == 0 {
            return Err(NodeError::invalid_config("channel buffer must be positive"));
        }
        if self.transfer.chunk_size == 0 {
            return Err(NodeError::invalid_config("chunk size must be positive"));
        }
        if self.transfer.chunk_size > MAX_FRAME_PAYLOAD {
            return Err(NodeError::invalid_config(
                "chunk size must fit in one channel frame",
            ));
        }
        if self.event_capacity == 0 {
            return Err(NodeError::invalid_config("event capacity must be positive"));
        }
        Ok(())
    }
}

/// Host name from the environment, or a generic fallback
#[must_use]
pub fn default_display_name() -> String {
    ["HOSTNAME", "COMPUTERNAME"]
        .iter()
        .find_map(|var| std::env::var(var).ok().filter(|v| !v.trim().is_empty()))
        .unwrap_or_else(|| "lanshare".to_string())
}
