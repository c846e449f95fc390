//! # LANSHARE Discovery
//!
//! Device discovery layer for LANSHARE.
//!
//! This crate provides:
//! - A process-wide device registry with liveness tracking
//! - A store-less signaling relay that forwards negotiation messages
//!   between registered devices
//! - A relay client used by devices to register, heartbeat and signal
//!
//! ## Liveness
//!
//! Devices heartbeat every [`HEARTBEAT_INTERVAL`]. A device is shown as online
//! while its last heartbeat is younger than [`ONLINE_WINDOW`], and forgotten
//! once it has been silent for [`EXPIRY_TIMEOUT`]. The gap between the two
//! windows lets a device appear offline before it disappears.
//!
//! ## Example
//!
//! ```rust,no_run
//! use lanshare_discovery::relay::{RelayClient, RelayServer};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let server = RelayServer::bind("127.0.0.1:0".parse()?).await?;
//! let addr = server.local_addr()?;
//! tokio::spawn(async move { server.run().await });
//!
//! let mut client = RelayClient::connect(addr).await?;
//! let me = client.register("laptop").await?;
//! println!("registered as {}", me.device_id);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod registry;
pub mod relay;
pub mod wire;

pub use registry::{
    Device, DeviceId, DeviceStatus, DeviceSummary, MembershipChange, Registry, RegistryConfig,
    RegistryError,
};
pub use relay::{
    NegotiationMessage, Registration, RelayClient, RelayError, RelayEvent, RelayServer,
    RelayServerConfig, SignalKind,
};

use std::time::Duration;

/// Interval at which clients send heartbeats (15 seconds)
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Window during which a device is reported online (30 seconds)
pub const ONLINE_WINDOW: Duration = Duration::from_secs(30);

/// Silence after which a device is removed from the registry (60 seconds)
pub const EXPIRY_TIMEOUT: Duration = Duration::from_secs(60);

/// Cadence of the expiry sweep (30 seconds)
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);
