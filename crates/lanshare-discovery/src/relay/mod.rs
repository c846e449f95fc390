//! # Signaling Relay
//!
//! Store-less relay that lets devices exchange connection-negotiation
//! messages before they can reach each other directly.
//!
//! ## Features
//!
//! - Device registration with assigned identifiers
//! - Device list pushed to every connected device on membership change
//! - Verbatim forwarding of offer/answer/candidate messages
//! - Per-device rate limiting of forwarded signals
//!
//! ## Architecture
//!
//! ```text
//!                    ┌─────────────────┐
//!                    │   Relay Server  │
//!                    │   (registry)    │
//!                    └────────┬────────┘
//!                             │
//!              ┌──────────────┴──────────────┐
//!              │                              │
//!              ▼                              ▼
//!       ┌─────────────┐                ┌─────────────┐
//!       │  Device A   │ ◄── direct ──► │  Device B   │
//!       └─────────────┘    channel     └─────────────┘
//! ```
//!
//! Signals addressed to an unknown device are answered with
//! [`ServerMessage::TargetNotFound`]; nothing is queued for later delivery.
//!
//! ## Example
//!
//! ```rust,no_run
//! use lanshare_discovery::relay::{NegotiationMessage, RelayClient, SignalKind};
//! use lanshare_discovery::DeviceId;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut client = RelayClient::connect("192.168.1.10:9470".parse()?).await?;
//! let me = client.register("laptop").await?;
//! let mut events = client.take_events().expect("events after register");
//!
//! client.send_signal(NegotiationMessage::new(
//!     SignalKind::Offer,
//!     b"...".to_vec(),
//!     me.device_id.clone(),
//!     DeviceId::from("peer"),
//! ))?;
//!
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod protocol;
pub mod router;
pub mod server;

pub use client::{Registration, RelayClient, RelayClientState, RelayEvent};
pub use protocol::{
    ClientMessage, NegotiationMessage, RelayError, RelayErrorCode, ServerMessage, SignalKind,
};
pub use router::{Relay, Route};
pub use server::{RelayServer, RelayServerConfig};

use std::time::Duration;

/// Timeout for connecting and registering with a relay
pub const RELAY_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default relay port
pub const DEFAULT_RELAY_PORT: u16 = 9470;
