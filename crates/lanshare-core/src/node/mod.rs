//! Node orchestration layer
//!
//! The [`Node`] is the high-level API: it registers the device with a relay
//! and wires the relay client, the connection manager and the transfer
//! engines together.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                        Node API                          │
//! ├──────────────────┬──────────────────┬───────────────────┤
//! │   Relay client   │   Connections    │   Transfers       │
//! │ (devices, signal)│ (negotiation)    │ (chunked files)   │
//! ├──────────────────┴──────────────────┴───────────────────┤
//! │                      Event bus                           │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use lanshare_core::node::{Node, NodeConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = NodeConfig::with_relay("192.168.1.10:9470".parse()?, "laptop");
//!     let node = Node::start(config).await?;
//!
//!     let peer = node.wait_for_device("phone", std::time::Duration::from_secs(5)).await?;
//!     node.connect(&peer).await?;
//!     node.send_file(&peer, "notes.txt").await?;
//!
//!     node.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
#[allow(clippy::module_inception)]
pub mod node;

pub use config::{NodeConfig, default_display_name};
pub use node::Node;
