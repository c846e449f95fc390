//! # LANSHARE Core
//!
//! Direct device-to-device connections and chunked file transfer for
//! LANSHARE.
//!
//! This crate provides:
//! - The peer connection state machine driven by relay signaling
//! - A framed TCP channel carrying text and binary messages
//! - The chunked file-transfer protocol on that channel
//! - An event bus for UIs and CLIs
//! - The [`Node`] orchestrator tying it all to a relay client
//!
//! ## Connection states
//!
//! ```text
//! Idle ──► Negotiating ──► ChannelOpening ──► Open ──► Closed
//!  ▲            │                 │
//!  └────────────┴───── Failed ◄───┘
//! ```
//!
//! A relay answering "target not found" returns a pending connection to
//! `Idle`; every other negotiation failure ends in `Failed`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod connection;
pub mod error;
pub mod event;
pub mod node;
pub mod transfer;

pub use connection::{ConnectionConfig, ConnectionManager, ConnectionState};
pub use error::{
    ChannelError, ConnectionError, ErrorCategory, NodeError, Result, TransferError,
};
pub use event::{EventBus, NodeEvent, TransferDirection, TransferProgressEvent};
pub use node::{Node, NodeConfig};
pub use transfer::{
    CHUNK_SIZE, DownloadLocator, FileMeta, ReceivedFile, SendReport, TransferConfig,
};
