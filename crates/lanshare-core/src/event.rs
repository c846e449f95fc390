//! Events emitted to the application layer
//!
//! The core publishes everything a UI or CLI needs to render on a single
//! broadcast bus. Subscribers that fall behind lose the oldest events
//! (`RecvError::Lagged`) instead of slowing the core down.

use crate::connection::ConnectionState;
use crate::error::ErrorCategory;
use crate::transfer::ReceivedFile;
use lanshare_discovery::{DeviceId, DeviceSummary};
use tokio::sync::broadcast;

/// Default event bus capacity
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Direction of a transfer relative to this device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    /// This device is sending
    Send,
    /// This device is receiving
    Receive,
}

/// Progress of one file in flight
#[derive(Debug, Clone, PartialEq)]
pub struct TransferProgressEvent {
    /// Remote device
    pub remote: DeviceId,
    /// Send or receive
    pub direction: TransferDirection,
    /// File name from the metadata
    pub file_name: String,
    /// Declared file size
    pub total_size: u64,
    /// Bytes sent or received so far
    pub bytes: u64,
    /// `bytes / total_size`, 1.0 only once every byte has moved
    pub progress: f64,
}

/// Events emitted by the node
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// The relay pushed a new device list
    DevicesChanged(Vec<DeviceSummary>),
    /// A peer connection changed state
    ConnectionStateChanged {
        /// Remote device
        remote: DeviceId,
        /// New state
        state: ConnectionState,
    },
    /// A chunk was sent or received
    TransferProgress(TransferProgressEvent),
    /// A file arrived completely
    FileReceived(ReceivedFile),
    /// An outgoing file was fully sent
    TransferCompleted {
        /// Receiving device
        remote: DeviceId,
        /// File name
        file_name: String,
        /// File size in bytes
        size: u64,
    },
    /// Something failed
    Error {
        /// Device involved, if any
        remote: Option<DeviceId>,
        /// Error category
        category: ErrorCategory,
        /// Human-readable message
        message: String,
    },
}

/// Broadcast bus for [`NodeEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<NodeEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    /// Create a bus holding up to `capacity` undelivered events per subscriber
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to events emitted from now on
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.tx.subscribe()
    }

    /// Publish an event; dropped when nobody listens
    pub fn emit(&self, event: NodeEvent) {
        let _ = self.tx.send(event);
    }

    /// Publish a state change
    pub fn state_changed(&self, remote: &DeviceId, state: ConnectionState) {
        self.emit(NodeEvent::ConnectionStateChanged {
            remote: remote.clone(),
            state,
        });
    }

    /// Publish an error
    pub fn error(
        &self,
        remote: Option<&DeviceId>,
        category: ErrorCategory,
        message: impl Into<String>,
    ) {
        let message = message.into();
        tracing::debug!("Error event ({}): {}", category, message);
        self.emit(NodeEvent::Error {
            remote: remote.cloned(),
            category,
            message,
        });
    }
}
