//! Relay protocol message definitions.

use crate::registry::{DeviceId, DeviceSummary};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Negotiation message kind
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SignalKind {
    /// Connection offer from the initiator
    Offer,
    /// Answer from the responder
    Answer,
    /// Trickled connectivity candidate
    Candidate,
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Offer => write!(f, "offer"),
            Self::Answer => write!(f, "answer"),
            Self::Candidate => write!(f, "candidate"),
        }
    }
}

/// Negotiation message relayed between two devices
///
/// The relay never looks inside `payload`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NegotiationMessage {
    /// Message kind
    pub kind: SignalKind,
    /// Opaque connection-description blob
    pub payload: Vec<u8>,
    /// Sending device
    pub source_device_id: DeviceId,
    /// Receiving device
    pub target_device_id: DeviceId,
}

impl NegotiationMessage {
    /// Create a new negotiation message
    #[must_use]
    pub fn new(kind: SignalKind, payload: Vec<u8>, source: DeviceId, target: DeviceId) -> Self {
        Self {
            kind,
            payload,
            source_device_id: source,
            target_device_id: target,
        }
    }
}

/// Client to relay messages
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ClientMessage {
    /// Register this connection as a device
    Register {
        /// Name shown to other devices
        display_name: String,
    },
    /// Liveness heartbeat
    Heartbeat {
        /// Registered device id
        device_id: DeviceId,
    },
    /// Ask for the current device list
    GetDevices,
    /// Forward a negotiation message
    Signal(NegotiationMessage),
    /// Graceful disconnect
    Disconnect,
}

/// Relay to client messages
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ServerMessage {
    /// Registration accepted
    Registered {
        /// Assigned identifier
        device_id: DeviceId,
        /// Normalized display name
        display_name: String,
    },
    /// Current device list
    DevicesUpdated {
        /// Every registered device with its status
        devices: Vec<DeviceSummary>,
    },
    /// Negotiation message from another device
    Signal(NegotiationMessage),
    /// A signal could not be delivered
    TargetNotFound {
        /// Unknown destination
        target_device_id: DeviceId,
        /// Kind of the undelivered message
        kind: SignalKind,
    },
    /// Request failed
    Error {
        /// Error code
        code: RelayErrorCode,
        /// Human-readable error message
        message: String,
    },
}

impl ServerMessage {
    /// Get the message type name
    #[must_use]
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::Registered { .. } => "Registered",
            Self::DevicesUpdated { .. } => "DevicesUpdated",
            Self::Signal(_) => "Signal",
            Self::TargetNotFound { .. } => "TargetNotFound",
            Self::Error { .. } => "Error",
        }
    }
}

/// Relay error codes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RelayErrorCode {
    /// Client not registered with relay
    NotRegistered = 1,
    /// Rate limit exceeded
    RateLimited = 2,
    /// Invalid message
    InvalidMessage = 3,
    /// Registration refused
    RegistrationFailure = 4,
}

/// Relay errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// Destination device is not registered
    #[error("target device {0} not found")]
    TargetNotFound(DeviceId),

    /// Client not registered
    #[error("client not registered")]
    NotRegistered,

    /// Registration refused by the relay
    #[error("registration failed: {0}")]
    RegistrationFailure(String),

    /// Rate limited
    #[error("rate limited")]
    RateLimited,

    /// Invalid or unexpected message
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Network I/O error
    #[error("I/O error: {0}")]
    Io(String),

    /// Request timed out
    #[error("relay request timed out")]
    Timeout,

    /// Relay connection closed
    #[error("relay connection closed")]
    Closed,
}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        RelayError::Io(err.to_string())
    }
}

impl RelayError {
    /// Build an error from a relay error response
    #[must_use]
    pub fn from_code(code: RelayErrorCode, message: String) -> Self {
        match code {
            RelayErrorCode::NotRegistered => RelayError::NotRegistered,
            RelayErrorCode::RateLimited => RelayError::RateLimited,
            RelayErrorCode::InvalidMessage => RelayError::InvalidMessage(message),
            RelayErrorCode::RegistrationFailure => RelayError::RegistrationFailure(message),
        }
    }
}
