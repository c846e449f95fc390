//! Error types for LANSHARE core.
//!
//! Errors are grouped by layer (channel, connection, transfer) and folded into
//! [`NodeError`] at the node API. Every error maps onto an [`ErrorCategory`],
//! which is what the event stream reports to consumers.
//!
//! # Example
//!
//! ```no_run
//! use lanshare_core::NodeError;
//!
//! fn handle_error(err: NodeError) {
//!     if err.is_transient() {
//!         println!("May retry: {err}");
//!     } else {
//!         println!("Permanent failure ({}): {err}", err.category());
//!     }
//! }
//! ```

use lanshare_discovery::{DeviceId, RegistryError, RelayError};
use std::borrow::Cow;
use std::fmt;
use thiserror::Error;

/// Consumer-facing error category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Device registration was refused
    RegistrationFailure,
    /// The relay could not locate the destination device
    TargetNotFound,
    /// Negotiation did not finish in time
    NegotiationTimeout,
    /// Negotiation was abandoned
    NegotiationFailed,
    /// Operation needed an open channel
    ChannelNotReady,
    /// The remote broke the transfer protocol
    ProtocolViolation,
    /// Transfer ended without completing
    TransferAborted,
    /// Anything else (relay I/O, local file errors)
    Other,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::RegistrationFailure => "RegistrationFailure",
            Self::TargetNotFound => "TargetNotFound",
            Self::NegotiationTimeout => "NegotiationTimeout",
            Self::NegotiationFailed => "NegotiationFailed",
            Self::ChannelNotReady => "ChannelNotReady",
            Self::ProtocolViolation => "ProtocolViolation",
            Self::TransferAborted => "TransferAborted",
            Self::Other => "Other",
        };
        f.write_str(name)
    }
}

/// Channel-level errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// Channel has not opened yet
    #[error("channel not ready")]
    NotReady,

    /// Channel is closing or closed
    #[error("channel closed")]
    Closed,

    /// Frame tag not recognized
    #[error("invalid frame tag: 0x{0:02X}")]
    InvalidFrame(u8),

    /// Frame payload exceeds the limit
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    /// Text frame payload is not UTF-8
    #[error("text frame is not valid UTF-8")]
    InvalidText,

    /// Underlying stream failed
    #[error("channel I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ChannelError {
    fn from(err: std::io::Error) -> Self {
        ChannelError::Io(err.to_string())
    }
}

/// Connection-level errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// Relay reported the target unknown
    #[error("target device {0} not found")]
    TargetNotFound(DeviceId),

    /// Channel did not open within the negotiation timeout
    #[error("negotiation timed out")]
    NegotiationTimeout,

    /// Negotiation was abandoned
    #[error("negotiation failed: {0}")]
    NegotiationFailed(Cow<'static, str>),

    /// Channel required but not open
    #[error("channel not ready")]
    ChannelNotReady,

    /// Connection closed
    #[error("connection closed")]
    Closed,

    /// No connection to this device
    #[error("not connected to {0}")]
    NotConnected(DeviceId),

    /// Relay failure while signaling
    #[error("relay error: {0}")]
    Relay(#[from] RelayError),
}

impl ConnectionError {
    /// Negotiation failure with static context (zero allocation)
    #[must_use]
    pub const fn negotiation(context: &'static str) -> Self {
        ConnectionError::NegotiationFailed(Cow::Borrowed(context))
    }

    /// Category reported on the event stream
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::TargetNotFound(_) => ErrorCategory::TargetNotFound,
            Self::NegotiationTimeout => ErrorCategory::NegotiationTimeout,
            Self::NegotiationFailed(_) => ErrorCategory::NegotiationFailed,
            Self::ChannelNotReady | Self::NotConnected(_) => ErrorCategory::ChannelNotReady,
            Self::Closed => ErrorCategory::TransferAborted,
            Self::Relay(RelayError::TargetNotFound(_)) => ErrorCategory::TargetNotFound,
            Self::Relay(_) => ErrorCategory::Other,
        }
    }
}

/// Transfer-level errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransferError {
    /// The remote broke the chunk protocol
    #[error("protocol violation: {0}")]
    ProtocolViolation(Cow<'static, str>),

    /// Transfer ended before completion
    #[error("transfer aborted: {0}")]
    TransferAborted(Cow<'static, str>),

    /// A send is already active on this channel
    #[error("another transfer is in progress on this channel")]
    TransferInProgress,

    /// Channel not open
    #[error("channel not ready")]
    ChannelNotReady,

    /// Local file error
    #[error("I/O error: {0}")]
    Io(String),
}

impl TransferError {
    /// Protocol violation with static context (zero allocation)
    #[must_use]
    pub const fn violation(context: &'static str) -> Self {
        TransferError::ProtocolViolation(Cow::Borrowed(context))
    }

    /// Aborted transfer with static context (zero allocation)
    #[must_use]
    pub const fn aborted(context: &'static str) -> Self {
        TransferError::TransferAborted(Cow::Borrowed(context))
    }

    /// Category reported on the event stream
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::ProtocolViolation(_) => ErrorCategory::ProtocolViolation,
            Self::TransferAborted(_) => ErrorCategory::TransferAborted,
            Self::ChannelNotReady => ErrorCategory::ChannelNotReady,
            Self::TransferInProgress | Self::Io(_) => ErrorCategory::Other,
        }
    }
}

impl From<ChannelError> for TransferError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::NotReady => TransferError::ChannelNotReady,
            ChannelError::Closed => TransferError::aborted("channel closed"),
            other => TransferError::TransferAborted(Cow::Owned(other.to_string())),
        }
    }
}

impl From<std::io::Error> for TransferError {
    fn from(err: std::io::Error) -> Self {
        TransferError::Io(err.to_string())
    }
}

/// Errors surfaced by the node API
#[derive(Debug, Error, Clone)]
pub enum NodeError {
    /// Relay operation failed
    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    /// Registry operation failed
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Connection operation failed
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Transfer operation failed
    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    /// File I/O error
    #[error("File I/O error: {0}")]
    Io(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),

    /// No device with this id or name
    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    /// Node was shut down
    #[error("Node is shut down")]
    Shutdown,
}

impl NodeError {
    /// Returns true if this error is transient and may succeed on retry
    ///
    /// Transient errors include:
    /// - Negotiation timeouts and relay I/O failures
    /// - Targets that may reappear after a fresh device list
    /// - A send blocked by another active transfer
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            NodeError::Relay(err) => matches!(
                err,
                RelayError::Timeout
                    | RelayError::Io(_)
                    | RelayError::RateLimited
                    | RelayError::TargetNotFound(_)
            ),
            NodeError::Connection(err) => matches!(
                err,
                ConnectionError::NegotiationTimeout
                    | ConnectionError::TargetNotFound(_)
                    | ConnectionError::Relay(RelayError::Timeout | RelayError::RateLimited)
            ),
            NodeError::Transfer(err) => matches!(
                err,
                TransferError::TransferInProgress | TransferError::TransferAborted(_)
            ),
            _ => false,
        }
    }

    /// Returns true if this error is permanent and will not succeed on retry
    ///
    /// Permanent errors include:
    /// - Invalid configuration
    /// - Unknown devices and protocol violations
    /// - A node that was shut down
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        match self {
            NodeError::InvalidConfig(_)
            | NodeError::UnknownDevice(_)
            | NodeError::Shutdown
            | NodeError::Registry(_) => true,
            NodeError::Relay(err) => matches!(
                err,
                RelayError::RegistrationFailure(_) | RelayError::InvalidMessage(_)
            ),
            NodeError::Transfer(err) => matches!(err, TransferError::ProtocolViolation(_)),
            _ => false,
        }
    }

    /// Category reported on the event stream
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            NodeError::Registry(_) | NodeError::Relay(RelayError::RegistrationFailure(_)) => {
                ErrorCategory::RegistrationFailure
            }
            NodeError::Relay(RelayError::TargetNotFound(_)) => ErrorCategory::TargetNotFound,
            NodeError::Connection(err) => err.category(),
            NodeError::Transfer(err) => err.category(),
            _ => ErrorCategory::Other,
        }
    }

    /// Invalid configuration with static context (zero allocation)
    #[must_use]
    pub const fn invalid_config(context: &'static str) -> Self {
        NodeError::InvalidConfig(Cow::Borrowed(context))
    }
}

impl From<std::io::Error> for NodeError {
    fn from(err: std::io::Error) -> Self {
        NodeError::Io(err.to_string())
    }
}

/// Result type for node operations
pub type Result<T> = std::result::Result<T, NodeError>;
