//! Peer connection state machine.

use crate::error::ConnectionError;
use std::fmt;

/// Peer connection state
///
/// ```text
/// Idle ──► Negotiating ──► ChannelOpening ──► Open ──► Closed
///               │                │
///               └───────┬────────┘
///                       ▼
///                    Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No connection attempt
    Idle,
    /// Offer/answer exchange in progress
    Negotiating,
    /// Descriptions set, channel being established
    ChannelOpening,
    /// Channel open, transfers possible
    Open,
    /// Closed after being open (or by explicit close)
    Closed,
    /// Negotiation abandoned
    Failed,
}

impl ConnectionState {
    /// Check if a state transition is valid
    #[must_use]
    pub fn can_transition(self, to: ConnectionState) -> bool {
        use ConnectionState::{ChannelOpening, Closed, Failed, Idle, Negotiating, Open};

        match (self, to) {
            (Idle, Negotiating) => true,
            (Negotiating, ChannelOpening) => true,
            (ChannelOpening, Open) => true,
            (Negotiating | ChannelOpening, Failed) => true,
            (Negotiating | ChannelOpening | Open, Closed) => true,
            // Target vanished before anything opened
            (Negotiating | ChannelOpening, Idle) => true,
            _ => false,
        }
    }

    /// Connection is being set up or is open
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ConnectionState::Negotiating | ConnectionState::ChannelOpening | ConnectionState::Open
        )
    }

    /// Connection is still being negotiated
    #[must_use]
    pub fn is_pending(self) -> bool {
        matches!(
            self,
            ConnectionState::Negotiating | ConnectionState::ChannelOpening
        )
    }

    /// Terminal state
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Negotiating => "negotiating",
            Self::ChannelOpening => "channel-opening",
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// State plus the error that ended the attempt, if any
///
/// Published on a watch channel so `wait_open` can tell a timeout from a
/// vanished target after the connection left the active set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateUpdate {
    /// Current state
    pub state: ConnectionState,
    /// Cause of `Failed`, or of falling back to `Idle`
    pub error: Option<ConnectionError>,
}

impl StateUpdate {
    /// Update without an error
    #[must_use]
    pub fn new(state: ConnectionState) -> Self {
        Self { state, error: None }
    }

    /// Update carrying an error
    #[must_use]
    pub fn with_error(state: ConnectionState, error: ConnectionError) -> Self {
        Self {
            state,
            error: Some(error),
        }
    }
}
