//! Direct device-to-device connections.
//!
//! A connection is negotiated through the relay and then carried on a TCP
//! channel that bypasses it:
//!
//! ```text
//! offerer                    relay                    answerer
//!   │ offer{sessionId} ──────► │ ──────────────────────► │ listen
//!   │ ◄────────────────────── │ ◄────────────── answer │
//!   │ ◄────────────────────── │ ◄────────── candidate* │
//!   │ dial candidate, Hello(sessionId) ─────────────────► │
//!   │ ◄───────────────────────────────────────── HelloAck │
//!   │                     channel open                    │
//! ```
//!
//! [`ConnectionManager`] keeps at most one [`PeerConnection`] per remote
//! device and publishes every [`ConnectionState`] change.

pub mod channel;
pub mod frame;
pub mod manager;
pub mod negotiation;
pub mod peer;
pub mod state;

pub use channel::{Channel, ChannelMessage, ChannelReceiver, ChannelState};
pub use frame::{Frame, FrameTag, MAX_FRAME_PAYLOAD};
pub use manager::{ConnectionConfig, ConnectionManager, Signaler};
pub use negotiation::{Candidate, SessionDescription};
pub use peer::{PeerConnection, Role};
pub use state::{ConnectionState, StateUpdate};
