//! One connection attempt to one remote device.

use super::channel::{Channel, ChannelReceiver};
use super::negotiation::SessionDescription;
use super::state::{ConnectionState, StateUpdate};
use crate::error::ConnectionError;
use crate::transfer::TransferEngine;
use lanshare_discovery::DeviceId;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Side of the negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sent the offer; dials candidates
    Offerer,
    /// Answered; listens for the dial
    Answerer,
}

/// Peer connection
///
/// Owns the channel, the transfer engine running on it once open, and the
/// background tasks of the negotiation.
pub struct PeerConnection {
    remote: DeviceId,
    role: Role,
    session_id: String,
    state: ConnectionState,
    channel: Channel,
    incoming: Option<ChannelReceiver>,
    local_description: SessionDescription,
    remote_description: Option<SessionDescription>,
    pending_candidates: Vec<SocketAddr>,
    dialed: HashSet<SocketAddr>,
    updates: watch::Sender<StateUpdate>,
    engine: Option<Arc<TransferEngine>>,
    tasks: Vec<JoinHandle<()>>,
    created_at: Instant,
}

impl PeerConnection {
    /// Create the offering side
    #[must_use]
    pub fn new_offerer(
        remote: DeviceId,
        local_description: SessionDescription,
        buffer: usize,
    ) -> Self {
        Self::new(remote, Role::Offerer, local_description, None, buffer)
    }

    /// Create the answering side from a received offer
    #[must_use]
    pub fn new_answerer(
        remote: DeviceId,
        offer: SessionDescription,
        local_name: &str,
        buffer: usize,
    ) -> Self {
        let answer = SessionDescription {
            session_id: offer.session_id.clone(),
            device_name: local_name.to_string(),
        };
        Self::new(remote, Role::Answerer, answer, Some(offer), buffer)
    }

    fn new(
        remote: DeviceId,
        role: Role,
        local_description: SessionDescription,
        remote_description: Option<SessionDescription>,
        buffer: usize,
    ) -> Self {
        let (channel, incoming) = Channel::new(buffer);
        let (updates, _) = watch::channel(StateUpdate::new(ConnectionState::Idle));

        Self {
            remote,
            role,
            session_id: local_description.session_id.clone(),
            state: ConnectionState::Idle,
            channel,
            incoming: Some(incoming),
            local_description,
            remote_description,
            pending_candidates: Vec::new(),
            dialed: HashSet::new(),
            updates,
            engine: None,
            tasks: Vec::new(),
            created_at: Instant::now(),
        }
    }

    /// Remote device
    #[must_use]
    pub fn remote(&self) -> &DeviceId {
        &self.remote
    }

    /// Negotiation role
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Negotiation session id
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// The channel (open or not)
    #[must_use]
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Our offer or answer
    #[must_use]
    pub fn local_description(&self) -> &SessionDescription {
        &self.local_description
    }

    /// Remote offer or answer, once known
    #[must_use]
    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.remote_description.as_ref()
    }

    /// Time since the attempt started
    #[must_use]
    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    /// Watch state updates
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<StateUpdate> {
        self.updates.subscribe()
    }

    /// Transition to a new state
    ///
    /// # Errors
    ///
    /// Returns `NegotiationFailed` if the transition is not allowed from the
    /// current state.
    pub fn transition_to(&mut self, new_state: ConnectionState) -> Result<(), ConnectionError> {
        self.set_state(new_state, None)
    }

    /// Transition and record the error that caused it
    ///
    /// # Errors
    ///
    /// Returns `NegotiationFailed` if the transition is not allowed from the
    /// current state.
    pub fn transition_with_error(
        &mut self,
        new_state: ConnectionState,
        error: ConnectionError,
    ) -> Result<(), ConnectionError> {
        self.set_state(new_state, Some(error))
    }

    fn set_state(
        &mut self,
        new_state: ConnectionState,
        error: Option<ConnectionError>,
    ) -> Result<(), ConnectionError> {
        if !self.state.can_transition(new_state) {
            return Err(ConnectionError::negotiation("invalid state transition"));
        }

        let old_state = self.state;
        self.state = new_state;

        tracing::debug!(
            "Connection {} state transition: {} -> {}",
            self.remote.short(),
            old_state,
            new_state
        );

        self.updates.send_replace(StateUpdate {
            state: new_state,
            error,
        });
        Ok(())
    }

    /// Record the remote answer
    ///
    /// # Errors
    ///
    /// Returns `NegotiationFailed` if the answer belongs to another session
    /// or one is already set.
    pub fn set_remote_description(
        &mut self,
        answer: SessionDescription,
    ) -> Result<(), ConnectionError> {
        if answer.session_id != self.session_id {
            return Err(ConnectionError::negotiation("answer for another session"));
        }
        if self.remote_description.is_some() {
            return Err(ConnectionError::negotiation("remote description already set"));
        }
        self.remote_description = Some(answer);
        Ok(())
    }

    /// Both descriptions are known
    #[must_use]
    pub fn descriptions_complete(&self) -> bool {
        self.remote_description.is_some()
    }

    /// Remember a candidate
    ///
    /// Returns true if the candidate should be dialed now: it is new, this is
    /// the dialing side, and negotiation has reached `ChannelOpening`.
    pub fn add_candidate(&mut self, addr: SocketAddr) -> bool {
        if self.dialed.contains(&addr) || self.pending_candidates.contains(&addr) {
            return false;
        }

        if self.role == Role::Offerer && self.state == ConnectionState::ChannelOpening {
            self.dialed.insert(addr);
            true
        } else {
            self.pending_candidates.push(addr);
            false
        }
    }

    /// Candidates buffered before the descriptions completed
    pub fn take_pending_candidates(&mut self) -> Vec<SocketAddr> {
        let pending = std::mem::take(&mut self.pending_candidates);
        self.dialed.extend(pending.iter().copied());
        pending
    }

    /// Take the incoming message stream for the transfer engine
    pub fn take_incoming(&mut self) -> Option<ChannelReceiver> {
        self.incoming.take()
    }

    /// Install the transfer engine
    pub fn set_engine(&mut self, engine: Arc<TransferEngine>) {
        self.engine = Some(engine);
    }

    /// Transfer engine, once open
    #[must_use]
    pub fn engine(&self) -> Option<Arc<TransferEngine>> {
        self.engine.clone()
    }

    /// Track a background task
    pub fn push_task(&mut self, task: JoinHandle<()>) {
        self.tasks.retain(|t| !t.is_finished());
        self.tasks.push(task);
    }

    /// Abort outstanding dial and listen tasks
    pub fn abort_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    /// Abort negotiation tasks and hand back the engine for shutdown
    ///
    /// The channel itself is closed by the caller.
    pub fn teardown(&mut self) -> Option<Arc<TransferEngine>> {
        self.abort_tasks();
        self.incoming = None;
        self.engine.take()
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
