//! Connection manager: one peer connection per remote device.
//!
//! Drives the offer/answer/candidate exchange over the relay, opens the
//! channel, and starts a transfer engine on it. All state changes are
//! published on the [`EventBus`].

use super::channel::{accept_verified, dial};
use super::negotiation::{self, Candidate, SessionDescription};
use super::peer::{PeerConnection, Role};
use super::state::{ConnectionState, StateUpdate};
use crate::error::ConnectionError;
use crate::event::EventBus;
use crate::transfer::{TransferConfig, TransferEngine};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use lanshare_discovery::{DeviceId, NegotiationMessage, RelayClient, RelayError, SignalKind};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, watch};
use tokio::time;

/// Outbound path for negotiation messages
pub trait Signaler: Send + Sync + 'static {
    /// Forward a message to its target device
    ///
    /// # Errors
    ///
    /// Returns error if the message cannot be handed to the relay.
    fn send_signal(&self, message: NegotiationMessage) -> Result<(), RelayError>;
}

impl Signaler for RelayClient {
    fn send_signal(&self, message: NegotiationMessage) -> Result<(), RelayError> {
        RelayClient::send_signal(self, message)
    }
}

/// Connection configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Deadline from offer to open channel
    pub negotiation_timeout: Duration,
    /// Per-candidate connect and greeting deadline
    pub dial_timeout: Duration,
    /// How long an accepted stream may take to greet
    pub greeting_timeout: Duration,
    /// Address the answering side listens on
    pub listen_ip: IpAddr,
    /// Incoming message queue depth per channel
    pub channel_buffer: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            negotiation_timeout: Duration::from_secs(30),
            dial_timeout: Duration::from_secs(5),
            greeting_timeout: Duration::from_secs(5),
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            channel_buffer: 64,
        }
    }
}

type SharedPeer = Arc<Mutex<PeerConnection>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EngineExit {
    /// Drop in-flight sessions now
    Abort,
    /// Let the receive loop consume what already arrived
    Drain,
}

struct Inner {
    local_id: DeviceId,
    local_name: String,
    config: ConnectionConfig,
    transfer: TransferConfig,
    signaler: Arc<dyn Signaler>,
    events: EventBus,
    peers: DashMap<DeviceId, SharedPeer>,
}

/// Connection manager
///
/// At most one connection exists per remote device. Cloning shares the
/// same set of connections.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Create a manager for the local device
    #[must_use]
    pub fn new(
        local_id: DeviceId,
        local_name: impl Into<String>,
        signaler: Arc<dyn Signaler>,
        events: EventBus,
        config: ConnectionConfig,
        transfer: TransferConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                local_id,
                local_name: local_name.into(),
                config,
                transfer,
                signaler,
                events,
                peers: DashMap::new(),
            }),
        }
    }

    /// Local device id
    #[must_use]
    pub fn local_id(&self) -> &DeviceId {
        &self.inner.local_id
    }

    /// Event bus shared with the engines
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Number of tracked connections
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.inner.peers.len()
    }

    fn peer(&self, remote: &DeviceId) -> Option<SharedPeer> {
        self.inner.peers.get(remote).map(|entry| entry.value().clone())
    }

    /// State of the connection to `remote`
    ///
    /// `Idle` when no connection attempt is tracked.
    pub async fn connection_state(&self, remote: &DeviceId) -> ConnectionState {
        match self.peer(remote) {
            Some(peer) => peer.lock().await.state(),
            None => ConnectionState::Idle,
        }
    }

    /// Snapshot of all tracked connections
    pub async fn connections(&self) -> Vec<(DeviceId, ConnectionState)> {
        let peers: Vec<(DeviceId, SharedPeer)> = self
            .inner
            .peers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut out = Vec::with_capacity(peers.len());
        for (id, peer) in peers {
            out.push((id, peer.lock().await.state()));
        }
        out
    }

    /// Start connecting to `remote`
    ///
    /// Idempotent: with a connection already negotiating or open, returns
    /// its state and sends nothing.
    ///
    /// # Errors
    ///
    /// Returns error if `remote` is the local device or the offer cannot be
    /// handed to the relay.
    pub async fn initiate(&self, remote: &DeviceId) -> Result<ConnectionState, ConnectionError> {
        self.start(remote).await.map(|(state, _)| state)
    }

    /// Connect to `remote` and wait for the channel
    ///
    /// # Errors
    ///
    /// Returns the error that ended the attempt: `TargetNotFound`,
    /// `NegotiationTimeout`, `NegotiationFailed` or `Closed`.
    pub async fn connect(&self, remote: &DeviceId) -> Result<(), ConnectionError> {
        let (_, updates) = self.start(remote).await?;
        self.follow(remote, updates).await
    }

    /// Wait until the connection to `remote` is open
    ///
    /// Follows a connection that is replaced mid-negotiation (offer
    /// collision).
    ///
    /// # Errors
    ///
    /// Returns `NotConnected` without a connection, or the error that ended
    /// the attempt.
    pub async fn wait_open(&self, remote: &DeviceId) -> Result<(), ConnectionError> {
        let peer = self
            .peer(remote)
            .ok_or_else(|| ConnectionError::NotConnected(remote.clone()))?;
        let updates = peer.lock().await.subscribe();
        drop(peer);
        self.follow(remote, updates).await
    }

    async fn follow(
        &self,
        remote: &DeviceId,
        mut updates: watch::Receiver<StateUpdate>,
    ) -> Result<(), ConnectionError> {
        loop {
            if let Some(result) = settled(&updates.borrow_and_update()) {
                return result;
            }
            if updates.changed().await.is_ok() {
                continue;
            }

            // Connection dropped without a final state: it was replaced
            if let Some(result) = settled(&updates.borrow()) {
                return result;
            }
            let peer = self
                .peer(remote)
                .ok_or_else(|| ConnectionError::NotConnected(remote.clone()))?;
            updates = peer.lock().await.subscribe();
        }
    }

    async fn start(
        &self,
        remote: &DeviceId,
    ) -> Result<(ConnectionState, watch::Receiver<StateUpdate>), ConnectionError> {
        if *remote == self.inner.local_id {
            return Err(ConnectionError::negotiation("cannot connect to self"));
        }

        loop {
            if let Some(existing) = self.peer(remote) {
                let guard = existing.lock().await;
                if guard.state().is_active() {
                    tracing::debug!(
                        "Connection to {} already {}",
                        remote.short(),
                        guard.state()
                    );
                    return Ok((guard.state(), guard.subscribe()));
                }
                drop(guard);
                self.inner
                    .peers
                    .remove_if(remote, |_, p| Arc::ptr_eq(p, &existing));
            }

            let offer = SessionDescription {
                session_id: negotiation::new_session_id(),
                device_name: self.inner.local_name.clone(),
            };
            let mut peer = PeerConnection::new_offerer(
                remote.clone(),
                offer,
                self.inner.config.channel_buffer,
            );
            peer.transition_to(ConnectionState::Negotiating)?;
            let peer = Arc::new(Mutex::new(peer));

            let inserted = match self.inner.peers.entry(remote.clone()) {
                Entry::Occupied(_) => false,
                Entry::Vacant(slot) => {
                    slot.insert(peer.clone());
                    true
                }
            };
            if inserted {
                return self.send_offer(remote, &peer).await;
            }
            // Lost a race with another attempt; look again
        }
    }

    async fn send_offer(
        &self,
        remote: &DeviceId,
        peer: &SharedPeer,
    ) -> Result<(ConnectionState, watch::Receiver<StateUpdate>), ConnectionError> {
        let guard = peer.lock().await;
        let session_id = guard.session_id().to_string();
        let updates = guard.subscribe();
        self.inner
            .events
            .state_changed(remote, ConnectionState::Negotiating);
        tracing::info!("Offering connection to {}", remote.short());

        let sent = negotiation::encode(guard.local_description())
            .and_then(|payload| self.signal(remote, SignalKind::Offer, payload));
        if sent.is_ok() {
            self.spawn_supervisor(&guard);
        }
        drop(guard);

        match sent {
            Ok(()) => Ok((ConnectionState::Negotiating, updates)),
            Err(ConnectionError::Relay(RelayError::TargetNotFound(_))) => {
                tracing::info!("Relay has no device {} for offer", remote.short());
                let error = ConnectionError::TargetNotFound(remote.clone());
                self.retire(
                    remote,
                    peer,
                    Some(&session_id),
                    ConnectionState::Idle,
                    Some(error.clone()),
                    EngineExit::Abort,
                )
                .await;
                Err(error)
            }
            Err(e) => {
                self.fail(remote, &session_id, e.clone()).await;
                Err(e)
            }
        }
    }

    fn signal(
        &self,
        remote: &DeviceId,
        kind: SignalKind,
        payload: Vec<u8>,
    ) -> Result<(), ConnectionError> {
        tracing::trace!("Signal {} to {}", kind, remote.short());
        let message =
            NegotiationMessage::new(kind, payload, self.inner.local_id.clone(), remote.clone());
        self.inner
            .signaler
            .send_signal(message)
            .map_err(ConnectionError::from)
    }

    /// Handle a negotiation message forwarded by the relay
    ///
    /// Malformed or unexpected messages are logged and dropped.
    pub async fn handle_signal(&self, message: NegotiationMessage) {
        if message.target_device_id != self.inner.local_id {
            tracing::warn!(
                "Dropping {} addressed to {}",
                message.kind,
                message.target_device_id.short()
            );
            return;
        }

        let remote = message.source_device_id;
        let result = match message.kind {
            SignalKind::Offer => self.on_offer(&remote, &message.payload).await,
            SignalKind::Answer => self.on_answer(&remote, &message.payload).await,
            SignalKind::Candidate => self.on_candidate(&remote, &message.payload).await,
        };

        if let Err(e) = result {
            tracing::warn!("Dropping {} from {}: {}", message.kind, remote.short(), e);
        }
    }

    async fn on_offer(&self, remote: &DeviceId, payload: &[u8]) -> Result<(), ConnectionError> {
        let offer: SessionDescription = negotiation::decode(payload)?;

        if let Some(existing) = self.peer(remote) {
            let guard = existing.lock().await;
            if guard.session_id() == offer.session_id {
                tracing::debug!("Duplicate offer from {}", remote.short());
                return Ok(());
            }
            if guard.role() == Role::Offerer
                && guard.state().is_pending()
                && self.inner.local_id < *remote
            {
                tracing::debug!("Offer collision with {}: keeping ours", remote.short());
                return Ok(());
            }
        }

        let bind = SocketAddr::new(self.inner.config.listen_ip, 0);
        let listener = TcpListener::bind(bind)
            .await
            .map_err(|e| ConnectionError::NegotiationFailed(format!("listen failed: {e}").into()))?;
        let bound = listener
            .local_addr()
            .map_err(|e| ConnectionError::NegotiationFailed(format!("listen failed: {e}").into()))?;

        let mut peer = PeerConnection::new_answerer(
            remote.clone(),
            offer,
            &self.inner.local_name,
            self.inner.config.channel_buffer,
        );
        let session_id = peer.session_id().to_string();
        peer.transition_to(ConnectionState::Negotiating)?;
        self.spawn_accept(&mut peer, listener);

        let peer = Arc::new(Mutex::new(peer));
        if let Some(previous) = self.inner.peers.insert(remote.clone(), peer.clone()) {
            self.replace(remote, &previous).await;
        }

        let mut guard = peer.lock().await;
        self.inner
            .events
            .state_changed(remote, ConnectionState::Negotiating);
        tracing::info!("Answering connection from {}", remote.short());

        let answered = self
            .send_answer(remote, &guard, bound)
            .and_then(|()| guard.transition_to(ConnectionState::ChannelOpening));

        match answered {
            Ok(()) => {
                self.inner
                    .events
                    .state_changed(remote, ConnectionState::ChannelOpening);
                self.spawn_supervisor(&guard);
                Ok(())
            }
            Err(e) => {
                drop(guard);
                self.fail(remote, &session_id, e.clone()).await;
                Err(e)
            }
        }
    }

    fn send_answer(
        &self,
        remote: &DeviceId,
        peer: &PeerConnection,
        bound: SocketAddr,
    ) -> Result<(), ConnectionError> {
        let answer = negotiation::encode(peer.local_description())?;
        self.signal(remote, SignalKind::Answer, answer)?;

        for candidate in negotiation::gather_candidates(bound, peer.session_id()) {
            tracing::debug!("Candidate {} for {}", candidate.addr, remote.short());
            self.signal(remote, SignalKind::Candidate, negotiation::encode(&candidate)?)?;
        }
        Ok(())
    }

    async fn on_answer(&self, remote: &DeviceId, payload: &[u8]) -> Result<(), ConnectionError> {
        let answer: SessionDescription = negotiation::decode(payload)?;
        let peer = self
            .peer(remote)
            .ok_or(ConnectionError::negotiation("answer without offer"))?;

        let mut guard = peer.lock().await;
        if guard.role() != Role::Offerer || guard.state() != ConnectionState::Negotiating {
            return Err(ConnectionError::negotiation("unexpected answer"));
        }

        guard.set_remote_description(answer)?;
        guard.transition_to(ConnectionState::ChannelOpening)?;
        self.inner
            .events
            .state_changed(remote, ConnectionState::ChannelOpening);

        for addr in guard.take_pending_candidates() {
            self.spawn_dial(&mut guard, addr);
        }
        Ok(())
    }

    async fn on_candidate(&self, remote: &DeviceId, payload: &[u8]) -> Result<(), ConnectionError> {
        let candidate: Candidate = negotiation::decode(payload)?;
        let peer = self
            .peer(remote)
            .ok_or(ConnectionError::negotiation("candidate without connection"))?;

        let mut guard = peer.lock().await;
        if guard.session_id() != candidate.session_id {
            return Err(ConnectionError::negotiation("candidate for another session"));
        }
        if !guard.state().is_pending() {
            tracing::trace!("Late candidate {} from {}", candidate.addr, remote.short());
            return Ok(());
        }

        if guard.add_candidate(candidate.addr) {
            self.spawn_dial(&mut guard, candidate.addr);
        }
        Ok(())
    }

    fn spawn_dial(&self, peer: &mut PeerConnection, addr: SocketAddr) {
        let channel = peer.channel().clone();
        let session_id = peer.session_id().to_string();
        let timeout = self.inner.config.dial_timeout;

        peer.push_task(tokio::spawn(async move {
            match dial(addr, &session_id, timeout).await {
                Ok(stream) => {
                    if channel.attach(stream).await {
                        tracing::debug!("Channel established via {}", addr);
                    }
                }
                Err(e) => tracing::debug!("Candidate {} failed: {}", addr, e),
            }
        }));
    }

    fn spawn_accept(&self, peer: &mut PeerConnection, listener: TcpListener) {
        let channel = peer.channel().clone();
        let session_id = peer.session_id().to_string();
        let timeout = self.inner.config.greeting_timeout;

        peer.push_task(tokio::spawn(async move {
            match accept_verified(&listener, &session_id, timeout).await {
                Ok(stream) => {
                    channel.attach(stream).await;
                }
                Err(e) => tracing::warn!("Channel listener failed: {}", e),
            }
        }));
    }

    /// Watch one negotiation through to open and then to close
    fn spawn_supervisor(&self, peer: &PeerConnection) {
        let manager: Weak<Inner> = Arc::downgrade(&self.inner);
        let channel = peer.channel().clone();
        let remote = peer.remote().clone();
        let session_id = peer.session_id().to_string();
        let timeout = self.inner.config.negotiation_timeout;

        tokio::spawn(async move {
            let opened = time::timeout(timeout, channel.wait_open()).await;
            let Some(inner) = manager.upgrade() else {
                return;
            };
            let this = ConnectionManager { inner };

            match opened {
                Ok(Ok(())) => this.on_channel_open(&remote, &session_id).await,
                Ok(Err(_)) => {
                    let err = ConnectionError::negotiation("channel closed before open");
                    this.fail(&remote, &session_id, err).await;
                    return;
                }
                Err(_) => {
                    this.fail(&remote, &session_id, ConnectionError::NegotiationTimeout)
                        .await;
                    return;
                }
            }
            drop(this);

            channel.wait_closed().await;
            if let Some(inner) = manager.upgrade() {
                ConnectionManager { inner }
                    .on_channel_closed(&remote, &session_id)
                    .await;
            }
        });
    }

    async fn on_channel_open(&self, remote: &DeviceId, session_id: &str) {
        let Some(peer) = self.peer(remote) else {
            return;
        };
        let mut guard = peer.lock().await;
        if guard.session_id() != session_id {
            return;
        }
        if let Err(e) = guard.transition_to(ConnectionState::Open) {
            tracing::debug!("Channel to {} opened late: {}", remote.short(), e);
            return;
        }

        guard.abort_tasks();
        self.inner.events.state_changed(remote, ConnectionState::Open);

        if let Some(incoming) = guard.take_incoming() {
            let engine = TransferEngine::spawn(
                remote.clone(),
                guard.channel().clone(),
                incoming,
                self.inner.transfer.clone(),
                self.inner.events.clone(),
            );
            guard.set_engine(Arc::new(engine));
        }

        tracing::info!(
            "Channel to {} open after {} ms",
            remote.short(),
            guard.age().as_millis()
        );
    }

    async fn on_channel_closed(&self, remote: &DeviceId, session_id: &str) {
        let Some(peer) = self.peer(remote) else {
            return;
        };
        if self
            .retire(
                remote,
                &peer,
                Some(session_id),
                ConnectionState::Closed,
                None,
                EngineExit::Drain,
            )
            .await
        {
            tracing::info!("Connection to {} closed by remote", remote.short());
        }
    }

    async fn fail(&self, remote: &DeviceId, session_id: &str, err: ConnectionError) {
        let Some(peer) = self.peer(remote) else {
            return;
        };
        let message = err.to_string();
        if self
            .retire(
                remote,
                &peer,
                Some(session_id),
                ConnectionState::Failed,
                Some(err),
                EngineExit::Abort,
            )
            .await
        {
            tracing::warn!("Connection to {} failed: {}", remote.short(), message);
        }
    }

    /// Handle the relay reporting `target` unknown
    ///
    /// A pending connection to `target` returns to `Idle` and an error
    /// event is published.
    pub async fn handle_target_not_found(&self, target: &DeviceId, kind: SignalKind) {
        tracing::info!("Relay has no device {} for {}", target.short(), kind);
        let Some(peer) = self.peer(target) else {
            return;
        };
        self.retire(
            target,
            &peer,
            None,
            ConnectionState::Idle,
            Some(ConnectionError::TargetNotFound(target.clone())),
            EngineExit::Abort,
        )
        .await;
    }

    /// Transfer engine of the open connection to `remote`
    ///
    /// # Errors
    ///
    /// `NotConnected` without a connection, `ChannelNotReady` while
    /// negotiating, `Closed` otherwise.
    pub async fn engine(&self, remote: &DeviceId) -> Result<Arc<TransferEngine>, ConnectionError> {
        let peer = self
            .peer(remote)
            .ok_or_else(|| ConnectionError::NotConnected(remote.clone()))?;
        let guard = peer.lock().await;

        match guard.state() {
            ConnectionState::Open => guard.engine().ok_or(ConnectionError::ChannelNotReady),
            state if state.is_pending() => Err(ConnectionError::ChannelNotReady),
            _ => Err(ConnectionError::Closed),
        }
    }

    /// Close the connection to `remote`
    ///
    /// Aborts in-flight transfers on it. Returns false if there was nothing
    /// to close.
    pub async fn close(&self, remote: &DeviceId) -> bool {
        let Some(peer) = self.peer(remote) else {
            return false;
        };
        let closed = self
            .retire(
                remote,
                &peer,
                None,
                ConnectionState::Closed,
                None,
                EngineExit::Abort,
            )
            .await;
        if closed {
            tracing::info!("Closed connection to {}", remote.short());
        }
        closed
    }

    /// Close every connection
    pub async fn close_all(&self) {
        let remotes: Vec<DeviceId> = self.inner.peers.iter().map(|e| e.key().clone()).collect();
        for remote in remotes {
            self.close(&remote).await;
        }
    }

    /// Move `peer` to a final state, publish it, and drop it
    ///
    /// Returns false if `peer` belongs to another session or cannot make
    /// the transition.
    async fn retire(
        &self,
        remote: &DeviceId,
        peer: &SharedPeer,
        session_id: Option<&str>,
        to: ConnectionState,
        error: Option<ConnectionError>,
        exit: EngineExit,
    ) -> bool {
        let (engine, channel) = {
            let mut guard = peer.lock().await;
            if session_id.is_some_and(|id| id != guard.session_id()) {
                return false;
            }

            let moved = match &error {
                Some(err) => guard.transition_with_error(to, err.clone()),
                None => guard.transition_to(to),
            };
            if moved.is_err() {
                return false;
            }

            self.inner.events.state_changed(remote, to);
            if let Some(err) = &error {
                self.inner
                    .events
                    .error(Some(remote), err.category(), err.to_string());
            }
            (guard.teardown(), guard.channel().clone())
        };

        self.inner
            .peers
            .remove_if(remote, |_, p| Arc::ptr_eq(p, peer));

        if let Some(engine) = engine {
            match exit {
                EngineExit::Abort => engine.shutdown().await,
                EngineExit::Drain => engine.drain().await,
            }
        }
        channel.close().await;
        true
    }

    /// Retire a connection superseded by a new offer
    ///
    /// An open connection is closed; one still negotiating (offer
    /// collision) is dropped quietly and its waiters follow the new one.
    async fn replace(&self, remote: &DeviceId, previous: &SharedPeer) {
        let state = previous.lock().await.state();
        if state == ConnectionState::Open {
            tracing::info!("New offer from {}; replacing open connection", remote.short());
            self.retire(
                remote,
                previous,
                None,
                ConnectionState::Closed,
                None,
                EngineExit::Abort,
            )
            .await;
        } else {
            tracing::debug!("Offer from {} supersedes pending connection", remote.short());
            self.discard(remote, previous).await;
        }
    }

    /// Drop `peer` without publishing a state change
    async fn discard(&self, remote: &DeviceId, peer: &SharedPeer) {
        self.inner
            .peers
            .remove_if(remote, |_, p| Arc::ptr_eq(p, peer));

        let (engine, channel) = {
            let mut guard = peer.lock().await;
            (guard.teardown(), guard.channel().clone())
        };
        if let Some(engine) = engine {
            engine.shutdown().await;
        }
        channel.close().await;
    }
}

fn settled(update: &StateUpdate) -> Option<Result<(), ConnectionError>> {
    match update.state {
        ConnectionState::Open => Some(Ok(())),
        ConnectionState::Negotiating | ConnectionState::ChannelOpening => None,
        ConnectionState::Idle | ConnectionState::Failed | ConnectionState::Closed => {
            Some(Err(update.error.clone().unwrap_or(ConnectionError::Closed)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::NodeEvent;
    use bytes::Bytes;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::{broadcast, mpsc};

    /// In-process stand-in for the relay: routes by target id
    #[derive(Default)]
    struct LoopbackRelay {
        routes: StdMutex<HashMap<DeviceId, mpsc::UnboundedSender<NegotiationMessage>>>,
        sent: StdMutex<Vec<SignalKind>>,
    }

    impl Signaler for LoopbackRelay {
        fn send_signal(&self, message: NegotiationMessage) -> Result<(), RelayError> {
            self.sent.lock().unwrap().push(message.kind);
            let routes = self.routes.lock().unwrap();
            match routes.get(&message.target_device_id) {
                Some(tx) => tx.send(message).map_err(|_| RelayError::Closed),
                None => Err(RelayError::TargetNotFound(message.target_device_id.clone())),
            }
        }
    }

    fn test_config() -> ConnectionConfig {
        ConnectionConfig {
            negotiation_timeout: Duration::from_secs(5),
            listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..ConnectionConfig::default()
        }
    }

    fn manager(
        relay: &Arc<LoopbackRelay>,
        id: &str,
        config: ConnectionConfig,
    ) -> ConnectionManager {
        let (tx, mut rx) = mpsc::unbounded_channel();
        relay.routes.lock().unwrap().insert(DeviceId::from(id), tx);

        let manager = ConnectionManager::new(
            DeviceId::from(id),
            id,
            relay.clone(),
            EventBus::default(),
            config,
            TransferConfig::default(),
        );
        let pump = manager.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                pump.handle_signal(message).await;
            }
        });
        manager
    }

    async fn next_event(rx: &mut broadcast::Receiver<NodeEvent>) -> NodeEvent {
        time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event timeout")
            .expect("event bus closed")
    }

    async fn wait_for_state(
        manager: &ConnectionManager,
        remote: &DeviceId,
        state: ConnectionState,
    ) {
        time::timeout(Duration::from_secs(5), async {
            while manager.connection_state(remote).await != state {
                time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("state timeout");
    }

    #[tokio::test]
    async fn test_connect_opens_both_sides() {
        let relay = Arc::new(LoopbackRelay::default());
        let a = manager(&relay, "a", test_config());
        let b = manager(&relay, "b", test_config());
        let mut a_events = a.events().subscribe();

        a.connect(&DeviceId::from("b")).await.unwrap();
        wait_for_state(&b, &DeviceId::from("a"), ConnectionState::Open).await;

        let mut seen = Vec::new();
        while seen.last() != Some(&ConnectionState::Open) {
            if let NodeEvent::ConnectionStateChanged { state, .. } =
                next_event(&mut a_events).await
            {
                seen.push(state);
            }
        }
        assert_eq!(
            seen,
            vec![
                ConnectionState::Negotiating,
                ConnectionState::ChannelOpening,
                ConnectionState::Open
            ]
        );
    }

    #[tokio::test]
    async fn test_initiate_is_idempotent() {
        let relay = Arc::new(LoopbackRelay::default());
        let a = manager(&relay, "a", test_config());
        let _b = manager(&relay, "b", test_config());
        let b_id = DeviceId::from("b");

        a.connect(&b_id).await.unwrap();
        let offers_before = count(&relay, SignalKind::Offer);

        assert_eq!(a.initiate(&b_id).await.unwrap(), ConnectionState::Open);
        assert_eq!(count(&relay, SignalKind::Offer), offers_before);
        assert_eq!(a.connection_count(), 1);
    }

    fn count(relay: &LoopbackRelay, kind: SignalKind) -> usize {
        relay.sent.lock().unwrap().iter().filter(|k| **k == kind).count()
    }

    #[tokio::test]
    async fn test_initiate_self_rejected() {
        let relay = Arc::new(LoopbackRelay::default());
        let a = manager(&relay, "a", test_config());
        assert!(a.initiate(&DeviceId::from("a")).await.is_err());
        assert_eq!(a.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_target_rejected_by_relay_stays_idle() {
        let relay = Arc::new(LoopbackRelay::default());
        let a = manager(&relay, "a", test_config());
        let ghost = DeviceId::from("ghost");
        let mut events = a.events().subscribe();

        let err = a.connect(&ghost).await.unwrap_err();
        assert_eq!(err, ConnectionError::TargetNotFound(ghost.clone()));
        assert_eq!(a.connection_state(&ghost).await, ConnectionState::Idle);
        assert_eq!(a.connection_count(), 0);

        let mut states = Vec::new();
        let mut categories = Vec::new();
        while let Ok(event) = events.try_recv() {
            match event {
                NodeEvent::ConnectionStateChanged { state, .. } => states.push(state),
                NodeEvent::Error { category, .. } => categories.push(category),
                _ => {}
            }
        }
        assert_eq!(states, vec![ConnectionState::Negotiating, ConnectionState::Idle]);
        assert_eq!(categories, vec![crate::error::ErrorCategory::TargetNotFound]);
    }

    #[tokio::test]
    async fn test_target_not_found_returns_to_idle() {
        let relay = Arc::new(LoopbackRelay::default());
        let a = manager(&relay, "a", test_config());
        // Route exists but nobody answers
        let (tx, _rx) = mpsc::unbounded_channel();
        relay.routes.lock().unwrap().insert(DeviceId::from("late"), tx);
        let late = DeviceId::from("late");
        let mut events = a.events().subscribe();

        a.initiate(&late).await.unwrap();
        let (waited, ()) = tokio::join!(a.wait_open(&late), async {
            time::sleep(Duration::from_millis(50)).await;
            a.handle_target_not_found(&late, SignalKind::Offer).await;
        });

        assert_eq!(waited, Err(ConnectionError::TargetNotFound(late.clone())));
        assert_eq!(a.connection_state(&late).await, ConnectionState::Idle);

        let mut idle = false;
        let mut error = false;
        while !(idle && error) {
            match next_event(&mut events).await {
                NodeEvent::ConnectionStateChanged { state, .. } => {
                    idle |= state == ConnectionState::Idle;
                }
                NodeEvent::Error { category, .. } => {
                    error |= category == crate::error::ErrorCategory::TargetNotFound;
                }
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn test_negotiation_timeout() {
        let relay = Arc::new(LoopbackRelay::default());
        let config = ConnectionConfig {
            negotiation_timeout: Duration::from_millis(100),
            ..test_config()
        };
        let a = manager(&relay, "a", config);
        let (tx, _rx) = mpsc::unbounded_channel();
        relay.routes.lock().unwrap().insert(DeviceId::from("mute"), tx);

        let err = a.connect(&DeviceId::from("mute")).await.unwrap_err();
        assert_eq!(err, ConnectionError::NegotiationTimeout);
        assert_eq!(a.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_simultaneous_offers_converge() {
        let relay = Arc::new(LoopbackRelay::default());
        let a = manager(&relay, "a", test_config());
        let b = manager(&relay, "b", test_config());

        let id_b = DeviceId::from("b");
        let id_a = DeviceId::from("a");
        let (ra, rb) = tokio::join!(a.connect(&id_b), b.connect(&id_a));
        ra.unwrap();
        rb.unwrap();

        assert_eq!(a.connection_count(), 1);
        assert_eq!(b.connection_count(), 1);
        assert_eq!(a.connection_state(&DeviceId::from("b")).await, ConnectionState::Open);
        assert_eq!(b.connection_state(&DeviceId::from("a")).await, ConnectionState::Open);
    }

    #[tokio::test]
    async fn test_send_before_open_not_ready() {
        let relay = Arc::new(LoopbackRelay::default());
        let a = manager(&relay, "a", test_config());
        let (tx, _rx) = mpsc::unbounded_channel();
        relay.routes.lock().unwrap().insert(DeviceId::from("slow"), tx);

        let slow = DeviceId::from("slow");
        assert!(matches!(
            a.engine(&slow).await,
            Err(ConnectionError::NotConnected(_))
        ));
        a.initiate(&slow).await.unwrap();
        assert!(matches!(
            a.engine(&slow).await,
            Err(ConnectionError::ChannelNotReady)
        ));
    }

    #[tokio::test]
    async fn test_close_propagates_to_remote() {
        let relay = Arc::new(LoopbackRelay::default());
        let a = manager(&relay, "a", test_config());
        let b = manager(&relay, "b", test_config());
        let a_id = DeviceId::from("a");
        let b_id = DeviceId::from("b");

        a.connect(&b_id).await.unwrap();
        wait_for_state(&b, &a_id, ConnectionState::Open).await;

        assert!(a.close(&b_id).await);
        assert!(!a.close(&b_id).await);
        assert_eq!(a.connection_state(&b_id).await, ConnectionState::Idle);
        wait_for_state(&b, &a_id, ConnectionState::Idle).await;
        assert_eq!(b.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_file_delivered_over_connection() {
        let relay = Arc::new(LoopbackRelay::default());
        let a = manager(&relay, "a", test_config());
        let b = manager(&relay, "b", test_config());
        let mut b_events = b.events().subscribe();
        let b_id = DeviceId::from("b");

        a.connect(&b_id).await.unwrap();
        wait_for_state(&b, &DeviceId::from("a"), ConnectionState::Open).await;

        let engine = a.engine(&b_id).await.unwrap();
        engine
            .send_bytes("hello.txt", Bytes::from_static(b"hello"), None)
            .await
            .unwrap();

        loop {
            if let NodeEvent::FileReceived(file) = next_event(&mut b_events).await {
                assert_eq!(file.name, "hello.txt");
                assert_eq!(&file.data[..], b"hello");
                assert_eq!(file.from, DeviceId::from("a"));
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_malformed_signal_ignored() {
        let relay = Arc::new(LoopbackRelay::default());
        let a = manager(&relay, "a", test_config());

        a.handle_signal(NegotiationMessage::new(
            SignalKind::Offer,
            b"not json".to_vec(),
            DeviceId::from("x"),
            DeviceId::from("a"),
        ))
        .await;
        a.handle_signal(NegotiationMessage::new(
            SignalKind::Answer,
            b"{}".to_vec(),
            DeviceId::from("x"),
            DeviceId::from("a"),
        ))
        .await;

        assert_eq!(a.connection_count(), 0);
    }
}
