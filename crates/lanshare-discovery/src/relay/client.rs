//! Relay client implementation for connecting to relay servers.

use super::protocol::{ClientMessage, NegotiationMessage, RelayError, ServerMessage, SignalKind};
use crate::registry::{DeviceId, DeviceSummary};
use crate::wire;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time;

/// Relay client state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayClientState {
    /// Disconnected from relay
    Disconnected,
    /// Connected, not yet registered
    Connecting,
    /// Registration in flight
    Registering,
    /// Connected and registered
    Connected,
    /// Error state
    Error,
}

/// Event received from the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// Device list changed (or was requested)
    DevicesUpdated(Vec<DeviceSummary>),
    /// Negotiation message from another device
    Signal(NegotiationMessage),
    /// A signal we sent could not be delivered
    TargetNotFound {
        /// Unknown destination
        target: DeviceId,
        /// Kind of the undelivered message
        kind: SignalKind,
    },
    /// The relay rejected a request
    Error(RelayError),
    /// The relay connection ended
    Disconnected,
}

/// Successful registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    /// Assigned identifier
    pub device_id: DeviceId,
    /// Display name as stored by the relay
    pub display_name: String,
}

/// Relay client for communicating with relay servers
pub struct RelayClient {
    /// Relay server address
    relay_addr: SocketAddr,
    /// Stream held until registration splits it
    stream: Option<TcpStream>,
    /// Registered identity
    registration: Option<Registration>,
    /// Outbound message queue
    outbound: Option<mpsc::UnboundedSender<ClientMessage>>,
    /// Incoming events, handed out once
    events: Option<mpsc::UnboundedReceiver<RelayEvent>>,
    /// Current client state
    state: watch::Sender<RelayClientState>,
    /// Background I/O tasks
    tasks: Vec<JoinHandle<()>>,
}

impl RelayClient {
    /// Connect to a relay server
    ///
    /// # Errors
    ///
    /// Returns error if the TCP connection fails or times out.
    pub async fn connect(addr: SocketAddr) -> Result<Self, RelayError> {
        let stream = time::timeout(super::RELAY_CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| RelayError::Timeout)??;
        let _ = stream.set_nodelay(true);

        let (state, _) = watch::channel(RelayClientState::Connecting);

        Ok(Self {
            relay_addr: addr,
            stream: Some(stream),
            registration: None,
            outbound: None,
            events: None,
            state,
            tasks: Vec::new(),
        })
    }

    /// Register with the relay server and start background I/O
    ///
    /// # Errors
    ///
    /// Returns error if registration is refused, times out, or the client is
    /// already registered.
    pub async fn register(&mut self, display_name: &str) -> Result<Registration, RelayError> {
        let Some(mut stream) = self.stream.take() else {
            return Err(RelayError::InvalidMessage("already registered".to_string()));
        };

        self.state.send_replace(RelayClientState::Registering);

        let result = time::timeout(
            super::RELAY_CONNECT_TIMEOUT,
            Self::handshake(&mut stream, display_name),
        )
        .await
        .map_err(|_| RelayError::Timeout)
        .and_then(|r| r);

        let registration = match result {
            Ok(registration) => registration,
            Err(e) => {
                self.state.send_replace(RelayClientState::Error);
                return Err(e);
            }
        };

        let (reader, writer) = stream.into_split();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        self.tasks.push(spawn_writer(writer, out_rx));
        self.tasks
            .push(spawn_reader(reader, event_tx, self.state.clone()));

        self.outbound = Some(out_tx);
        self.events = Some(event_rx);
        self.registration = Some(registration.clone());
        self.state.send_replace(RelayClientState::Connected);

        tracing::info!(
            "Registered with relay {} as {} ({})",
            self.relay_addr,
            registration.device_id.short(),
            registration.display_name
        );

        Ok(registration)
    }

    async fn handshake(
        stream: &mut TcpStream,
        display_name: &str,
    ) -> Result<Registration, RelayError> {
        wire::write_message(
            stream,
            &ClientMessage::Register {
                display_name: display_name.to_string(),
            },
        )
        .await?;

        match wire::read_message::<_, ServerMessage>(stream).await? {
            Some(ServerMessage::Registered {
                device_id,
                display_name,
            }) => Ok(Registration {
                device_id,
                display_name,
            }),
            Some(ServerMessage::Error { code, message }) => {
                Err(RelayError::from_code(code, message))
            }
            Some(other) => Err(RelayError::InvalidMessage(format!(
                "expected Registered, got {}",
                other.message_type()
            ))),
            None => Err(RelayError::Closed),
        }
    }

    /// Take the incoming event stream
    ///
    /// Available once, after registration.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<RelayEvent>> {
        self.events.take()
    }

    /// Registered device id
    #[must_use]
    pub fn device_id(&self) -> Option<&DeviceId> {
        self.registration.as_ref().map(|r| &r.device_id)
    }

    /// Registration details
    #[must_use]
    pub fn registration(&self) -> Option<&Registration> {
        self.registration.as_ref()
    }

    /// Get current client state
    #[must_use]
    pub fn state(&self) -> RelayClientState {
        *self.state.borrow()
    }

    /// Watch state changes
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<RelayClientState> {
        self.state.subscribe()
    }

    /// Get relay server address
    #[must_use]
    pub fn relay_addr(&self) -> SocketAddr {
        self.relay_addr
    }

    fn enqueue(&self, msg: ClientMessage) -> Result<(), RelayError> {
        if *self.state.borrow() != RelayClientState::Connected {
            return Err(RelayError::NotRegistered);
        }
        let outbound = self.outbound.as_ref().ok_or(RelayError::NotRegistered)?;
        outbound.send(msg).map_err(|_| RelayError::Closed)
    }

    /// Forward a negotiation message through the relay
    ///
    /// Delivery is best-effort; an unknown target comes back as
    /// [`RelayEvent::TargetNotFound`].
    ///
    /// # Errors
    ///
    /// Returns error if the client is not registered or the connection closed.
    pub fn send_signal(&self, message: NegotiationMessage) -> Result<(), RelayError> {
        self.enqueue(ClientMessage::Signal(message))
    }

    /// Send a heartbeat
    ///
    /// # Errors
    ///
    /// Returns error if the client is not registered or the connection closed.
    pub fn heartbeat(&self) -> Result<(), RelayError> {
        let device_id = self.device_id().cloned().ok_or(RelayError::NotRegistered)?;
        self.enqueue(ClientMessage::Heartbeat { device_id })
    }

    /// Ask the relay for the device list
    ///
    /// The answer arrives as [`RelayEvent::DevicesUpdated`].
    ///
    /// # Errors
    ///
    /// Returns error if the client is not registered or the connection closed.
    pub fn request_devices(&self) -> Result<(), RelayError> {
        self.enqueue(ClientMessage::GetDevices)
    }

    /// Spawn the periodic heartbeat task
    ///
    /// # Errors
    ///
    /// Returns error if the client is not registered.
    pub fn spawn_heartbeat(&self, interval: Duration) -> Result<JoinHandle<()>, RelayError> {
        let device_id = self.device_id().cloned().ok_or(RelayError::NotRegistered)?;
        let outbound = self.outbound.clone().ok_or(RelayError::NotRegistered)?;

        Ok(tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let beat = ClientMessage::Heartbeat {
                    device_id: device_id.clone(),
                };
                if outbound.send(beat).is_err() {
                    break;
                }
            }
        }))
    }

    /// Disconnect from relay server
    ///
    /// # Errors
    ///
    /// Returns error if the client is not connected.
    pub fn disconnect(&self) -> Result<(), RelayError> {
        let result = self.enqueue(ClientMessage::Disconnect);
        self.state.send_replace(RelayClientState::Disconnected);
        result
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn spawn_writer(
    mut writer: tokio::net::tcp::OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<ClientMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let last = matches!(msg, ClientMessage::Disconnect);
            if let Err(e) = wire::write_message(&mut writer, &msg).await {
                tracing::debug!("Relay write failed: {}", e);
                break;
            }
            if last {
                break;
            }
        }
    })
}

fn spawn_reader(
    mut reader: tokio::net::tcp::OwnedReadHalf,
    events: mpsc::UnboundedSender<RelayEvent>,
    state: watch::Sender<RelayClientState>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let msg = match wire::read_message::<_, ServerMessage>(&mut reader).await {
                Ok(Some(msg)) => msg,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("Relay read failed: {}", e);
                    break;
                }
            };

            let event = match msg {
                ServerMessage::DevicesUpdated { devices } => RelayEvent::DevicesUpdated(devices),
                ServerMessage::Signal(signal) => RelayEvent::Signal(signal),
                ServerMessage::TargetNotFound {
                    target_device_id,
                    kind,
                } => RelayEvent::TargetNotFound {
                    target: target_device_id,
                    kind,
                },
                ServerMessage::Error { code, message } => {
                    tracing::warn!("Relay error {:?}: {}", code, message);
                    RelayEvent::Error(RelayError::from_code(code, message))
                }
                ServerMessage::Registered { .. } => {
                    tracing::warn!("Unexpected Registered from relay");
                    continue;
                }
            };

            if events.send(event).is_err() {
                break;
            }
        }

        state.send_replace(RelayClientState::Disconnected);
        let _ = events.send(RelayEvent::Disconnected);
    })
}
