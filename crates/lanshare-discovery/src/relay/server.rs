//! Relay server: device registration, liveness and signal forwarding.

use super::protocol::{ClientMessage, RelayError, RelayErrorCode, ServerMessage};
use super::router::Relay;
use crate::registry::{DeviceId, MembershipChange, Registry, RegistryConfig, RegistryError};
use crate::wire;
use crate::{EXPIRY_TIMEOUT, ONLINE_WINDOW, SWEEP_INTERVAL};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};

/// Relay server configuration
#[derive(Debug, Clone)]
pub struct RelayServerConfig {
    /// Maximum number of registered devices
    pub max_clients: usize,
    /// Rate limit (signals per device per second)
    pub rate_limit: usize,
    /// Devices heard from within this window are shown online
    pub online_window: Duration,
    /// Silence after which a device is removed
    pub client_timeout: Duration,
    /// Expiry sweep interval
    pub cleanup_interval: Duration,
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        Self {
            max_clients: 10_000,
            rate_limit: 100,
            online_window: ONLINE_WINDOW,
            client_timeout: EXPIRY_TIMEOUT,
            cleanup_interval: SWEEP_INTERVAL,
        }
    }
}

impl RelayServerConfig {
    fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            online_window: self.online_window,
            expiry_timeout: self.client_timeout,
            sweep_interval: self.cleanup_interval,
            max_devices: self.max_clients,
        }
    }
}

/// Signaling relay server
pub struct RelayServer {
    listener: TcpListener,
    registry: Registry,
    relay: Relay,
    config: RelayServerConfig,
}

impl RelayServer {
    /// Create a new relay server
    ///
    /// # Errors
    ///
    /// Returns error if socket binding fails.
    pub async fn bind(bind_addr: SocketAddr) -> Result<Self, RelayError> {
        Self::bind_with_config(bind_addr, RelayServerConfig::default()).await
    }

    /// Create a new relay server with custom configuration
    ///
    /// # Errors
    ///
    /// Returns error if socket binding fails.
    pub async fn bind_with_config(
        bind_addr: SocketAddr,
        config: RelayServerConfig,
    ) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(bind_addr).await?;
        let registry = Registry::with_config(config.registry_config());
        let relay = Relay::new(registry.clone(), config.rate_limit);

        Ok(Self {
            listener,
            registry,
            relay,
            config,
        })
    }

    /// Address the server is listening on
    ///
    /// # Errors
    ///
    /// Returns error if the socket address cannot be read.
    pub fn local_addr(&self) -> Result<SocketAddr, RelayError> {
        Ok(self.listener.local_addr()?)
    }

    /// The device registry
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Server configuration
    #[must_use]
    pub fn config(&self) -> &RelayServerConfig {
        &self.config
    }

    /// Subscribe to registry membership changes
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<MembershipChange> {
        self.registry.subscribe()
    }

    /// Number of connected, registered clients
    pub async fn client_count(&self) -> usize {
        self.relay.route_count().await
    }

    /// Run the relay server
    ///
    /// Accepts connections until the task is dropped.
    ///
    /// # Errors
    ///
    /// Returns error if accepting connections fails fatally.
    pub async fn run(&self) -> Result<(), RelayError> {
        tracing::info!("Relay server listening on {}", self.local_addr()?);

        let sweeper = self.registry.spawn_sweeper();
        let announcer = spawn_membership_broadcast(self.registry.clone(), self.relay.clone());

        let result = loop {
            match self.listener.accept().await {
                Ok((stream, from)) => {
                    let relay = self.relay.clone();
                    tokio::spawn(async move {
                        handle_connection(relay, stream, from).await;
                    });
                }
                Err(e) if is_transient_accept_error(&e) => {
                    tracing::warn!("Accept error: {}", e);
                }
                Err(e) => break Err(RelayError::from(e)),
            }
        };

        sweeper.abort();
        announcer.abort();
        result
    }
}

fn is_transient_accept_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::WouldBlock
    )
}

/// Broadcast the device list on every membership change
fn spawn_membership_broadcast(registry: Registry, relay: Relay) -> tokio::task::JoinHandle<()> {
    let mut changes = registry.subscribe();

    tokio::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(change) => {
                    tracing::debug!("Membership changed: {:?}", change);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!("Membership broadcast lagged by {}", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }

            let devices = registry.list_devices().await;
            relay
                .broadcast(ServerMessage::DevicesUpdated { devices })
                .await;
        }
    })
}

/// Serve one client connection
async fn handle_connection(relay: Relay, stream: TcpStream, from: SocketAddr) {
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    let writer_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = wire::write_message(&mut writer, &msg).await {
                tracing::debug!("Write to {} failed: {}", from, e);
                break;
            }
        }
    });

    if let Some(device_id) = await_registration(&relay, &mut reader, &tx, from).await {
        serve_registered(&relay, &mut reader, &tx, &device_id).await;

        relay.detach(&device_id).await;
        relay.registry().unregister(&device_id).await;
        tracing::debug!("Connection from {} ({}) closed", from, device_id.short());
    }

    // Let queued messages drain before the writer stops
    drop(tx);
    let _ = writer_task.await;
}

/// Wait for the `Register` message that binds this connection to a device
async fn await_registration(
    relay: &Relay,
    reader: &mut OwnedReadHalf,
    tx: &mpsc::UnboundedSender<ServerMessage>,
    from: SocketAddr,
) -> Option<DeviceId> {
    loop {
        let msg = match wire::read_message::<_, ClientMessage>(reader).await {
            Ok(Some(msg)) => msg,
            Ok(None) => return None,
            Err(e) => {
                tracing::debug!("Read from {} failed before registration: {}", from, e);
                return None;
            }
        };

        match msg {
            ClientMessage::Register { display_name } => {
                match relay.registry().register(&display_name).await {
                    Ok(device) => {
                        let _ = tx.send(ServerMessage::Registered {
                            device_id: device.id.clone(),
                            display_name: device.display_name.clone(),
                        });
                        relay.attach(device.id.clone(), tx.clone()).await;

                        // The membership broadcast may have fired before the
                        // route was attached
                        let devices = relay.registry().list_devices().await;
                        let _ = tx.send(ServerMessage::DevicesUpdated { devices });

                        tracing::info!(
                            "Device {} ({}) connected from {}",
                            device.id.short(),
                            device.display_name,
                            from
                        );
                        return Some(device.id);
                    }
                    Err(RegistryError::RegistrationFailure(reason)) => {
                        tracing::warn!("Registration from {} refused: {}", from, reason);
                        let _ = tx.send(ServerMessage::Error {
                            code: RelayErrorCode::RegistrationFailure,
                            message: reason,
                        });
                        return None;
                    }
                }
            }
            ClientMessage::Disconnect => return None,
            _ => {
                let _ = tx.send(ServerMessage::Error {
                    code: RelayErrorCode::NotRegistered,
                    message: "Not registered".to_string(),
                });
            }
        }
    }
}

/// Process messages from a registered device until it disconnects
async fn serve_registered(
    relay: &Relay,
    reader: &mut OwnedReadHalf,
    tx: &mpsc::UnboundedSender<ServerMessage>,
    device_id: &DeviceId,
) {
    loop {
        let msg = match wire::read_message::<_, ClientMessage>(reader).await {
            Ok(Some(msg)) => msg,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("Read from {} failed: {}", device_id.short(), e);
                break;
            }
        };

        match msg {
            ClientMessage::Heartbeat { device_id: claimed } => {
                if &claimed == device_id {
                    relay.registry().heartbeat(device_id).await;
                } else {
                    reject(tx, "heartbeat for another device");
                }
            }
            ClientMessage::GetDevices => {
                let devices = relay.registry().list_devices().await;
                let _ = tx.send(ServerMessage::DevicesUpdated { devices });
            }
            ClientMessage::Signal(signal) => {
                if &signal.source_device_id != device_id {
                    reject(tx, "signal source does not match registration");
                    continue;
                }

                let kind = signal.kind;
                match relay.forward(signal).await {
                    Ok(()) => {}
                    Err(RelayError::TargetNotFound(target)) => {
                        tracing::debug!(
                            "Signal {} from {} to unknown {}",
                            kind,
                            device_id.short(),
                            target.short()
                        );
                        let _ = tx.send(ServerMessage::TargetNotFound {
                            target_device_id: target,
                            kind,
                        });
                    }
                    Err(RelayError::RateLimited) => {
                        let _ = tx.send(ServerMessage::Error {
                            code: RelayErrorCode::RateLimited,
                            message: "Rate limit exceeded".to_string(),
                        });
                    }
                    Err(e) => reject(tx, &e.to_string()),
                }
            }
            ClientMessage::Register { .. } => reject(tx, "already registered"),
            ClientMessage::Disconnect => break,
        }
    }
}

fn reject(tx: &mpsc::UnboundedSender<ServerMessage>, reason: &str) {
    let _ = tx.send(ServerMessage::Error {
        code: RelayErrorCode::InvalidMessage,
        message: reason.to_string(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::protocol::{NegotiationMessage, SignalKind};

    async fn start_server() -> SocketAddr {
        let server = RelayServer::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move { server.run().await });
        addr
    }

    async fn raw_register(addr: SocketAddr, name: &str) -> (TcpStream, DeviceId) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        wire::write_message(
            &mut stream,
            &ClientMessage::Register {
                display_name: name.to_string(),
            },
        )
        .await
        .unwrap();

        let msg: ServerMessage = wire::read_message(&mut stream).await.unwrap().unwrap();
        let ServerMessage::Registered { device_id, .. } = msg else {
            panic!("expected Registered, got {msg:?}");
        };
        (stream, device_id)
    }

    async fn next_non_list(stream: &mut TcpStream) -> ServerMessage {
        loop {
            let msg: ServerMessage = wire::read_message(stream).await.unwrap().unwrap();
            if !matches!(msg, ServerMessage::DevicesUpdated { .. }) {
                return msg;
            }
        }
    }

    #[tokio::test]
    async fn test_relay_server_creation() {
        let server = RelayServer::bind("127.0.0.1:0".parse().unwrap()).await;
        assert!(server.is_ok());
        assert_eq!(server.unwrap().client_count().await, 0);
    }

    #[test]
    fn test_relay_server_config_default() {
        let config = RelayServerConfig::default();
        assert_eq!(config.max_clients, 10_000);
        assert_eq!(config.client_timeout, Duration::from_secs(60));
        assert_eq!(config.cleanup_interval, Duration::from_secs(30));
        assert_eq!(config.online_window, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_signal_requires_registration() {
        let addr = start_server().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        wire::write_message(&mut stream, &ClientMessage::GetDevices)
            .await
            .unwrap();

        let msg: ServerMessage = wire::read_message(&mut stream).await.unwrap().unwrap();
        assert!(matches!(
            msg,
            ServerMessage::Error {
                code: RelayErrorCode::NotRegistered,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_target_not_found_reported_to_sender() {
        let addr = start_server().await;
        let (mut stream, me) = raw_register(addr, "a").await;

        let signal = NegotiationMessage::new(
            SignalKind::Offer,
            b"offer".to_vec(),
            me,
            DeviceId::from("unknown-id"),
        );
        wire::write_message(&mut stream, &ClientMessage::Signal(signal))
            .await
            .unwrap();

        match next_non_list(&mut stream).await {
            ServerMessage::TargetNotFound {
                target_device_id,
                kind,
            } => {
                assert_eq!(target_device_id, DeviceId::from("unknown-id"));
                assert_eq!(kind, SignalKind::Offer);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_spoofed_source_rejected() {
        let addr = start_server().await;
        let (mut stream_a, _a) = raw_register(addr, "a").await;
        let (_stream_b, b) = raw_register(addr, "b").await;

        let signal = NegotiationMessage::new(
            SignalKind::Offer,
            vec![],
            DeviceId::from("someone-else"),
            b,
        );
        wire::write_message(&mut stream_a, &ClientMessage::Signal(signal))
            .await
            .unwrap();

        assert!(matches!(
            next_non_list(&mut stream_a).await,
            ServerMessage::Error {
                code: RelayErrorCode::InvalidMessage,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_signal_forwarded_between_devices() {
        let addr = start_server().await;
        let (mut stream_a, a) = raw_register(addr, "a").await;
        let (mut stream_b, b) = raw_register(addr, "b").await;

        for kind in [SignalKind::Offer, SignalKind::Candidate] {
            let signal = NegotiationMessage::new(kind, vec![1, 2, 3], a.clone(), b.clone());
            wire::write_message(&mut stream_a, &ClientMessage::Signal(signal))
                .await
                .unwrap();
        }

        for expected in [SignalKind::Offer, SignalKind::Candidate] {
            match next_non_list(&mut stream_b).await {
                ServerMessage::Signal(msg) => {
                    assert_eq!(msg.kind, expected);
                    assert_eq!(msg.source_device_id, a);
                    assert_eq!(msg.payload, vec![1, 2, 3]);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_disconnect_unregisters_and_broadcasts() {
        let server = RelayServer::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let registry = server.registry().clone();
        tokio::spawn(async move { server.run().await });

        let (mut stream_a, _a) = raw_register(addr, "a").await;
        let (stream_b, b) = raw_register(addr, "b").await;
        assert_eq!(registry.len().await, 2);

        drop(stream_b);

        // Eventually A sees a list without B
        loop {
            let msg: ServerMessage = wire::read_message(&mut stream_a).await.unwrap().unwrap();
            if let ServerMessage::DevicesUpdated { devices } = msg {
                if devices.iter().all(|d| d.id != b) && devices.len() == 1 {
                    break;
                }
            }
        }
        assert!(!registry.contains(&b).await);
    }
}
