//! Node implementation

use super::config::NodeConfig;
use crate::connection::{ConnectionManager, ConnectionState, Signaler};
use crate::error::{NodeError, Result};
use crate::event::{EventBus, NodeEvent};
use crate::transfer::{FileMeta, SendReport, mime_from_name};
use bytes::Bytes;
use lanshare_discovery::{
    DeviceId, DeviceStatus, DeviceSummary, Registration, RelayClient, RelayEvent,
};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::sync::{RwLock, broadcast, mpsc};
use tokio::task::JoinHandle;

struct NodeInner {
    config: NodeConfig,
    registration: Registration,
    relay: Arc<RelayClient>,
    manager: ConnectionManager,
    events: EventBus,
    devices: Arc<RwLock<Vec<DeviceSummary>>>,
    running: AtomicBool,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

/// LANSHARE node
///
/// Registers this device with a relay and coordinates:
/// - Device list updates pushed by the relay
/// - Connection negotiation with other devices
/// - File transfers over open channels
///
/// Everything observable is published on the event bus ([`Node::subscribe`]).
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Lifecycle
// ═══════════════════════════════════════════════════════════════════════════

impl Node {
    /// Connect to the relay, register, and start background tasks
    ///
    /// # Errors
    ///
    /// Returns error if the config is invalid or the relay cannot be reached
    /// or refuses the registration.
    pub async fn start(config: NodeConfig) -> Result<Self> {
        config.validate()?;

        tracing::info!(
            "Starting node '{}' with relay {}",
            config.display_name,
            config.relay_addr
        );

        let mut relay = RelayClient::connect(config.relay_addr).await?;
        let registration = relay.register(&config.display_name).await?;
        let relay_events = relay
            .take_events()
            .ok_or(NodeError::invalid_config("relay events already taken"))?;
        let relay = Arc::new(relay);
        let heartbeat = relay.spawn_heartbeat(config.heartbeat_interval)?;

        let events = EventBus::new(config.event_capacity);
        let signaler: Arc<dyn Signaler> = relay.clone();
        let manager = ConnectionManager::new(
            registration.device_id.clone(),
            registration.display_name.clone(),
            signaler,
            events.clone(),
            config.connection.clone(),
            config.transfer.clone(),
        );

        let devices = Arc::new(RwLock::new(Vec::new()));
        let dispatch = tokio::spawn(dispatch_loop(
            relay_events,
            manager.clone(),
            events.clone(),
            devices.clone(),
        ));

        tracing::info!(
            "Node registered as {} ({})",
            registration.display_name,
            registration.device_id
        );

        Ok(Self {
            inner: Arc::new(NodeInner {
                config,
                registration,
                relay,
                manager,
                events,
                devices,
                running: AtomicBool::new(true),
                tasks: std::sync::Mutex::new(vec![heartbeat, dispatch]),
            }),
        })
    }

    /// Close every connection, leave the relay, and stop background tasks
    ///
    /// # Errors
    ///
    /// Returns `Shutdown` if the node was already shut down.
    pub async fn shutdown(&self) -> Result<()> {
        if self
            .inner
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(NodeError::Shutdown);
        }

        self.inner.manager.close_all().await;

        if let Err(e) = self.inner.relay.disconnect() {
            tracing::debug!("Relay disconnect: {}", e);
        }

        if let Ok(mut tasks) = self.inner.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }

        tracing::info!("Node {} stopped", self.inner.registration.device_id.short());
        Ok(())
    }

    /// Check if the node is running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(NodeError::Shutdown)
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Identity and devices
// ═══════════════════════════════════════════════════════════════════════════

impl Node {
    /// Id assigned by the relay
    #[must_use]
    pub fn device_id(&self) -> &DeviceId {
        &self.inner.registration.device_id
    }

    /// Display name as stored by the relay
    #[must_use]
    pub fn display_name(&self) -> &str {
        &self.inner.registration.display_name
    }

    /// Node configuration
    #[must_use]
    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    /// Subscribe to node events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.inner.events.subscribe()
    }

    /// Ask the relay for a fresh device list
    ///
    /// The answer arrives as [`NodeEvent::DevicesChanged`].
    ///
    /// # Errors
    ///
    /// Returns error if the relay connection is gone.
    pub fn refresh_devices(&self) -> Result<()> {
        self.ensure_running()?;
        self.inner.relay.request_devices()?;
        Ok(())
    }

    /// Last device list pushed by the relay
    pub async fn devices(&self) -> Vec<DeviceSummary> {
        self.inner.devices.read().await.clone()
    }

    /// Other devices from the last list
    pub async fn peers(&self) -> Vec<DeviceSummary> {
        self.devices()
            .await
            .into_iter()
            .filter(|d| d.id != *self.device_id())
            .collect()
    }

    /// Find a device by id or display name
    ///
    /// An exact id wins. Otherwise the name must match exactly one device
    /// (case-insensitive); an online match wins over offline ones.
    ///
    /// # Errors
    ///
    /// Returns `UnknownDevice` if nothing or more than one device matches.
    pub async fn resolve(&self, query: &str) -> Result<DeviceId> {
        resolve_in(&self.peers().await, query)
    }

    /// Wait until `query` resolves against the relay's device list
    ///
    /// # Errors
    ///
    /// Returns `UnknownDevice` if it does not resolve within `timeout`.
    pub async fn wait_for_device(&self, query: &str, timeout: Duration) -> Result<DeviceId> {
        let mut events = self.subscribe();
        if let Ok(id) = self.resolve(query).await {
            return Ok(id);
        }
        self.refresh_devices()?;

        let waited = tokio::time::timeout(timeout, async {
            loop {
                match events.recv().await {
                    Ok(NodeEvent::DevicesChanged(_))
                    | Err(broadcast::error::RecvError::Lagged(_)) => {
                        if let Ok(id) = self.resolve(query).await {
                            return Some(id);
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .await;

        match waited {
            Ok(Some(id)) => Ok(id),
            _ => Err(NodeError::UnknownDevice(query.to_string())),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Connections
// ═══════════════════════════════════════════════════════════════════════════

impl Node {
    /// Start connecting to `remote`; idempotent
    ///
    /// # Errors
    ///
    /// Returns error if the offer cannot be sent.
    pub async fn initiate(&self, remote: &DeviceId) -> Result<ConnectionState> {
        self.ensure_running()?;
        Ok(self.inner.manager.initiate(remote).await?)
    }

    /// Connect to `remote` and wait for the channel to open
    ///
    /// # Errors
    ///
    /// Returns the connection error that ended the attempt.
    pub async fn connect(&self, remote: &DeviceId) -> Result<()> {
        self.ensure_running()?;
        Ok(self.inner.manager.connect(remote).await?)
    }

    /// Wait for a connection (incoming or outgoing) to open
    ///
    /// # Errors
    ///
    /// Returns the connection error that ended the attempt.
    pub async fn wait_open(&self, remote: &DeviceId) -> Result<()> {
        Ok(self.inner.manager.wait_open(remote).await?)
    }

    /// State of the connection to `remote`
    pub async fn connection_state(&self, remote: &DeviceId) -> ConnectionState {
        self.inner.manager.connection_state(remote).await
    }

    /// All tracked connections
    pub async fn connections(&self) -> Vec<(DeviceId, ConnectionState)> {
        self.inner.manager.connections().await
    }

    /// Close the connection to `remote`
    ///
    /// Returns false if there was nothing to close.
    pub async fn close(&self, remote: &DeviceId) -> bool {
        self.inner.manager.close(remote).await
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Transfers
// ═══════════════════════════════════════════════════════════════════════════

impl Node {
    /// Send a file to `remote` over its open channel
    ///
    /// # Errors
    ///
    /// `ChannelNotReady` before the connection is open, `TransferInProgress`
    /// while another send to `remote` is active, or the transfer error.
    pub async fn send_file(&self, remote: &DeviceId, path: impl AsRef<Path>) -> Result<SendReport> {
        self.ensure_running()?;
        let engine = self.inner.manager.engine(remote).await?;
        Ok(engine.send_file(path.as_ref()).await?)
    }

    /// Send an in-memory buffer to `remote` as a file
    ///
    /// # Errors
    ///
    /// Same as [`Node::send_file`].
    pub async fn send_bytes(
        &self,
        remote: &DeviceId,
        name: &str,
        data: impl Into<Bytes>,
        mime_type: Option<&str>,
    ) -> Result<SendReport> {
        self.ensure_running()?;
        let engine = self.inner.manager.engine(remote).await?;
        Ok(engine.send_bytes(name, data.into(), mime_type).await?)
    }

    /// Stream `size` bytes from `reader` to `remote` as one file
    ///
    /// The MIME type falls back to the one derived from `name`.
    ///
    /// # Errors
    ///
    /// Same as [`Node::send_file`]; a reader yielding more or fewer than
    /// `size` bytes aborts the transfer.
    pub async fn send_stream<R>(
        &self,
        remote: &DeviceId,
        name: &str,
        size: u64,
        mime_type: Option<&str>,
        reader: R,
    ) -> Result<SendReport>
    where
        R: AsyncRead + Unpin,
    {
        self.ensure_running()?;
        let engine = self.inner.manager.engine(remote).await?;
        let mime_type = mime_type
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| mime_from_name(name));
        Ok(engine
            .send_reader(FileMeta::new(name, size, mime_type), reader)
            .await?)
    }
}

/// Route relay events to the connection manager and the bus
async fn dispatch_loop(
    mut relay_events: mpsc::UnboundedReceiver<RelayEvent>,
    manager: ConnectionManager,
    events: EventBus,
    devices: Arc<RwLock<Vec<DeviceSummary>>>,
) {
    while let Some(event) = relay_events.recv().await {
        match event {
            RelayEvent::DevicesUpdated(list) => {
                tracing::debug!("Device list: {} entries", list.len());
                *devices.write().await = list.clone();
                events.emit(NodeEvent::DevicesChanged(list));
            }
            RelayEvent::Signal(message) => manager.handle_signal(message).await,
            RelayEvent::TargetNotFound { target, kind } => {
                manager.handle_target_not_found(&target, kind).await;
            }
            RelayEvent::Error(e) => {
                tracing::warn!("Relay error: {}", e);
                let category = NodeError::from(e.clone()).category();
                events.error(None, category, e.to_string());
            }
            RelayEvent::Disconnected => {
                tracing::warn!("Relay connection lost");
                events.error(
                    None,
                    crate::error::ErrorCategory::Other,
                    "relay connection lost",
                );
                break;
            }
        }
    }
}

fn resolve_in(devices: &[DeviceSummary], query: &str) -> Result<DeviceId> {
    if let Some(device) = devices.iter().find(|d| d.id.as_str() == query) {
        return Ok(device.id.clone());
    }

    let named: Vec<&DeviceSummary> = devices
        .iter()
        .filter(|d| d.name.eq_ignore_ascii_case(query))
        .collect();
    let online: Vec<&&DeviceSummary> = named
        .iter()
        .filter(|d| d.status == DeviceStatus::Online)
        .collect();

    match (named.as_slice(), online.as_slice()) {
        ([only], _) => Ok(only.id.clone()),
        (_, [only]) => Ok(only.id.clone()),
        _ => Err(NodeError::UnknownDevice(query.to_string())),
    }
}
