//! Process-wide device registry with liveness tracking.
//!
//! The registry is the single owner of device records. All mutations
//! (register, heartbeat, unregister, sweep) go through one write lock, and
//! every read is a snapshot taken under the same lock. Online/offline status
//! is never stored: it is derived from `last_seen_at` at read time.

use crate::{EXPIRY_TIMEOUT, ONLINE_WINDOW, SWEEP_INTERVAL};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{RwLock, broadcast};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Maximum display name length in characters
pub const MAX_DISPLAY_NAME_LEN: usize = 64;

/// Name given to devices that register without one
pub const DEFAULT_DISPLAY_NAME: &str = "Unnamed device";

/// Opaque device identifier assigned by the registry
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    /// Draw a fresh random identifier (128 bits, hex encoded)
    #[must_use]
    pub fn random() -> Self {
        let bytes: [u8; 16] = rand::random();
        Self(hex::encode(bytes))
    }

    /// Identifier for the `seq`-th registration: sequence number, then random bits
    ///
    /// Distinct sequence numbers never collide, whatever the random half is.
    #[must_use]
    pub fn issue(seq: u64) -> Self {
        let tail: [u8; 8] = rand::random();
        Self(format!("{}{}", hex::encode(seq.to_be_bytes()), hex::encode(tail)))
    }

    /// Borrow the identifier as a string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for log output
    #[must_use]
    pub fn short(&self) -> &str {
        let end = self.0.len().min(8);
        self.0.get(..end).unwrap_or(&self.0)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A registered device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    /// Registry-assigned identifier
    pub id: DeviceId,
    /// Human-readable name chosen by the device
    pub display_name: String,
    /// Time of registration or of the latest heartbeat
    pub last_seen_at: Instant,
}

impl Device {
    /// Derived liveness status at `now`
    #[must_use]
    pub fn status_at(&self, now: Instant, online_window: Duration) -> DeviceStatus {
        if now.saturating_duration_since(self.last_seen_at) < online_window {
            DeviceStatus::Online
        } else {
            DeviceStatus::Offline
        }
    }

    /// Time since the last heartbeat
    #[must_use]
    pub fn silence(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_seen_at)
    }
}

/// Derived device status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceStatus {
    /// Heard from within the online window
    Online,
    /// Silent longer than the online window but not yet expired
    Offline,
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Online => write!(f, "online"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

/// Device entry as broadcast to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSummary {
    /// Device identifier
    pub id: DeviceId,
    /// Display name
    pub name: String,
    /// Derived status
    pub status: DeviceStatus,
}

/// Membership change notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipChange {
    /// A device registered
    Joined(DeviceId),
    /// A device unregistered (its transport went away)
    Left(DeviceId),
    /// The sweep removed silent devices
    Expired(Vec<DeviceId>),
}

/// Registry errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The registry cannot accept another device
    #[error("registration failed: {0}")]
    RegistrationFailure(String),
}

/// Registry configuration
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Devices heard from within this window are online
    pub online_window: Duration,
    /// Devices silent for this long are removed by the sweep
    pub expiry_timeout: Duration,
    /// Sweep cadence
    pub sweep_interval: Duration,
    /// Maximum number of registered devices
    pub max_devices: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            online_window: ONLINE_WINDOW,
            expiry_timeout: EXPIRY_TIMEOUT,
            sweep_interval: SWEEP_INTERVAL,
            max_devices: 10_000,
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    devices: HashMap<DeviceId, Device>,
    /// Registrations so far; feeds the id so ids are never reused
    next_seq: u64,
}

/// Device registry
///
/// Cheap to clone; clones share the same table.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RwLock<RegistryInner>>,
    changes: broadcast::Sender<MembershipChange>,
    config: RegistryConfig,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Create a registry with default configuration
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    /// Create a registry with custom configuration
    #[must_use]
    pub fn with_config(config: RegistryConfig) -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(RwLock::new(RegistryInner::default())),
            changes,
            config,
        }
    }

    /// Registry configuration
    #[must_use]
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Subscribe to membership changes
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<MembershipChange> {
        self.changes.subscribe()
    }

    /// Register a new device and assign it a fresh identifier
    ///
    /// # Errors
    ///
    /// Returns `RegistrationFailure` when the registry is at capacity.
    pub async fn register(&self, display_name: &str) -> Result<Device, RegistryError> {
        let mut inner = self.inner.write().await;

        if inner.devices.len() >= self.config.max_devices {
            return Err(RegistryError::RegistrationFailure(format!(
                "registry at capacity ({} devices)",
                self.config.max_devices
            )));
        }

        let id = DeviceId::issue(inner.next_seq);
        inner.next_seq += 1;

        let device = Device {
            id: id.clone(),
            display_name: normalize_display_name(display_name),
            last_seen_at: Instant::now(),
        };

        inner.devices.insert(id.clone(), device.clone());
        drop(inner);

        tracing::info!(
            "Registered device {} ({})",
            device.id.short(),
            device.display_name
        );
        let _ = self.changes.send(MembershipChange::Joined(id));

        Ok(device)
    }

    /// Refresh a device's liveness
    ///
    /// Unknown devices are ignored; the sender may be racing its own expiry.
    /// Returns whether the device was known.
    pub async fn heartbeat(&self, device_id: &DeviceId) -> bool {
        let mut inner = self.inner.write().await;
        match inner.devices.get_mut(device_id) {
            Some(device) => {
                device.last_seen_at = Instant::now();
                true
            }
            None => {
                tracing::trace!("Heartbeat for unknown device {}", device_id.short());
                false
            }
        }
    }

    /// Remove a device
    pub async fn unregister(&self, device_id: &DeviceId) -> Option<Device> {
        let removed = self.inner.write().await.devices.remove(device_id);

        if let Some(device) = &removed {
            tracing::info!(
                "Unregistered device {} ({})",
                device.id.short(),
                device.display_name
            );
            let _ = self
                .changes
                .send(MembershipChange::Left(device_id.clone()));
        }

        removed
    }

    /// Look up a device
    pub async fn get(&self, device_id: &DeviceId) -> Option<Device> {
        self.inner.read().await.devices.get(device_id).cloned()
    }

    /// Whether a device is registered
    pub async fn contains(&self, device_id: &DeviceId) -> bool {
        self.inner.read().await.devices.contains_key(device_id)
    }

    /// Number of registered devices (online or not)
    pub async fn len(&self) -> usize {
        self.inner.read().await.devices.len()
    }

    /// Whether no device is registered
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.devices.is_empty()
    }

    /// Devices heard from within the online window
    pub async fn list_online(&self) -> Vec<Device> {
        let now = Instant::now();
        let inner = self.inner.read().await;
        let mut online: Vec<Device> = inner
            .devices
            .values()
            .filter(|d| d.status_at(now, self.config.online_window) == DeviceStatus::Online)
            .cloned()
            .collect();
        drop(inner);

        online.sort_by(|a, b| {
            a.display_name
                .cmp(&b.display_name)
                .then_with(|| a.id.cmp(&b.id))
        });
        online
    }

    /// Every registered device with its derived status
    pub async fn list_devices(&self) -> Vec<DeviceSummary> {
        let now = Instant::now();
        let inner = self.inner.read().await;
        let mut devices: Vec<DeviceSummary> = inner
            .devices
            .values()
            .map(|d| DeviceSummary {
                id: d.id.clone(),
                name: d.display_name.clone(),
                status: d.status_at(now, self.config.online_window),
            })
            .collect();
        drop(inner);

        devices.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        devices
    }

    /// Remove devices silent for at least `timeout` and return them
    pub async fn sweep_expired(&self, timeout: Duration) -> Vec<Device> {
        let now = Instant::now();
        let mut inner = self.inner.write().await;

        let expired_ids: Vec<DeviceId> = inner
            .devices
            .values()
            .filter(|d| d.silence(now) >= timeout)
            .map(|d| d.id.clone())
            .collect();

        let expired: Vec<Device> = expired_ids
            .iter()
            .filter_map(|id| inner.devices.remove(id))
            .collect();
        drop(inner);

        if !expired.is_empty() {
            tracing::info!("Expired {} silent device(s)", expired.len());
            let _ = self.changes.send(MembershipChange::Expired(expired_ids));
        }

        expired
    }

    /// Spawn the periodic expiry sweep
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let registry = self.clone();
        let interval = self.config.sweep_interval;
        let timeout = self.config.expiry_timeout;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                registry.sweep_expired(timeout).await;
            }
        })
    }
}

fn normalize_display_name(name: &str) -> String {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return DEFAULT_DISPLAY_NAME.to_string();
    }
    trimmed.chars().take(MAX_DISPLAY_NAME_LEN).collect()
}
