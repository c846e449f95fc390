//! Signal routing between registered devices.

use super::protocol::{NegotiationMessage, RelayError, ServerMessage};
use crate::registry::{DeviceId, Registry};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};
use tokio::time::Instant;

/// Outbound queue of one connected device
///
/// Drained by a single writer task, so delivery order equals enqueue order.
pub type Route = mpsc::UnboundedSender<ServerMessage>;

/// Simple fixed-window rate limiter
struct RateLimiter {
    /// Signals per device per window
    limit: usize,
    /// Signal counts for each device
    counts: HashMap<DeviceId, (Instant, usize)>,
    /// Window duration
    window: Duration,
}

impl RateLimiter {
    fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            counts: HashMap::new(),
            window,
        }
    }

    fn check(&mut self, device_id: &DeviceId) -> bool {
        let now = Instant::now();

        let entry = self
            .counts
            .entry(device_id.clone())
            .or_insert((now, 0));

        if now.duration_since(entry.0) >= self.window {
            entry.0 = now;
            entry.1 = 0;
        }

        if entry.1 >= self.limit {
            return false;
        }

        entry.1 += 1;
        true
    }

    fn forget(&mut self, device_id: &DeviceId) {
        self.counts.remove(device_id);
    }
}

/// Store-less signal relay
///
/// Looks targets up in the registry and pushes messages onto the target's
/// route. Payloads are forwarded verbatim.
#[derive(Clone)]
pub struct Relay {
    registry: Registry,
    routes: Arc<RwLock<HashMap<DeviceId, Route>>>,
    limiter: Arc<RwLock<RateLimiter>>,
}

impl Relay {
    /// Create a relay over `registry` allowing `rate_limit` signals per
    /// device per second
    #[must_use]
    pub fn new(registry: Registry, rate_limit: usize) -> Self {
        Self {
            registry,
            routes: Arc::new(RwLock::new(HashMap::new())),
            limiter: Arc::new(RwLock::new(RateLimiter::new(
                rate_limit,
                Duration::from_secs(1),
            ))),
        }
    }

    /// The registry used for lookups
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Attach the outbound route of a registered device
    pub async fn attach(&self, device_id: DeviceId, route: Route) {
        self.routes.write().await.insert(device_id, route);
    }

    /// Detach a device's route
    pub async fn detach(&self, device_id: &DeviceId) {
        self.routes.write().await.remove(device_id);
        self.limiter.write().await.forget(device_id);
    }

    /// Number of attached routes
    pub async fn route_count(&self) -> usize {
        self.routes.read().await.len()
    }

    /// Forward a negotiation message to its target
    ///
    /// # Errors
    ///
    /// Returns `RateLimited` when the source exceeded its budget and
    /// `TargetNotFound` when the target is not registered or not connected.
    pub async fn forward(&self, message: NegotiationMessage) -> Result<(), RelayError> {
        if !self
            .limiter
            .write()
            .await
            .check(&message.source_device_id)
        {
            return Err(RelayError::RateLimited);
        }

        let target = message.target_device_id.clone();
        if !self.registry.contains(&target).await {
            return Err(RelayError::TargetNotFound(target));
        }

        let routes = self.routes.read().await;
        let Some(route) = routes.get(&target) else {
            return Err(RelayError::TargetNotFound(target));
        };

        tracing::trace!(
            "Relaying {} {} -> {} ({} bytes)",
            message.kind,
            message.source_device_id.short(),
            target.short(),
            message.payload.len()
        );

        route
            .send(ServerMessage::Signal(message))
            .map_err(|_| RelayError::TargetNotFound(target))
    }

    /// Send a message to one device, if connected
    pub async fn send_to(&self, device_id: &DeviceId, message: ServerMessage) -> bool {
        match self.routes.read().await.get(device_id) {
            Some(route) => route.send(message).is_ok(),
            None => false,
        }
    }

    /// Send a message to every connected device
    pub async fn broadcast(&self, message: ServerMessage) {
        let routes = self.routes.read().await;
        for route in routes.values() {
            let _ = route.send(message.clone());
        }
    }
}
