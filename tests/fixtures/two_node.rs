//! Two-node test fixture for integration testing
//!
//! Starts a relay on an ephemeral port and two nodes registered with it,
//! `alice` and `bob`, both answering on loopback only.
//!
//! # Example
//!
//! ```no_run
//! use lanshare_integration_tests::fixtures::TwoNodeFixture;
//!
//! #[tokio::test]
//! async fn test_basic_transfer() {
//!     let fixture = TwoNodeFixture::new().await.unwrap();
//!     fixture.connect().await.unwrap();
//!
//!     let report = fixture
//!         .alice
//!         .send_bytes(&fixture.bob_id(), "notes.txt", vec![1u8; 1000], None)
//!         .await
//!         .unwrap();
//!     // ... test transfer ...
//!
//!     fixture.cleanup().await;
//! }
//! ```

use lanshare_core::{Node, NodeConfig, NodeEvent, NodeError};
use lanshare_discovery::{DeviceId, RelayServer};
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Default wait for events and device list updates
const WAIT: Duration = Duration::from_secs(10);

/// Relay plus two registered nodes
pub struct TwoNodeFixture {
    pub relay_addr: SocketAddr,
    pub alice: Node,
    pub bob: Node,
    relay: JoinHandle<()>,
}

impl TwoNodeFixture {
    /// Start a relay and two nodes with default settings
    ///
    /// # Errors
    ///
    /// Returns error if the relay cannot bind or a node fails to register.
    pub async fn new() -> Result<Self, NodeError> {
        Self::with_config(|_| {}).await
    }

    /// Start a relay and two nodes, adjusting each node config with `tweak`
    ///
    /// # Errors
    ///
    /// Returns error if the relay cannot bind or a node fails to register.
    pub async fn with_config(tweak: impl Fn(&mut NodeConfig)) -> Result<Self, NodeError> {
        let server = RelayServer::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).await?;
        let relay_addr = server.local_addr()?;
        let relay = tokio::spawn(async move {
            if let Err(e) = server.run().await {
                tracing::warn!("Test relay stopped: {}", e);
            }
        });

        let node_config = |name: &str| {
            let mut config = NodeConfig::with_relay(relay_addr, name);
            config.connection.listen_ip = Ipv4Addr::LOCALHOST.into();
            tweak(&mut config);
            config
        };

        let alice = Node::start(node_config("alice")).await?;
        let bob = Node::start(node_config("bob")).await?;

        Ok(Self {
            relay_addr,
            alice,
            bob,
            relay,
        })
    }

    /// Alice's device id
    #[must_use]
    pub fn alice_id(&self) -> DeviceId {
        self.alice.device_id().clone()
    }

    /// Bob's device id
    #[must_use]
    pub fn bob_id(&self) -> DeviceId {
        self.bob.device_id().clone()
    }

    /// Connect alice to bob and wait until both sides are open
    ///
    /// # Errors
    ///
    /// Returns the connection error of either side.
    pub async fn connect(&self) -> Result<(), NodeError> {
        let bob_id = self.bob_id();
        let alice_id = self.alice_id();
        self.alice.connect(&bob_id).await?;
        self.bob.wait_open(&alice_id).await
    }

    /// Shut both nodes down and stop the relay
    pub async fn cleanup(self) {
        let _ = self.alice.shutdown().await;
        let _ = self.bob.shutdown().await;
        self.relay.abort();
    }
}

/// Next event, failing the test after a generous timeout
///
/// # Panics
///
/// Panics if no event arrives in time or the bus closed.
pub async fn next_event(rx: &mut broadcast::Receiver<NodeEvent>) -> NodeEvent {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("event timeout")
        .expect("event bus closed")
}

/// Skip events until one matches `pred`
///
/// # Panics
///
/// Panics if no matching event arrives in time.
pub async fn wait_for<F>(rx: &mut broadcast::Receiver<NodeEvent>, mut pred: F) -> NodeEvent
where
    F: FnMut(&NodeEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("no matching event")
}

/// Poll `check` until it returns true
///
/// # Panics
///
/// Panics if `check` is still false after the timeout.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
