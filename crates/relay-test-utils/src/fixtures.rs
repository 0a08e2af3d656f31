//! Relay fixtures.
//!
//! - `TestNode` - a relay with its own registry and mock directory, wired to
//!   a shared `InMemoryBus` with its publisher and receive loop running
//! - `WireSpy` - a bare subscriber that sees every envelope on the bus,
//!   standing in for a third instance
//! - `wait_until` - poll a condition while receive loops catch up

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use room_relay::config::{generate_origin_id, Config};
use room_relay::delivery::{ConnectionDirectory, PacketEncoder};
use room_relay::relay::Envelope;
use room_relay::transport::{MessageStream, Subscriber};
use room_relay::{InMemoryBus, MembershipRegistry, Relay, RelayTransport};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::mock_connections::{MockConnection, MockConnectionDirectory};
use crate::mock_encoder::CountingEncoder;

/// Key prefix used by every fixture.
pub const TEST_KEY_PREFIX: &str = "relay-test";

/// How long `wait_until` polls before giving up.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Config with a fresh origin id and the test key prefix.
#[must_use]
pub fn test_config() -> Config {
    Config {
        key_prefix: TEST_KEY_PREFIX.to_string(),
        origin_id: generate_origin_id(),
        ..Config::default()
    }
}

/// Install a test tracing subscriber once. Honors `RUST_LOG`.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "room_relay=debug,relay=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// One relay instance on a shared bus.
pub struct TestNode {
    pub relay: Relay,
    pub directory: Arc<MockConnectionDirectory>,
    pub encoder: Arc<CountingEncoder>,
    pub cancel_token: CancellationToken,
    tasks: JoinHandle<()>,
}

impl TestNode {
    /// Start a node in `namespace` with its receive loop subscribed.
    pub async fn start(bus: &InMemoryBus, namespace: &str) -> Self {
        Self::start_with_config(bus, namespace, test_config()).await
    }

    pub async fn start_with_config(bus: &InMemoryBus, namespace: &str, config: Config) -> Self {
        let directory = Arc::new(MockConnectionDirectory::new());
        let encoder = Arc::new(CountingEncoder::new());
        let relay = Relay::new(
            &config,
            namespace,
            Arc::new(MembershipRegistry::new()),
            Arc::clone(&directory) as Arc<dyn ConnectionDirectory>,
            Arc::clone(&encoder) as Arc<dyn PacketEncoder>,
            &bus_transport(bus),
        );

        let cancel_token = CancellationToken::new();
        let tasks = relay
            .start(cancel_token.clone())
            .await
            .expect("in-memory subscription cannot fail");

        Self {
            relay,
            directory,
            encoder,
            cancel_token,
            tasks,
        }
    }

    /// Register a live connection and join it to `rooms`. With no rooms
    /// the connection is still reached by whole-namespace broadcasts.
    pub fn connect(&self, id: &str, rooms: &[&str]) -> Arc<MockConnection> {
        let connection = self.directory.connect(id);
        self.relay.registry().register(id);
        self.relay.registry().join_all(id, rooms.iter().copied());
        connection
    }

    /// Remove a connection from the directory and from every room.
    pub fn disconnect(&self, id: &str) {
        self.relay.registry().leave_all(id);
        self.directory.disconnect(id);
    }

    /// Stop the publisher and receive loop and wait for them to exit.
    pub async fn shutdown(self) {
        self.cancel_token.cancel();
        self.tasks.await.expect("relay task panicked");
    }
}

/// Transport whose publisher and subscriber are both `bus`.
#[must_use]
pub fn bus_transport(bus: &InMemoryBus) -> RelayTransport {
    RelayTransport::from_handles(Arc::new(bus.clone()), Arc::new(bus.clone()))
}

/// Passive observer of every envelope on the bus.
pub struct WireSpy {
    stream: MessageStream,
}

impl WireSpy {
    /// Subscribe to every channel under the test key prefix.
    pub async fn attach(bus: &InMemoryBus) -> Self {
        let stream = bus
            .subscribe(&test_config().subscribe_pattern())
            .await
            .expect("in-memory subscription cannot fail");
        Self { stream }
    }

    /// Collect what has arrived, waiting briefly for stragglers.
    pub async fn drain(&mut self) -> Vec<Envelope> {
        let mut envelopes = Vec::new();
        while let Ok(Some(message)) =
            tokio::time::timeout(Duration::from_millis(50), self.stream.next()).await
        {
            envelopes.push(Envelope::decode(&message.payload).expect("spy saw malformed envelope"));
        }
        envelopes
    }
}

/// Poll `condition` until it holds or `WAIT_TIMEOUT` elapses.
pub async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
