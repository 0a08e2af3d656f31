//! Publish/subscribe transport used to relay envelopes between processes.
//!
//! The relay needs two primitives:
//!
//! - [`Publisher::publish`] - send bytes on a channel, no acknowledgement
//! - [`Subscriber::subscribe`] - receive every message on channels matching
//!   a pattern, including this process's own publishes
//!
//! Delivery is assumed at-least-once and unordered across publishers.
//! Implementations:
//!
//! - [`redis`] - Redis PUBLISH / PSUBSCRIBE over two connections
//! - [`memory`] - in-process bus for single-process deployments and tests

pub mod memory;
pub mod redis;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::config::Config;
use crate::errors::RelayError;

pub use memory::InMemoryBus;
pub use redis::{RedisPublisher, RedisSubscriber};

/// One message received from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportMessage {
    /// Channel the message was published on.
    pub channel: String,
    pub payload: Bytes,
}

/// Stream of messages produced by a subscription.
pub type MessageStream = BoxStream<'static, TransportMessage>;

/// Publish side of the transport.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), RelayError>;
}

/// Subscribe side of the transport.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Subscribe to every channel matching `pattern` (a trailing `*`
    /// matches any suffix).
    async fn subscribe(&self, pattern: &str) -> Result<MessageStream, RelayError>;
}

/// The pair of transport handles a relay runs on.
#[derive(Clone)]
pub struct RelayTransport {
    publisher: Arc<dyn Publisher>,
    subscriber: Arc<dyn Subscriber>,
}

impl RelayTransport {
    /// Use already-connected handles.
    #[must_use]
    pub fn from_handles(publisher: Arc<dyn Publisher>, subscriber: Arc<dyn Subscriber>) -> Self {
        Self {
            publisher,
            subscriber,
        }
    }

    /// Connect both handles to Redis using the configured host and ports.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Transport` if either connection fails.
    pub async fn connect(config: &Config) -> Result<Self, RelayError> {
        let publisher = RedisPublisher::connect(config).await?;
        let subscriber = RedisSubscriber::open(config)?;

        Ok(Self::from_handles(Arc::new(publisher), Arc::new(subscriber)))
    }

    #[must_use]
    pub fn publisher(&self) -> Arc<dyn Publisher> {
        Arc::clone(&self.publisher)
    }

    #[must_use]
    pub fn subscriber(&self) -> Arc<dyn Subscriber> {
        Arc::clone(&self.subscriber)
    }
}

/// Returns true if `channel` matches `pattern` (exact, or prefix match
/// when the pattern ends in `*`).
#[must_use]
pub fn pattern_matches(pattern: &str, channel: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => channel.starts_with(prefix),
        None => pattern == channel,
    }
}
