//! In-process pub/sub bus.
//!
//! Every subscriber whose pattern matches receives every publish, the
//! publisher's own subscription included, which matches how a shared
//! broker topic behaves. A recording bus also keeps a copy of every
//! published message so tests can observe the wire from outside any relay.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::trace;

use super::{pattern_matches, MessageStream, Publisher, Subscriber, TransportMessage};
use crate::errors::RelayError;

#[derive(Default)]
struct BusInner {
    subscribers: Vec<(String, mpsc::UnboundedSender<TransportMessage>)>,
    recorded: Option<Vec<TransportMessage>>,
}

/// Cloneable handle to a shared in-process bus.
#[derive(Clone, Default)]
pub struct InMemoryBus {
    inner: Arc<Mutex<BusInner>>,
}

impl InMemoryBus {
    /// Create a bus that does not retain published messages.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a bus that records every published message.
    #[must_use]
    pub fn recording() -> Self {
        Self {
            inner: Arc::new(Mutex::new(BusInner {
                subscribers: Vec::new(),
                recorded: Some(Vec::new()),
            })),
        }
    }

    fn inner(&self) -> MutexGuard<'_, BusInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Messages published so far (empty unless created with [`Self::recording`]).
    #[must_use]
    pub fn published(&self) -> Vec<TransportMessage> {
        self.inner().recorded.clone().unwrap_or_default()
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        let mut inner = self.inner();
        inner.subscribers.retain(|(_, tx)| !tx.is_closed());
        inner.subscribers.len()
    }
}

#[async_trait]
impl Publisher for InMemoryBus {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), RelayError> {
        let message = TransportMessage {
            channel: channel.to_string(),
            payload,
        };

        let mut inner = self.inner();
        if let Some(recorded) = inner.recorded.as_mut() {
            recorded.push(message.clone());
        }
        // Closed subscriptions are pruned on the way.
        inner.subscribers.retain(|(pattern, tx)| {
            !pattern_matches(pattern, channel) || tx.send(message.clone()).is_ok()
        });

        trace!(
            target: "relay.transport",
            channel = %channel,
            subscribers = inner.subscribers.len(),
            "Published on in-memory bus"
        );
        Ok(())
    }
}

#[async_trait]
impl Subscriber for InMemoryBus {
    async fn subscribe(&self, pattern: &str) -> Result<MessageStream, RelayError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner().subscribers.push((pattern.to_string(), tx));

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|message| (message, rx))
        });
        Ok(stream.boxed())
    }
}
