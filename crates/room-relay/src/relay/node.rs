//! `Relay` - one namespace's view of the cluster.
//!
//! Every event the relay handles is either `Local` (raised by this process)
//! or `Remote` (decoded from another instance's envelope). Only local
//! events are ever published, so each logical event has exactly one
//! publish no matter how many instances receive it.
//!
//! Publishing never blocks the caller. Local events are encoded into an
//! envelope and queued on a bounded channel; a publisher task started by
//! [`Relay::start`] drains it next to the receive loop. A full queue
//! rejects the envelope rather than waiting.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use bytes::Bytes;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn, Instrument};

use super::envelope::{Envelope, RelayEvent};
use crate::broadcaster::{BroadcastReport, BroadcastSelection, LocalBroadcaster};
use crate::config::Config;
use crate::delivery::{ConnectionDirectory, PacketEncoder};
use crate::errors::RelayError;
use crate::membership::{ConnectionId, MembershipRegistry, RoomName};
use crate::observability::metrics::{
    record_envelope_published, record_envelope_received, record_publish_failure,
    record_publish_latency,
};
use crate::observability::{RelayStats, RelayStatsSnapshot};
use crate::transport::{MessageStream, Publisher, RelayTransport, Subscriber};

/// Namespace used when none is given.
pub const DEFAULT_NAMESPACE: &str = "/";

/// Where an event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOrigin {
    Local,
    Remote,
}

/// Result of a targeted emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitOutcome {
    /// The connection is live in this process and received the event.
    DeliveredLocally,
    /// The connection is not local; an envelope was queued for publishing.
    Relayed,
    /// Remote emit for a connection this process does not hold.
    Undeliverable,
}

/// What happened to one inbound transport message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayOutcome {
    Replayed,
    Undeliverable,
    SelfOrigin,
    ForeignNamespace,
    Malformed,
    Failed,
}

impl ReplayOutcome {
    /// Bounded label for the `outcome` metric label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            ReplayOutcome::Replayed => "replayed",
            ReplayOutcome::Undeliverable => "undeliverable",
            ReplayOutcome::SelfOrigin => "self_origin",
            ReplayOutcome::ForeignNamespace => "foreign_namespace",
            ReplayOutcome::Malformed => "malformed",
            ReplayOutcome::Failed => "failed",
        }
    }
}

/// An encoded envelope waiting for the publisher task.
struct Outbound {
    kind: &'static str,
    payload: Bytes,
}

struct RelayInner {
    origin_id: String,
    channel: String,
    pattern: String,
    broadcaster: LocalBroadcaster,
    transport: RelayTransport,
    outbound: mpsc::Sender<Outbound>,
    /// Taken by [`Relay::start`]; `None` once the publisher task owns it.
    outbound_rx: Mutex<Option<mpsc::Receiver<Outbound>>>,
    stats: Arc<RelayStats>,
}

/// Cluster-wide broadcaster for one namespace.
///
/// Cheap to clone; clones share the registry, stats and publish queue.
#[derive(Clone)]
pub struct Relay {
    inner: Arc<RelayInner>,
}

impl Relay {
    /// Create a relay. Nothing is published and inbound envelopes are not
    /// processed until [`Relay::start`] is called.
    #[must_use]
    pub fn new(
        config: &Config,
        namespace: impl Into<String>,
        registry: Arc<MembershipRegistry>,
        directory: Arc<dyn ConnectionDirectory>,
        encoder: Arc<dyn PacketEncoder>,
        transport: &RelayTransport,
    ) -> Self {
        let stats = RelayStats::new();
        let broadcaster = LocalBroadcaster::new(
            namespace,
            registry,
            directory,
            encoder,
            Arc::clone(&stats),
        );
        let (outbound, outbound_rx) = mpsc::channel(config.publish_queue_capacity.max(1));

        Self {
            inner: Arc::new(RelayInner {
                origin_id: config.origin_id.clone(),
                channel: config.publish_channel(),
                pattern: config.subscribe_pattern(),
                broadcaster,
                transport: transport.clone(),
                outbound,
                outbound_rx: Mutex::new(Some(outbound_rx)),
                stats,
            }),
        }
    }

    #[must_use]
    pub fn origin_id(&self) -> &str {
        &self.inner.origin_id
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        self.inner.broadcaster.namespace()
    }

    /// Membership registry for this namespace.
    #[must_use]
    pub fn registry(&self) -> &Arc<MembershipRegistry> {
        self.inner.broadcaster.registry()
    }

    #[must_use]
    pub fn stats(&self) -> RelayStatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Live local connections in `rooms` (all rooms when empty).
    #[must_use]
    pub fn clients<S: AsRef<str>>(&self, rooms: &[S]) -> Vec<ConnectionId> {
        self.inner.broadcaster.clients(rooms)
    }

    #[must_use]
    pub fn client_rooms(&self, connection_id: &str) -> Option<HashSet<RoomName>> {
        self.inner.broadcaster.client_rooms(connection_id)
    }

    /// Broadcast to local connections, then queue one envelope for the
    /// cluster.
    ///
    /// # Errors
    ///
    /// - `RelayError::IncorrectPacket` - payload is not a JSON object;
    ///   nothing was delivered or published
    /// - `RelayError::Encode` - payload could not be encoded; nothing was
    ///   delivered or published
    /// - `RelayError::Transport` - local delivery happened but the publish
    ///   queue was full or closed
    pub fn broadcast(
        &self,
        payload: Value,
        selection: BroadcastSelection,
    ) -> Result<BroadcastReport, RelayError> {
        self.dispatch_broadcast(payload, selection, EventOrigin::Local)
    }

    /// Emit an event to one connection wherever it lives in the cluster.
    ///
    /// # Errors
    ///
    /// - `RelayError::Delivery` - the connection is local and rejected the event
    /// - `RelayError::Transport` - the connection is not local and the
    ///   publish queue was full or closed
    pub fn emit_to(
        &self,
        connection_id: &str,
        event: &str,
        args: Vec<Value>,
    ) -> Result<EmitOutcome, RelayError> {
        self.dispatch_emit(connection_id, event, args, EventOrigin::Local)
    }

    #[instrument(
        skip_all,
        fields(namespace = %self.namespace(), origin = ?origin, rooms = selection.rooms.len())
    )]
    fn dispatch_broadcast(
        &self,
        payload: Value,
        selection: BroadcastSelection,
        origin: EventOrigin,
    ) -> Result<BroadcastReport, RelayError> {
        // Same rule for local and replayed broadcasts.
        if !payload.is_object() {
            return Err(RelayError::IncorrectPacket(
                "broadcast payload must be a JSON object".to_string(),
            ));
        }

        let report = self.inner.broadcaster.broadcast(&payload, &selection)?;

        if origin == EventOrigin::Local {
            let envelope =
                Envelope::broadcast(self.origin_id(), self.namespace(), payload, selection);
            self.enqueue(&envelope)?;
        }

        Ok(report)
    }

    #[instrument(skip_all, fields(namespace = %self.namespace(), origin = ?origin))]
    fn dispatch_emit(
        &self,
        connection_id: &str,
        event: &str,
        args: Vec<Value>,
        origin: EventOrigin,
    ) -> Result<EmitOutcome, RelayError> {
        if self.inner.broadcaster.emit_to(connection_id, event, &args)? {
            return Ok(EmitOutcome::DeliveredLocally);
        }

        match origin {
            EventOrigin::Local => {
                let envelope = Envelope::targeted_emit(
                    self.origin_id(),
                    self.namespace(),
                    connection_id,
                    event,
                    args,
                );
                self.enqueue(&envelope)?;
                Ok(EmitOutcome::Relayed)
            }
            EventOrigin::Remote => Ok(EmitOutcome::Undeliverable),
        }
    }

    fn enqueue(&self, envelope: &Envelope) -> Result<(), RelayError> {
        let kind = envelope.kind();
        let payload = Bytes::from(envelope.encode()?);

        self.inner
            .outbound
            .try_send(Outbound { kind, payload })
            .map_err(|e| {
                let reason = match e {
                    TrySendError::Full(_) => "publish queue full",
                    TrySendError::Closed(_) => "publish queue closed",
                };
                self.inner.stats.record_publish_failure();
                record_publish_failure(kind);
                warn!(
                    target: "relay.node",
                    namespace = %self.namespace(),
                    kind = kind,
                    reason = reason,
                    "Failed to queue envelope"
                );
                RelayError::Transport(format!("Failed to queue envelope: {reason}"))
            })
    }

    async fn publish(&self, outbound: Outbound) {
        let Outbound { kind, payload } = outbound;

        let start = Instant::now();
        let result = self
            .inner
            .transport
            .publisher()
            .publish(&self.inner.channel, payload)
            .await;
        record_publish_latency(kind, start.elapsed());

        match result {
            Ok(()) => {
                self.inner.stats.record_published();
                record_envelope_published(kind);
                debug!(
                    target: "relay.node",
                    namespace = %self.namespace(),
                    kind = kind,
                    "Envelope published"
                );
            }
            Err(e) => {
                self.inner.stats.record_publish_failure();
                record_publish_failure(kind);
                warn!(
                    target: "relay.node",
                    namespace = %self.namespace(),
                    kind = kind,
                    error = %e,
                    "Failed to publish envelope"
                );
            }
        }
    }

    /// Handle one inbound transport message.
    ///
    /// Never returns an error: every failure is logged, counted and
    /// reported as an outcome so the receive loop can continue.
    pub fn handle_message(&self, payload: &[u8]) -> ReplayOutcome {
        let outcome = self.replay(payload);

        match outcome {
            ReplayOutcome::Replayed => self.inner.stats.record_replayed(),
            ReplayOutcome::Undeliverable => self.inner.stats.record_undeliverable(),
            ReplayOutcome::SelfOrigin => self.inner.stats.record_self_origin(),
            ReplayOutcome::ForeignNamespace => self.inner.stats.record_foreign_namespace(),
            ReplayOutcome::Malformed => self.inner.stats.record_malformed(),
            ReplayOutcome::Failed => self.inner.stats.record_replay_failure(),
        }
        record_envelope_received(outcome.as_str());

        outcome
    }

    fn replay(&self, payload: &[u8]) -> ReplayOutcome {
        let envelope = match Envelope::decode(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(
                    target: "relay.node",
                    namespace = %self.namespace(),
                    bytes = payload.len(),
                    error = %e,
                    "Dropping malformed envelope"
                );
                return ReplayOutcome::Malformed;
            }
        };

        if envelope.origin_id == self.inner.origin_id {
            debug!(
                target: "relay.node",
                namespace = %self.namespace(),
                kind = envelope.kind(),
                "Ignoring own envelope"
            );
            return ReplayOutcome::SelfOrigin;
        }

        if envelope.namespace != self.namespace() {
            debug!(
                target: "relay.node",
                namespace = %self.namespace(),
                envelope_namespace = %envelope.namespace,
                "Ignoring envelope for different namespace"
            );
            return ReplayOutcome::ForeignNamespace;
        }

        let kind = envelope.kind();
        let origin_id = envelope.origin_id;
        let result = match envelope.event {
            RelayEvent::Broadcast { payload, selection } => self
                .dispatch_broadcast(payload, selection, EventOrigin::Remote)
                .map(|_| ReplayOutcome::Replayed),
            RelayEvent::TargetedEmit {
                target_id,
                event_name,
                event_args,
            } => self
                .dispatch_emit(&target_id, &event_name, event_args, EventOrigin::Remote)
                .map(|outcome| match outcome {
                    EmitOutcome::Undeliverable => ReplayOutcome::Undeliverable,
                    EmitOutcome::DeliveredLocally | EmitOutcome::Relayed => {
                        ReplayOutcome::Replayed
                    }
                }),
        };

        match result {
            Ok(outcome) => {
                debug!(
                    target: "relay.node",
                    namespace = %self.namespace(),
                    origin_id = %origin_id,
                    kind = kind,
                    outcome = outcome.as_str(),
                    "Remote envelope handled"
                );
                outcome
            }
            Err(e @ RelayError::IncorrectPacket(_)) => {
                warn!(
                    target: "relay.node",
                    namespace = %self.namespace(),
                    origin_id = %origin_id,
                    error = %e,
                    "Dropping remote broadcast"
                );
                ReplayOutcome::Malformed
            }
            Err(e) => {
                warn!(
                    target: "relay.node",
                    namespace = %self.namespace(),
                    origin_id = %origin_id,
                    kind = kind,
                    error = %e,
                    "Failed to replay remote envelope"
                );
                ReplayOutcome::Failed
            }
        }
    }

    /// Subscribe to the cluster pattern and spawn the publisher task and
    /// the receive loop.
    ///
    /// The subscription is established before this returns, so envelopes
    /// published afterwards are guaranteed to reach the loop. Both exit
    /// when `cancel_token` is cancelled; the receive loop also exits when
    /// the stream ends. Envelopes still queued at cancellation are dropped.
    ///
    /// # Errors
    ///
    /// - `RelayError::Transport` - the subscription failed
    /// - `RelayError::AlreadyStarted` - this relay (or a clone) was started before
    pub async fn start(
        &self,
        cancel_token: CancellationToken,
    ) -> Result<JoinHandle<()>, RelayError> {
        let stream = self
            .inner
            .transport
            .subscriber()
            .subscribe(&self.inner.pattern)
            .await?;

        let outbound_rx = self
            .inner
            .outbound_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(RelayError::AlreadyStarted)?;

        info!(
            target: "relay.node",
            namespace = %self.namespace(),
            origin_id = %self.origin_id(),
            pattern = %self.inner.pattern,
            "Relay started"
        );

        let span = tracing::info_span!(
            "relay.node",
            namespace = %self.namespace(),
            origin_id = %self.origin_id()
        );
        let publisher = self.clone().run_publisher(outbound_rx, cancel_token.clone());
        let receiver = self.clone().run_receiver(stream, cancel_token);
        Ok(tokio::spawn(
            async move {
                tokio::join!(publisher, receiver);
            }
            .instrument(span),
        ))
    }

    async fn run_publisher(
        self,
        mut outbound_rx: mpsc::Receiver<Outbound>,
        cancel_token: CancellationToken,
    ) {
        loop {
            tokio::select! {
                () = cancel_token.cancelled() => {
                    info!(
                        target: "relay.node",
                        namespace = %self.namespace(),
                        "Relay publisher received shutdown signal, exiting"
                    );
                    break;
                }
                outbound = outbound_rx.recv() => {
                    let Some(outbound) = outbound else {
                        break;
                    };
                    self.publish(outbound).await;
                }
            }
        }
    }

    async fn run_receiver(self, mut stream: MessageStream, cancel_token: CancellationToken) {
        loop {
            tokio::select! {
                () = cancel_token.cancelled() => {
                    info!(
                        target: "relay.node",
                        namespace = %self.namespace(),
                        "Relay receiver received shutdown signal, exiting"
                    );
                    break;
                }
                message = stream.next() => {
                    let Some(message) = message else {
                        warn!(
                            target: "relay.node",
                            namespace = %self.namespace(),
                            "Subscription stream closed, relay receiver exiting"
                        );
                        break;
                    };
                    self.handle_message(&message.payload);
                }
            }
        }
    }
}
