//! `LocalBroadcaster` - fan-out of one packet to this process's connections.
//!
//! A broadcast runs in three steps:
//!
//! 1. Encode the payload once, before touching membership state.
//! 2. Resolve targets under the registry lock (rooms or the whole
//!    universe, minus exclusions, deduplicated).
//! 3. With the lock released, hand the encoded packet to every target.
//!    A failing target is logged and counted; the rest still receive it.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::delivery::{BroadcastFlags, ConnectionDirectory, DeliveryOptions, PacketEncoder};
use crate::errors::RelayError;
use crate::membership::{ConnectionId, MembershipRegistry, RoomName};
use crate::observability::metrics::{record_broadcast_fanout, record_delivery_failure};
use crate::observability::RelayStats;

/// Which connections a broadcast targets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastSelection {
    /// Target rooms in order. Empty means every known connection.
    #[serde(default)]
    pub rooms: Vec<RoomName>,

    /// Connections that must not receive the broadcast.
    #[serde(default)]
    pub except: HashSet<ConnectionId>,

    #[serde(default)]
    pub flags: BroadcastFlags,
}

impl BroadcastSelection {
    /// Every connection in the namespace.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Members of a single room.
    #[must_use]
    pub fn room(room: impl Into<RoomName>) -> Self {
        Self {
            rooms: vec![room.into()],
            ..Self::default()
        }
    }

    /// Members of several rooms.
    #[must_use]
    pub fn rooms<I, S>(rooms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<RoomName>,
    {
        Self {
            rooms: rooms.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Exclude a connection.
    #[must_use]
    pub fn except(mut self, connection_id: impl Into<ConnectionId>) -> Self {
        self.except.insert(connection_id.into());
        self
    }

    #[must_use]
    pub fn with_flags(mut self, flags: BroadcastFlags) -> Self {
        self.flags = flags;
        self
    }
}

/// Outcome of one local fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Ids resolved from the registry after exclusions.
    pub targeted: usize,
    /// Packets accepted by a live connection.
    pub delivered: usize,
    /// Targets with no live connection in the directory.
    pub missing: usize,
    /// Targets whose connection rejected the packet.
    pub failed: usize,
}

/// Resolves selections against the registry and delivers through the
/// connection directory.
pub struct LocalBroadcaster {
    namespace: String,
    registry: Arc<MembershipRegistry>,
    directory: Arc<dyn ConnectionDirectory>,
    encoder: Arc<dyn PacketEncoder>,
    stats: Arc<RelayStats>,
}

impl LocalBroadcaster {
    #[must_use]
    pub fn new(
        namespace: impl Into<String>,
        registry: Arc<MembershipRegistry>,
        directory: Arc<dyn ConnectionDirectory>,
        encoder: Arc<dyn PacketEncoder>,
        stats: Arc<RelayStats>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            registry,
            directory,
            encoder,
            stats,
        }
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<MembershipRegistry> {
        &self.registry
    }

    /// Deliver `payload` to every local connection selected by `selection`.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Encode` if the payload cannot be encoded; no
    /// connection receives anything in that case. Per-target delivery
    /// failures are reported in the returned [`BroadcastReport`], not as
    /// errors.
    #[instrument(skip_all, fields(namespace = %self.namespace, rooms = selection.rooms.len()))]
    pub fn broadcast(
        &self,
        payload: &Value,
        selection: &BroadcastSelection,
    ) -> Result<BroadcastReport, RelayError> {
        let packet = self.encoder.encode(&self.namespace, payload).map_err(|e| {
            warn!(
                target: "relay.broadcast",
                namespace = %self.namespace,
                error = %e,
                "Failed to encode broadcast payload"
            );
            RelayError::from(e)
        })?;

        let targets = self
            .registry
            .resolve_targets(&selection.rooms, &selection.except);
        let options = DeliveryOptions::from(selection.flags);

        let mut report = BroadcastReport {
            targeted: targets.len(),
            ..BroadcastReport::default()
        };

        for connection_id in &targets {
            let Some(connection) = self.directory.lookup(connection_id) else {
                report.missing += 1;
                continue;
            };

            match connection.deliver(&packet, options) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    report.failed += 1;
                    self.stats.record_delivery_failure();
                    record_delivery_failure();
                    warn!(
                        target: "relay.broadcast",
                        namespace = %self.namespace,
                        connection_id = %connection_id,
                        volatile = options.volatile,
                        error = %e,
                        "Delivery to connection failed"
                    );
                }
            }
        }

        self.stats.record_deliveries(report.delivered);
        record_broadcast_fanout(report.delivered);

        debug!(
            target: "relay.broadcast",
            namespace = %self.namespace,
            targeted = report.targeted,
            delivered = report.delivered,
            missing = report.missing,
            failed = report.failed,
            "Broadcast fan-out complete"
        );

        Ok(report)
    }

    /// Emit an event to one connection if it is live in this process.
    ///
    /// Returns `Ok(false)` when the connection is not local.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Delivery` if the local connection rejected the event.
    pub fn emit_to(
        &self,
        connection_id: &str,
        event: &str,
        args: &[Value],
    ) -> Result<bool, RelayError> {
        let Some(connection) = self.directory.lookup(connection_id) else {
            return Ok(false);
        };

        connection.emit(event, args).map_err(|e| {
            self.stats.record_delivery_failure();
            record_delivery_failure();
            warn!(
                target: "relay.broadcast",
                namespace = %self.namespace,
                connection_id = %connection_id,
                event = %event,
                error = %e,
                "Targeted emit failed"
            );
            RelayError::from(e)
        })?;

        self.stats.record_deliveries(1);
        Ok(true)
    }

    /// Ids of live connections in `rooms` (or in the whole namespace when
    /// `rooms` is empty), deduplicated in room order.
    #[must_use]
    pub fn clients<S: AsRef<str>>(&self, rooms: &[S]) -> Vec<ConnectionId> {
        self.registry
            .resolve_targets(rooms, &HashSet::new())
            .into_iter()
            .filter(|id| self.directory.lookup(id).is_some())
            .collect()
    }

    /// Rooms a connection belongs to, or `None` if it has no membership.
    #[must_use]
    pub fn client_rooms(&self, connection_id: &str) -> Option<HashSet<RoomName>> {
        self.registry.rooms_of(connection_id)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::delivery::{Connection, EncodedPacket, JsonPacketEncoder};
    use crate::errors::{DeliveryError, EncodeError};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingConnection {
        packets: Mutex<Vec<(EncodedPacket, DeliveryOptions)>>,
        events: Mutex<Vec<(String, Vec<Value>)>>,
        fail: bool,
    }

    impl Connection for RecordingConnection {
        fn deliver(
            &self,
            packet: &EncodedPacket,
            options: DeliveryOptions,
        ) -> Result<(), DeliveryError> {
            if self.fail {
                return Err(DeliveryError::Closed("broken".to_string()));
            }
            self.packets.lock().unwrap().push((packet.clone(), options));
            Ok(())
        }

        fn emit(&self, event: &str, args: &[Value]) -> Result<(), DeliveryError> {
            if self.fail {
                return Err(DeliveryError::Closed("broken".to_string()));
            }
            self.events
                .lock()
                .unwrap()
                .push((event.to_string(), args.to_vec()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct Directory {
        connections: HashMap<String, Arc<RecordingConnection>>,
    }

    impl Directory {
        fn with(mut self, id: &str) -> Self {
            self.connections
                .insert(id.to_string(), Arc::new(RecordingConnection::default()));
            self
        }

        fn with_failing(mut self, id: &str) -> Self {
            self.connections.insert(
                id.to_string(),
                Arc::new(RecordingConnection {
                    fail: true,
                    ..RecordingConnection::default()
                }),
            );
            self
        }

        fn received(&self, id: &str) -> usize {
            self.connections.get(id).unwrap().packets.lock().unwrap().len()
        }
    }

    impl ConnectionDirectory for Directory {
        fn lookup(&self, connection_id: &str) -> Option<Arc<dyn Connection>> {
            self.connections
                .get(connection_id)
                .map(|c| Arc::clone(c) as Arc<dyn Connection>)
        }
    }

    struct CountingEncoder {
        calls: AtomicUsize,
    }

    impl PacketEncoder for CountingEncoder {
        fn encode(&self, namespace: &str, payload: &Value) -> Result<EncodedPacket, EncodeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            JsonPacketEncoder.encode(namespace, payload)
        }
    }

    struct FailingEncoder;

    impl PacketEncoder for FailingEncoder {
        fn encode(&self, _namespace: &str, _payload: &Value) -> Result<EncodedPacket, EncodeError> {
            Err(EncodeError::Unencodable("test".to_string()))
        }
    }

    fn broadcaster(
        directory: Arc<Directory>,
        encoder: Arc<dyn PacketEncoder>,
    ) -> (LocalBroadcaster, Arc<MembershipRegistry>) {
        let registry = Arc::new(MembershipRegistry::new());
        let broadcaster = LocalBroadcaster::new(
            "/",
            Arc::clone(&registry),
            directory,
            encoder,
            RelayStats::new(),
        );
        (broadcaster, registry)
    }

    #[test]
    fn test_overlapping_rooms_deliver_once() {
        let directory = Arc::new(Directory::default().with("a").with("b"));
        let encoder = Arc::new(CountingEncoder {
            calls: AtomicUsize::new(0),
        });
        let (broadcaster, registry) = broadcaster(Arc::clone(&directory), encoder.clone());
        registry.join_all("a", ["r1", "r2", "r3"]);
        registry.join_all("b", ["r2", "r3"]);

        let report = broadcaster
            .broadcast(&json!({"n": 1}), &BroadcastSelection::rooms(["r1", "r2", "r3"]))
            .unwrap();

        assert_eq!(report.targeted, 2);
        assert_eq!(report.delivered, 2);
        assert_eq!(directory.received("a"), 1);
        assert_eq!(directory.received("b"), 1);
        assert_eq!(encoder.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_except_is_never_delivered() {
        let directory = Arc::new(Directory::default().with("a").with("b"));
        let (broadcaster, registry) =
            broadcaster(Arc::clone(&directory), Arc::new(JsonPacketEncoder));
        registry.join("a", "room");
        registry.join("b", "room");

        broadcaster
            .broadcast(&json!({}), &BroadcastSelection::room("room").except("b"))
            .unwrap();

        assert_eq!(directory.received("a"), 1);
        assert_eq!(directory.received("b"), 0);
    }

    #[test]
    fn test_empty_rooms_target_whole_universe() {
        let directory = Arc::new(Directory::default().with("a").with("b").with("c"));
        let (broadcaster, registry) =
            broadcaster(Arc::clone(&directory), Arc::new(JsonPacketEncoder));
        registry.join("a", "x");
        registry.join("b", "y");
        // "c" is live and registered but has never joined a room.
        registry.register("c");

        let report = broadcaster
            .broadcast(&json!({}), &BroadcastSelection::all().except("a"))
            .unwrap();

        assert_eq!(report.delivered, 2);
        assert_eq!(directory.received("a"), 0);
        assert_eq!(directory.received("b"), 1);
        assert_eq!(directory.received("c"), 1);
    }

    #[test]
    fn test_failed_delivery_does_not_abort_fanout() {
        let directory = Arc::new(
            Directory::default()
                .with("a")
                .with_failing("broken")
                .with("c"),
        );
        let (broadcaster, registry) =
            broadcaster(Arc::clone(&directory), Arc::new(JsonPacketEncoder));
        for id in ["a", "broken", "c", "gone"] {
            registry.join(id, "room");
        }

        let report = broadcaster
            .broadcast(&json!({}), &BroadcastSelection::room("room"))
            .unwrap();

        assert_eq!(report.targeted, 4);
        assert_eq!(report.delivered, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.missing, 1);
        assert_eq!(directory.received("a"), 1);
        assert_eq!(directory.received("c"), 1);
    }

    #[test]
    fn test_encode_failure_is_reported_and_leaves_registry_untouched() {
        let directory = Arc::new(Directory::default().with("a"));
        let (broadcaster, registry) = broadcaster(Arc::clone(&directory), Arc::new(FailingEncoder));
        registry.join("a", "room");
        let before = registry.snapshot();

        let result = broadcaster.broadcast(&json!({}), &BroadcastSelection::room("room"));

        assert!(matches!(result, Err(RelayError::Encode(_))));
        assert_eq!(directory.received("a"), 0);
        assert_eq!(registry.snapshot(), before);
    }

    #[test]
    fn test_flags_reach_connection() {
        let directory = Arc::new(Directory::default().with("a"));
        let (broadcaster, registry) =
            broadcaster(Arc::clone(&directory), Arc::new(JsonPacketEncoder));
        registry.join("a", "room");

        broadcaster
            .broadcast(
                &json!({}),
                &BroadcastSelection::room("room").with_flags(BroadcastFlags::volatile()),
            )
            .unwrap();

        let packets = directory.connections.get("a").unwrap().packets.lock().unwrap();
        let (_, options) = packets.first().unwrap();
        assert!(options.pre_encoded);
        assert!(options.volatile);
        assert!(!options.compress);
    }

    #[test]
    fn test_emit_to_local_and_missing() {
        let directory = Arc::new(Directory::default().with("a").with_failing("broken"));
        let (broadcaster, _registry) =
            broadcaster(Arc::clone(&directory), Arc::new(JsonPacketEncoder));

        assert!(broadcaster.emit_to("a", "ping", &[json!(1)]).unwrap());
        assert!(!broadcaster.emit_to("elsewhere", "ping", &[]).unwrap());
        assert!(matches!(
            broadcaster.emit_to("broken", "ping", &[]),
            Err(RelayError::Delivery(_))
        ));

        let events = directory.connections.get("a").unwrap().events.lock().unwrap();
        assert_eq!(events.as_slice(), &[("ping".to_string(), vec![json!(1)])]);
    }

    #[test]
    fn test_clients_filters_to_live_connections() {
        let directory = Arc::new(Directory::default().with("a").with("b"));
        let (broadcaster, registry) =
            broadcaster(Arc::clone(&directory), Arc::new(JsonPacketEncoder));
        registry.join_all("a", ["x", "y"]);
        registry.join("b", "y");
        registry.join("stale", "y");

        let mut in_y = broadcaster.clients(&["x", "y"]);
        in_y.sort();
        assert_eq!(in_y, vec!["a".to_string(), "b".to_string()]);

        assert_eq!(broadcaster.clients::<&str>(&[]).len(), 2);
        let expected: HashSet<RoomName> = ["x".to_string(), "y".to_string()].into_iter().collect();
        assert_eq!(broadcaster.client_rooms("a").unwrap(), expected);
    }
}
