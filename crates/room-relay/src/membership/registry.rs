//! `MembershipRegistry` - per-process room/connection index.
//!
//! Keeps two maps in lockstep:
//!
//! - `rooms`: room name -> [`Room`]
//! - `memberships`: connection id -> set of room names
//!
//! For every connection `c` and room `r`, `c` is a member of `rooms[r]`
//! exactly when `r` is in `memberships[c]`. Rooms are created on first
//! join and removed as soon as they are empty. A connection's reverse
//! entry is created by `register` or its first join and removed only by
//! `leave_all`, so a connection with no rooms is still part of the
//! broadcast universe until it disconnects.
//!
//! All state sits behind one mutex. Every operation takes it exactly
//! once, which makes `join_all` atomic with respect to readers.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, trace};

use super::room::Room;
use super::{ConnectionId, RoomName};
use crate::observability::metrics::{decrement_rooms_active, increment_rooms_active};

#[derive(Debug, Default)]
struct RegistryState {
    rooms: HashMap<RoomName, Room>,
    memberships: HashMap<ConnectionId, HashSet<RoomName>>,
}

impl RegistryState {
    /// Returns `(added, room_created)`.
    fn join(&mut self, connection_id: &str, room: &str) -> (bool, bool) {
        self.memberships
            .entry(connection_id.to_string())
            .or_default()
            .insert(room.to_string());
        let created = !self.rooms.contains_key(room);
        let added = self
            .rooms
            .entry(room.to_string())
            .or_default()
            .add(connection_id);
        (added, created)
    }

    /// Remove `connection_id` from `room`, dropping the room once empty.
    /// Returns `(removed, room_deleted)`.
    fn remove_from_room(&mut self, connection_id: &str, room: &str) -> (bool, bool) {
        let Some(entry) = self.rooms.get_mut(room) else {
            return (false, false);
        };
        let removed = entry.remove(connection_id);
        let deleted = entry.is_empty();
        if deleted {
            self.rooms.remove(room);
        }
        (removed, deleted)
    }

    /// Members of `rooms` (every known connection when `rooms` is empty),
    /// minus `except`, deduplicated in first-seen order.
    fn resolve<S: AsRef<str>>(
        &self,
        rooms: &[S],
        except: &HashSet<ConnectionId>,
    ) -> Vec<ConnectionId> {
        if rooms.is_empty() {
            return self
                .memberships
                .keys()
                .filter(|id| !except.contains(*id))
                .cloned()
                .collect();
        }

        let mut seen: HashSet<&str> = HashSet::new();
        let mut targets = Vec::new();
        for room in rooms.iter().filter_map(|name| self.rooms.get(name.as_ref())) {
            for id in room.members() {
                if except.contains(id) || !seen.insert(id.as_str()) {
                    continue;
                }
                targets.push(id.clone());
            }
        }
        targets
    }
}

/// Point-in-time copy of both sides of the index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipSnapshot {
    /// Room name -> member ids.
    pub rooms: HashMap<RoomName, HashSet<ConnectionId>>,
    /// Connection id -> room names.
    pub memberships: HashMap<ConnectionId, HashSet<RoomName>>,
}

impl MembershipSnapshot {
    /// Returns true when both maps describe the same relation and no
    /// empty room is present.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        let forward_ok = self.rooms.iter().all(|(room, members)| {
            !members.is_empty()
                && members.iter().all(|id| {
                    self.memberships
                        .get(id)
                        .is_some_and(|rooms| rooms.contains(room))
                })
        });
        let reverse_ok = self.memberships.iter().all(|(id, rooms)| {
            rooms.iter().all(|room| {
                self.rooms
                    .get(room)
                    .is_some_and(|members| members.contains(id))
            })
        });
        forward_ok && reverse_ok
    }
}

/// Per-process index of room/connection relationships.
///
/// No operation fails: unknown connections and rooms produce empty
/// results, since callers routinely race with disconnects.
#[derive(Debug, Default)]
pub struct MembershipRegistry {
    state: Mutex<RegistryState>,
}

impl MembershipRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make a connection part of the broadcast universe without joining
    /// any room. Idempotent; existing memberships are kept.
    pub fn register(&self, connection_id: &str) {
        let inserted = {
            let mut state = self.state();
            if state.memberships.contains_key(connection_id) {
                false
            } else {
                state
                    .memberships
                    .insert(connection_id.to_string(), HashSet::new());
                true
            }
        };

        if inserted {
            trace!(
                target: "relay.membership",
                connection_id = %connection_id,
                "Registered connection"
            );
        }
    }

    /// Add a connection to a room, creating the room if needed.
    pub fn join(&self, connection_id: &str, room: &str) {
        let (added, created) = self.state().join(connection_id, room);
        if created {
            increment_rooms_active(1);
        }

        if added {
            trace!(
                target: "relay.membership",
                connection_id = %connection_id,
                room = %room,
                "Joined room"
            );
        }
    }

    /// Add a connection to several rooms under a single lock acquisition.
    pub fn join_all<I, S>(&self, connection_id: &str, rooms: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let created = {
            let mut state = self.state();
            rooms
                .into_iter()
                .filter(|room| state.join(connection_id, room.as_ref()).1)
                .count()
        };
        increment_rooms_active(created);
    }

    /// Remove a connection from one room. No-op if it is not a member.
    pub fn leave(&self, connection_id: &str, room: &str) {
        let (removed, deleted) = {
            let mut state = self.state();
            if let Some(rooms) = state.memberships.get_mut(connection_id) {
                rooms.remove(room);
            }
            state.remove_from_room(connection_id, room)
        };
        if deleted {
            decrement_rooms_active(1);
        }

        if removed {
            trace!(
                target: "relay.membership",
                connection_id = %connection_id,
                room = %room,
                "Left room"
            );
        }
    }

    /// Remove a connection from every room and forget it (disconnect path).
    pub fn leave_all(&self, connection_id: &str) {
        let (left, deleted) = {
            let mut state = self.state();
            let rooms = state.memberships.remove(connection_id).unwrap_or_default();
            let deleted = rooms
                .iter()
                .filter(|room| state.remove_from_room(connection_id, room).1)
                .count();
            (rooms.len(), deleted)
        };
        decrement_rooms_active(deleted);

        debug!(
            target: "relay.membership",
            connection_id = %connection_id,
            rooms_left = left,
            "Removed connection from all rooms"
        );
    }

    /// Deduplicated members of `rooms`, or every known connection when
    /// `rooms` is empty.
    pub fn members_of<S: AsRef<str>>(&self, rooms: &[S]) -> HashSet<ConnectionId> {
        self.state()
            .resolve(rooms, &HashSet::new())
            .into_iter()
            .collect()
    }

    /// Broadcast target resolution: like [`Self::members_of`] minus
    /// `except`, in room order with duplicates removed.
    pub fn resolve_targets<S: AsRef<str>>(
        &self,
        rooms: &[S],
        except: &HashSet<ConnectionId>,
    ) -> Vec<ConnectionId> {
        self.state().resolve(rooms, except)
    }

    /// Rooms a connection belongs to, or `None` if the connection is unknown.
    #[must_use]
    pub fn rooms_of(&self, connection_id: &str) -> Option<HashSet<RoomName>> {
        self.state().memberships.get(connection_id).cloned()
    }

    /// Member count of a room, or `None` if the room does not exist.
    #[must_use]
    pub fn room_size(&self, room: &str) -> Option<usize> {
        self.state().rooms.get(room).map(Room::len)
    }

    /// Number of non-empty rooms.
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.state().rooms.len()
    }

    /// Number of connections in the reverse index.
    #[must_use]
    pub fn member_count(&self) -> usize {
        self.state().memberships.len()
    }

    /// Copy both sides of the index.
    #[must_use]
    pub fn snapshot(&self) -> MembershipSnapshot {
        let state = self.state();
        MembershipSnapshot {
            rooms: state
                .rooms
                .iter()
                .map(|(name, room)| (name.clone(), room.members().cloned().collect()))
                .collect(),
            memberships: state.memberships.clone(),
        }
    }
}

impl Drop for MembershipRegistry {
    fn drop(&mut self) {
        let remaining = self
            .state
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .rooms
            .len();
        decrement_rooms_active(remaining);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn set(items: &[&str]) -> HashSet<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_join_creates_room_lazily() {
        let registry = MembershipRegistry::new();
        assert_eq!(registry.room_size("lobby"), None);

        registry.join("conn-1", "lobby");

        assert_eq!(registry.room_size("lobby"), Some(1));
        assert_eq!(registry.rooms_of("conn-1"), Some(set(&["lobby"])));
        assert!(registry.snapshot().is_consistent());
    }

    #[test]
    fn test_join_is_idempotent() {
        let registry = MembershipRegistry::new();
        registry.join("conn-1", "lobby");
        registry.join("conn-1", "lobby");

        assert_eq!(registry.room_size("lobby"), Some(1));
        assert_eq!(registry.member_count(), 1);
    }

    #[test]
    fn test_leave_deletes_empty_room() {
        let registry = MembershipRegistry::new();
        registry.join("conn-1", "lobby");
        registry.join("conn-2", "lobby");

        registry.leave("conn-1", "lobby");
        assert_eq!(registry.room_size("lobby"), Some(1));

        registry.leave("conn-2", "lobby");
        assert_eq!(registry.room_size("lobby"), None);
        assert_eq!(registry.room_count(), 0);
        assert!(registry.snapshot().is_consistent());
    }

    #[test]
    fn test_leave_keeps_connection_in_universe() {
        let registry = MembershipRegistry::new();
        registry.join("conn-1", "lobby");
        registry.leave("conn-1", "lobby");

        assert_eq!(registry.rooms_of("conn-1"), Some(HashSet::new()));
        assert_eq!(registry.members_of::<&str>(&[]), set(&["conn-1"]));
    }

    #[test]
    fn test_leave_unknown_is_noop() {
        let registry = MembershipRegistry::new();
        registry.join("conn-1", "lobby");

        registry.leave("conn-2", "lobby");
        registry.leave("conn-1", "no-such-room");

        assert_eq!(registry.room_size("lobby"), Some(1));
        assert_eq!(registry.rooms_of("conn-2"), None);
        assert!(registry.snapshot().is_consistent());
    }

    #[test]
    fn test_leave_all_clears_everything() {
        let registry = MembershipRegistry::new();
        registry.join_all("conn-1", ["a", "b", "c"]);
        registry.join("conn-2", "b");

        registry.leave_all("conn-1");

        assert_eq!(registry.rooms_of("conn-1"), None);
        assert_eq!(registry.room_size("a"), None);
        assert_eq!(registry.room_size("b"), Some(1));
        assert_eq!(registry.room_size("c"), None);
        let snapshot = registry.snapshot();
        assert!(snapshot.rooms.values().all(|m| !m.contains("conn-1")));
        assert!(snapshot.is_consistent());
    }

    #[test]
    fn test_leave_all_unknown_is_noop() {
        let registry = MembershipRegistry::new();
        registry.leave_all("ghost");
        assert_eq!(registry.member_count(), 0);
    }

    #[test]
    fn test_members_of_deduplicates_overlapping_rooms() {
        let registry = MembershipRegistry::new();
        registry.join_all("conn-1", ["a", "b"]);
        registry.join("conn-2", "b");
        registry.join("conn-3", "c");

        assert_eq!(registry.members_of(&["a", "b"]), set(&["conn-1", "conn-2"]));
        assert_eq!(registry.members_of(&["missing"]), HashSet::new());
    }

    #[test]
    fn test_members_of_without_rooms_returns_universe() {
        let registry = MembershipRegistry::new();
        registry.join("conn-1", "a");
        registry.join("conn-2", "b");

        assert_eq!(
            registry.members_of::<String>(&[]),
            set(&["conn-1", "conn-2"])
        );
    }

    #[test]
    fn test_resolve_targets_orders_by_room_and_excludes() {
        let registry = MembershipRegistry::new();
        registry.join("conn-1", "a");
        registry.join_all("conn-2", ["a", "b"]);
        registry.join("conn-3", "b");

        let targets = registry.resolve_targets(&["b", "a"], &set(&["conn-3"]));

        assert_eq!(targets.len(), 2);
        assert_eq!(targets.iter().collect::<HashSet<_>>().len(), 2);
        assert!(!targets.contains(&"conn-3".to_string()));
        // conn-2 is reached through "b" first; conn-1 only through "a".
        assert_eq!(targets.last().unwrap(), "conn-1");
    }

    #[test]
    fn test_join_all_is_atomic_for_readers() {
        let registry = Arc::new(MembershipRegistry::new());
        let rooms: Vec<String> = (0..50).map(|i| format!("room-{i}")).collect();

        let writer = {
            let registry = Arc::clone(&registry);
            let rooms = rooms.clone();
            std::thread::spawn(move || {
                for i in 0..200 {
                    let id = format!("conn-{i}");
                    registry.join_all(&id, &rooms);
                }
            })
        };

        // A reader sees either none or all of a connection's rooms.
        for _ in 0..200 {
            let snapshot = registry.snapshot();
            for joined in snapshot.memberships.values() {
                assert_eq!(joined.len(), rooms.len());
            }
        }

        writer.join().unwrap();
        assert_eq!(registry.member_count(), 200);
        assert!(registry.snapshot().is_consistent());
    }

    #[test]
    fn test_register_adds_connection_to_universe() {
        let registry = MembershipRegistry::new();
        registry.join("conn-1", "lobby");
        registry.register("conn-2");

        assert_eq!(registry.rooms_of("conn-2"), Some(HashSet::new()));
        assert_eq!(registry.members_of::<&str>(&[]), set(&["conn-1", "conn-2"]));
        assert_eq!(registry.room_count(), 1);
        assert!(registry.snapshot().is_consistent());

        registry.leave_all("conn-2");
        assert_eq!(registry.rooms_of("conn-2"), None);
    }

    #[test]
    fn test_register_keeps_existing_rooms() {
        let registry = MembershipRegistry::new();
        registry.join_all("conn-1", ["a", "b"]);

        registry.register("conn-1");

        assert_eq!(registry.rooms_of("conn-1"), Some(set(&["a", "b"])));
    }

    fn rooms_active_gauge(snapshotter: &metrics_util::debugging::Snapshotter) -> f64 {
        use metrics_util::debugging::DebugValue;

        snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .find_map(|(key, _, _, value)| match value {
                DebugValue::Gauge(v) if key.key().name() == "relay_rooms_active" => {
                    Some(v.into_inner())
                }
                _ => None,
            })
            .unwrap_or(0.0)
    }

    #[test]
    fn test_rooms_gauge_sums_across_registries() {
        use metrics_util::debugging::DebuggingRecorder;

        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        let root = MembershipRegistry::new();
        let admin = MembershipRegistry::new();

        metrics::with_local_recorder(&recorder, || {
            root.join_all("c1", ["a", "b", "c"]);
            admin.join("c2", "x");
            admin.join("c3", "x");
        });
        assert!((rooms_active_gauge(&snapshotter) - 4.0).abs() < f64::EPSILON);

        metrics::with_local_recorder(&recorder, || {
            root.leave("c1", "a");
            admin.leave_all("c2");
        });
        assert!((rooms_active_gauge(&snapshotter) - 3.0).abs() < f64::EPSILON);

        metrics::with_local_recorder(&recorder, || drop(root));
        assert!((rooms_active_gauge(&snapshotter) - 1.0).abs() < f64::EPSILON);
    }
}
