//! Membership registry invariants under long operation sequences.
//!
//! Drives the registry with a deterministic pseudo-random mix of joins,
//! leaves and disconnects and checks after every step that:
//! - Both sides of the index describe the same relation
//! - No empty room survives
//! - Disconnected connections vanish from every room

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

use room_relay::MembershipRegistry;

const CONNECTIONS: [&str; 6] = ["c0", "c1", "c2", "c3", "c4", "c5"];
const ROOMS: [&str; 4] = ["lobby", "kitchen", "attic", "garden"];

/// Small xorshift generator so runs are reproducible.
struct Sequence(u64);

impl Sequence {
    fn next(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }

    fn pick<'a>(&mut self, items: &[&'a str]) -> &'a str {
        let index = (self.next() % items.len() as u64) as usize;
        items.get(index).copied().unwrap()
    }
}

#[test]
fn test_index_stays_consistent_across_random_operations() {
    for seed in [1_u64, 7, 42, 1234, 98_765] {
        let registry = MembershipRegistry::new();
        let mut sequence = Sequence(seed);

        for step in 0..500 {
            let connection = sequence.pick(&CONNECTIONS);
            match sequence.next() % 10 {
                0..=4 => registry.join(connection, sequence.pick(&ROOMS)),
                5..=7 => registry.leave(connection, sequence.pick(&ROOMS)),
                8 => registry.join_all(connection, [sequence.pick(&ROOMS), sequence.pick(&ROOMS)]),
                _ => {
                    registry.leave_all(connection);
                    assert!(registry.rooms_of(connection).is_none());
                    for room in ROOMS {
                        assert!(!registry.members_of(&[room]).contains(connection));
                    }
                }
            }

            let snapshot = registry.snapshot();
            assert!(
                snapshot.is_consistent(),
                "inconsistent index at seed {seed} step {step}: {snapshot:?}"
            );
            assert_eq!(snapshot.rooms.len(), registry.room_count());
        }
    }
}

#[test]
fn test_leave_all_clears_every_trace() {
    let registry = MembershipRegistry::new();
    registry.join_all("c0", ROOMS);
    registry.join("c1", "lobby");

    registry.leave_all("c0");

    assert!(registry.rooms_of("c0").is_none());
    assert_eq!(registry.room_count(), 1);
    assert_eq!(registry.room_size("lobby"), Some(1));
    assert_eq!(registry.members_of::<&str>(&[]), HashSet::from(["c1".to_string()]));
    assert!(registry.snapshot().is_consistent());
}

#[test]
fn test_universe_keeps_connections_with_no_rooms() {
    let registry = MembershipRegistry::new();
    registry.join("c0", "lobby");
    registry.leave("c0", "lobby");

    assert_eq!(registry.room_count(), 0);
    assert_eq!(registry.rooms_of("c0"), Some(HashSet::new()));
    assert!(registry.members_of::<&str>(&[]).contains("c0"));
}

#[test]
fn test_concurrent_writers_leave_consistent_index() {
    let registry = Arc::new(MembershipRegistry::new());

    let handles: Vec<_> = CONNECTIONS
        .iter()
        .enumerate()
        .map(|(i, connection)| {
            let registry = Arc::clone(&registry);
            let connection = (*connection).to_string();
            thread::spawn(move || {
                let mut sequence = Sequence(i as u64 + 11);
                for _ in 0..200 {
                    let room = sequence.pick(&ROOMS);
                    if sequence.next() % 3 == 0 {
                        registry.leave(&connection, room);
                    } else {
                        registry.join(&connection, room);
                    }
                }
                registry.join_all(&connection, ROOMS);
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let snapshot = registry.snapshot();
    assert!(snapshot.is_consistent());
    for room in ROOMS {
        assert_eq!(registry.room_size(room), Some(CONNECTIONS.len()));
    }
}
