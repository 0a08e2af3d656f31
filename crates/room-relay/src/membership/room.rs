//! A room: a counted set of connection ids.

use std::collections::hash_set;
use std::collections::HashSet;

use super::ConnectionId;

/// Named group of connections used as a broadcast target.
///
/// The room's size is the size of its member set; a room never holds the
/// same connection twice.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Room {
    members: HashSet<ConnectionId>,
}

impl Room {
    /// Create an empty room.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection. Returns `false` if it was already a member.
    pub fn add(&mut self, connection_id: &str) -> bool {
        if self.members.contains(connection_id) {
            return false;
        }
        self.members.insert(connection_id.to_string())
    }

    /// Remove a connection. Returns `false` if it was not a member.
    pub fn remove(&mut self, connection_id: &str) -> bool {
        self.members.remove(connection_id)
    }

    #[must_use]
    pub fn contains(&self, connection_id: &str) -> bool {
        self.members.contains(connection_id)
    }

    /// Number of members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Iterate over member ids in arbitrary order.
    pub fn members(&self) -> hash_set::Iter<'_, ConnectionId> {
        self.members.iter()
    }
}
