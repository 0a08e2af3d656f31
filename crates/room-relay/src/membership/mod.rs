//! Room membership for one process.
//!
//! - [`room`] - `Room`, a counted set of connection ids
//! - [`registry`] - `MembershipRegistry`, the lock-guarded bidirectional index

pub mod registry;
pub mod room;

pub use registry::{MembershipRegistry, MembershipSnapshot};
pub use room::Room;

/// Identifier of a live connection, unique within a namespace.
pub type ConnectionId = String;

/// Name of a room.
pub type RoomName = String;
