//! Room Relay Library
//!
//! Room membership and broadcast fan-out for a real-time connection
//! server, extended across processes through a publish/subscribe bus:
//!
//! - Bidirectional room membership index per process
//! - Local fan-out of one pre-encoded packet to many connections
//! - Cross-process relay of broadcasts and targeted emits
//! - Self-echo and cross-namespace filtering on receipt
//!
//! # Architecture
//!
//! ```text
//! Relay (one per namespace, cheap to clone)
//! ├── LocalBroadcaster
//! │   ├── MembershipRegistry (room <-> connection index, one mutex)
//! │   ├── ConnectionDirectory (embedding server's live connections)
//! │   └── PacketEncoder
//! ├── publish queue -> publisher task -> "<prefix>#<origin_id>"
//! └── receive loop <- Subscriber "<prefix>#*"
//! ```
//!
//! Each logical event is published once, by the instance that raised it.
//! Receivers replay remote events locally and never publish them again.
//!
//! # Modules
//!
//! - [`membership`] - rooms and the membership registry
//! - [`broadcaster`] - local fan-out
//! - [`relay`] - envelopes and the distributed relay
//! - [`transport`] - pub/sub traits, Redis and in-memory implementations
//! - [`delivery`] - connection and encoder interfaces
//! - [`config`] - configuration from environment
//! - [`errors`] - error types
//! - [`observability`] - metrics and counters

pub mod broadcaster;
pub mod config;
pub mod delivery;
pub mod errors;
pub mod membership;
pub mod observability;
pub mod relay;
pub mod transport;

pub use broadcaster::{BroadcastReport, BroadcastSelection, LocalBroadcaster};
pub use config::Config;
pub use errors::RelayError;
pub use membership::{ConnectionId, MembershipRegistry, RoomName};
pub use relay::{EmitOutcome, Relay, ReplayOutcome, DEFAULT_NAMESPACE};
pub use transport::{InMemoryBus, RelayTransport};
