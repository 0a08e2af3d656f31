//! # Relay Test Utilities
//!
//! Shared test utilities for the room relay.
//!
//! ## Modules
//!
//! - `mock_connections` - Recording connections and a connection directory
//!   with per-connection failure injection
//! - `mock_encoder` - Counting and failing packet encoders
//! - `fixtures` - Relay nodes on a shared in-memory bus, a wire spy and
//!   wait helpers
//!
//! ## Usage
//!
//! ```rust,ignore
//! use relay_test_utils::*;
//! use room_relay::{BroadcastSelection, InMemoryBus};
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let bus = InMemoryBus::recording();
//!     let node_a = TestNode::start(&bus, "/").await;
//!     let node_b = TestNode::start(&bus, "/").await;
//!
//!     let alice = node_b.connect("alice", &["lobby"]);
//!     node_a
//!         .relay
//!         .broadcast(serde_json::json!({"msg": "hi"}), BroadcastSelection::room("lobby"))
//!         .unwrap();
//!
//!     assert!(wait_until(|| alice.packet_count() == 1).await);
//! }
//! ```

pub mod fixtures;
pub mod mock_connections;
pub mod mock_encoder;

pub use fixtures::*;
pub use mock_connections::*;
pub use mock_encoder::*;
