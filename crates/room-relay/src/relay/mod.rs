//! Distributed relay: envelopes and the per-namespace relay node.

pub mod envelope;
pub mod node;

pub use envelope::{Envelope, RelayEvent};
pub use node::{EmitOutcome, EventOrigin, Relay, ReplayOutcome, DEFAULT_NAMESPACE};
