//! Observability for the room relay.
//!
//! Logging uses `tracing` with fixed targets per component
//! (`relay.membership`, `relay.broadcast`, `relay.node`, `relay.transport`).
//! Payload contents are never logged; room names and connection ids appear
//! in log fields but never as metric labels.
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `relay_rooms_active` | Gauge | none | Non-empty rooms in this process |
//! | `relay_broadcast_fanout` | Histogram | none | Connections reached per broadcast |
//! | `relay_delivery_failures_total` | Counter | none | Connections that rejected a packet |
//! | `relay_envelopes_published_total` | Counter | `kind` | Envelopes sent to the transport |
//! | `relay_publish_failures_total` | Counter | `kind` | Failed publishes |
//! | `relay_publish_latency_seconds` | Histogram | `kind` | Publish round trip |
//! | `relay_envelopes_received_total` | Counter | `outcome` | Handling of inbound envelopes |

pub mod metrics;
pub mod stats;

pub use metrics::init_metrics_recorder;
pub use stats::{RelayStats, RelayStatsSnapshot};
