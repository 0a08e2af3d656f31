//! Metrics definitions for the room relay
//!
//! All metrics follow Prometheus naming conventions:
//! - `relay_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `kind`: 2 values (broadcast, targeted_emit)
//! - `outcome`: 6 values (replayed, undeliverable, self_origin,
//!   foreign_namespace, malformed, failed)
//!
//! Room names and connection ids are never used as labels.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize Prometheus metrics recorder and return the handle
/// for serving metrics via HTTP.
///
/// Must be called before any metrics are recorded.
///
/// # Errors
///
/// Returns error if Prometheus recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Publish latency buckets - one round trip to the pub/sub broker
        .set_buckets_for_metric(
            Matcher::Full("relay_publish_latency_seconds".to_string()),
            &[
                0.0005, 0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000,
            ],
        )
        .map_err(|e| format!("Failed to set publish latency buckets: {e}"))?
        // Fan-out size buckets - connections reached per broadcast
        .set_buckets_for_metric(
            Matcher::Full("relay_broadcast_fanout".to_string()),
            &[
                0.0, 1.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0, 10000.0,
            ],
        )
        .map_err(|e| format!("Failed to set fan-out buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Membership Metrics (Gauges)
// ============================================================================

/// Record rooms created in this process.
///
/// Metric: `relay_rooms_active`
/// Labels: none
///
/// Every registry in the process adjusts the same gauge, so it always
/// reflects the total across namespaces.
pub fn increment_rooms_active(count: usize) {
    if count > 0 {
        #[allow(clippy::cast_precision_loss)]
        gauge!("relay_rooms_active").increment(count as f64);
    }
}

/// Record rooms deleted in this process.
///
/// Metric: `relay_rooms_active`
/// Labels: none
pub fn decrement_rooms_active(count: usize) {
    if count > 0 {
        #[allow(clippy::cast_precision_loss)]
        gauge!("relay_rooms_active").decrement(count as f64);
    }
}

// ============================================================================
// Fan-out Metrics
// ============================================================================

/// Record how many connections one broadcast reached locally.
///
/// Metric: `relay_broadcast_fanout`
/// Labels: none
pub fn record_broadcast_fanout(delivered: usize) {
    #[allow(clippy::cast_precision_loss)]
    histogram!("relay_broadcast_fanout").record(delivered as f64);
}

/// Record a delivery rejected by a connection.
///
/// Metric: `relay_delivery_failures_total`
/// Labels: none
pub fn record_delivery_failure() {
    counter!("relay_delivery_failures_total").increment(1);
}

// ============================================================================
// Envelope Metrics (Counters, Histograms)
// ============================================================================

/// Record an envelope published to the transport.
///
/// Metric: `relay_envelopes_published_total`
/// Labels: `kind`
pub fn record_envelope_published(kind: &str) {
    counter!("relay_envelopes_published_total", "kind" => kind.to_string()).increment(1);
}

/// Record a failed publish.
///
/// Metric: `relay_publish_failures_total`
/// Labels: `kind`
pub fn record_publish_failure(kind: &str) {
    counter!("relay_publish_failures_total", "kind" => kind.to_string()).increment(1);
}

/// Record publish latency.
///
/// Metric: `relay_publish_latency_seconds`
/// Labels: `kind`
pub fn record_publish_latency(kind: &str, duration: Duration) {
    histogram!("relay_publish_latency_seconds", "kind" => kind.to_string())
        .record(duration.as_secs_f64());
}

/// Record how an envelope from the transport was handled.
///
/// Metric: `relay_envelopes_received_total`
/// Labels: `outcome`
pub fn record_envelope_received(outcome: &str) {
    counter!("relay_envelopes_received_total", "outcome" => outcome.to_string()).increment(1);
}
