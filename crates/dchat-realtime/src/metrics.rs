//! Real-time hub metrics.
//!
//! Uses the global OpenTelemetry meter provider, which must be installed by
//! the host application. Without one every recording is a no-op.

use opentelemetry::metrics::{Counter, Gauge, Meter};
use opentelemetry::KeyValue;
use std::sync::OnceLock;

use crate::CloseReason;

static METER: OnceLock<Meter> = OnceLock::new();

fn meter() -> &'static Meter {
    METER.get_or_init(|| opentelemetry::global::meter("dchat-realtime"))
}

// ============================================================================
// Counters
// ============================================================================

/// Counter for inbound envelopes handed to the router.
pub fn envelopes_routed() -> Counter<u64> {
    meter()
        .u64_counter("dchat.envelopes.routed")
        .with_description("Total inbound envelopes routed")
        .with_unit("envelope")
        .build()
}

/// Counter for connections closed by the server (supersede, backpressure, keepalive).
pub fn connections_evicted() -> Counter<u64> {
    meter()
        .u64_counter("dchat.connections.evicted")
        .with_description("Total connections closed by the server")
        .with_unit("connection")
        .build()
}

/// Counter for failed persistence calls.
pub fn persistence_failures() -> Counter<u64> {
    meter()
        .u64_counter("dchat.persistence.failures")
        .with_description("Total failed persistence operations")
        .with_unit("operation")
        .build()
}

// ============================================================================
// Gauges
// ============================================================================

/// Gauge for registered connections.
pub fn connections_active() -> Gauge<i64> {
    meter()
        .i64_gauge("dchat.connections.active")
        .with_description("Current number of registered connections")
        .with_unit("connection")
        .build()
}

// ============================================================================
// Recording helpers
// ============================================================================

/// Record an envelope being routed.
pub fn record_routed(kind: &'static str) {
    envelopes_routed().add(1, &[KeyValue::new("kind", kind)]);
}

/// Record a server-initiated close.
pub fn record_eviction(reason: CloseReason) {
    connections_evicted().add(1, &[KeyValue::new("reason", reason.as_str())]);
}

/// Record a failed persistence operation.
pub fn record_persistence_failure(operation: &'static str) {
    persistence_failures().add(1, &[KeyValue::new("operation", operation)]);
}

/// Record the current registry size.
pub fn record_connection_count(count: usize) {
    connections_active().record(count as i64, &[]);
}
