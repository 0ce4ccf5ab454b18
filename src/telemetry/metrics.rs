//! Metric instrument factories for hookq.
//!
//! Instruments come from the globally registered `MeterProvider`; with no
//! provider installed they are no-ops.

use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("hookq")
}

/// Counter: work items enqueued.
pub fn work_enqueued() -> Counter<u64> {
    meter()
        .u64_counter("hookq.work.enqueued")
        .with_description("Number of work items enqueued")
        .build()
}

/// Counter: store operations.
/// Labels: `operation` ("lease" | "lease_empty" | "acknowledge" | "release"
/// | "dead_letter" | "requeue").
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("hookq.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

pub fn record_queue_operation(operation: &'static str) {
    queue_operations().add(1, &[KeyValue::new("operation", operation)]);
}

/// Counter: delivery attempts by outcome.
/// Labels: `outcome` ("success" | "transient_failure" | "permanent_failure").
pub fn delivery_outcomes() -> Counter<u64> {
    meter()
        .u64_counter("hookq.delivery.outcomes")
        .with_description("Delivery attempts by outcome")
        .build()
}

/// Histogram: delivery attempt duration in milliseconds.
pub fn delivery_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("hookq.delivery.duration_ms")
        .with_description("Delivery attempt duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: items moved to the dead-letter state.
pub fn dead_lettered() -> Counter<u64> {
    meter()
        .u64_counter("hookq.work.dead_lettered")
        .with_description("Work items moved to dead-letter")
        .build()
}
