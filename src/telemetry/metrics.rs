//! Metric instrument factories for tasq-rs.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"tasq-rs"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for tasq-rs instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("tasq-rs")
}

/// Counter: requests handed to the store.
/// Labels: `topic`, `result` ("ok" | "error").
pub fn requests_submitted() -> Counter<u64> {
    meter()
        .u64_counter("tasq.requests.submitted")
        .with_description("Number of requests submitted")
        .build()
}

/// Counter: how caller-side requests ended.
/// Labels: `topic`, `outcome` ("success" | "rejected" | "unknown_method" |
/// "timeout" | "error").
pub fn request_outcomes() -> Counter<u64> {
    meter()
        .u64_counter("tasq.requests.outcomes")
        .with_description("Number of completed requests by outcome")
        .build()
}

/// Histogram: caller-observed request latency in milliseconds.
/// Labels: `topic`.
pub fn request_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("tasq.request.duration_ms")
        .with_description("Request round-trip duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: tasks executed by workers.
/// Labels: `topic`, `status`.
pub fn tasks_executed() -> Counter<u64> {
    meter()
        .u64_counter("tasq.tasks.executed")
        .with_description("Number of tasks executed by workers")
        .build()
}

/// Counter: tasks dropped because their deadline passed before a worker
/// picked them up.
/// Labels: `topic`.
pub fn tasks_expired() -> Counter<u64> {
    meter()
        .u64_counter("tasq.tasks.expired")
        .with_description("Number of tasks dropped as expired")
        .build()
}

/// Counter: notifications coalesced because the scheduler was at capacity.
/// Labels: `topic`.
pub fn scheduler_bounces() -> Counter<u64> {
    meter()
        .u64_counter("tasq.scheduler.bounces")
        .with_description("Notifications deferred while at concurrency limit")
        .build()
}

/// Counter: store-level operations.
/// Labels: `backend`, `operation`.
pub fn store_operations() -> Counter<u64> {
    meter()
        .u64_counter("tasq.store.operations")
        .with_description("Number of store operations")
        .build()
}
