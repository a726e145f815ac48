//! Metric instrument factories for fetchq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"fetchq"` meter.

use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};

/// Returns the shared meter for fetchq instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("fetchq")
}

/// Counter: work items ingested.
/// Labels: `result` ("inserted" | "updated").
pub fn items_ingested() -> Counter<u64> {
    meter()
        .u64_counter("fetchq.items.ingested")
        .with_description("Number of work items ingested")
        .build()
}

/// Counter: claim calls.
/// Labels: `stage`, `result` ("ok" | "empty").
pub fn claims() -> Counter<u64> {
    meter()
        .u64_counter("fetchq.claims")
        .with_description("Number of claim calls")
        .build()
}

/// Counter: items handed out by claim calls.
/// Labels: `stage`.
pub fn claimed_items() -> Counter<u64> {
    meter()
        .u64_counter("fetchq.claims.items")
        .with_description("Number of items claimed")
        .build()
}

/// Counter: terminal reports.
/// Labels: `stage`, `outcome` ("done" | "failed"), `ack` ("applied" | "conflict").
pub fn reports() -> Counter<u64> {
    meter()
        .u64_counter("fetchq.reports")
        .with_description("Number of terminal reports")
        .build()
}

/// Counter: early lease releases.
/// Labels: `stage`.
pub fn releases() -> Counter<u64> {
    meter()
        .u64_counter("fetchq.releases")
        .with_description("Number of early lease releases")
        .build()
}

/// Counter: expired leases returned to pending by the reconciler.
/// Labels: `stage`.
pub fn leases_reclaimed() -> Counter<u64> {
    meter()
        .u64_counter("fetchq.leases.reclaimed")
        .with_description("Number of expired leases reclaimed")
        .build()
}

/// Gauge: current item count per stage and status.
/// Labels: `stage`, `status`.
pub fn queue_depth() -> Gauge<u64> {
    meter()
        .u64_gauge("fetchq.queue.depth")
        .with_description("Work items per stage and status")
        .build()
}

/// Gauge: age of the oldest live lease, in seconds.
pub fn oldest_lease_age() -> Gauge<u64> {
    meter()
        .u64_gauge("fetchq.leases.oldest_age_seconds")
        .with_description("Age of the oldest unresolved lease")
        .with_unit("s")
        .build()
}

/// Histogram: claim statement latency.
/// Labels: `stage`.
pub fn claim_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("fetchq.claim.duration_ms")
        .with_description("Claim call duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Histogram: executor run time per item.
/// Labels: `stage`, `outcome`.
pub fn execute_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("fetchq.execute.duration_ms")
        .with_description("Executor duration per item in milliseconds")
        .with_unit("ms")
        .build()
}
