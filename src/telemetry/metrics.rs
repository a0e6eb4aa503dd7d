//! Metric instrument factories for workvault.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"workvault"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("workvault")
}

/// Counter: jobs durably appended to the queue log.
/// Labels: `kind`.
pub fn jobs_enqueued() -> Counter<u64> {
    meter()
        .u64_counter("workvault.jobs.enqueued")
        .with_description("Number of jobs enqueued")
        .build()
}

/// Counter: jobs handed to workers by `lease_batch`.
pub fn jobs_leased() -> Counter<u64> {
    meter()
        .u64_counter("workvault.jobs.leased")
        .with_description("Number of job leases granted")
        .build()
}

/// Counter: acknowledged handler outcomes.
/// Labels: `kind`, `outcome` ("success" | "retryable" | "terminal").
pub fn jobs_acked() -> Counter<u64> {
    meter()
        .u64_counter("workvault.jobs.acked")
        .with_description("Number of job outcomes acknowledged")
        .build()
}

/// Counter: enqueues refused at the high-water mark.
pub fn queue_rejected() -> Counter<u64> {
    meter()
        .u64_counter("workvault.queue.rejected")
        .with_description("Enqueues rejected by backpressure")
        .build()
}

/// Counter: log compactions performed.
pub fn compactions() -> Counter<u64> {
    meter()
        .u64_counter("workvault.queue.compactions")
        .with_description("Number of queue log compactions")
        .build()
}

/// Counter: record writes.
/// Labels: `change` ("write" | "delete" | "transaction").
pub fn records_updated() -> Counter<u64> {
    meter()
        .u64_counter("workvault.records.updated")
        .with_description("Number of record mutations persisted")
        .build()
}

/// Counter: shard files moved aside as corrupt.
pub fn records_quarantined() -> Counter<u64> {
    meter()
        .u64_counter("workvault.records.quarantined")
        .with_description("Number of corrupt shard files quarantined")
        .build()
}

/// Counter: transient I/O failures that were retried.
/// Labels: `operation`.
pub fn storage_retries() -> Counter<u64> {
    meter()
        .u64_counter("workvault.storage.retries")
        .with_description("Number of retried storage operations")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("workvault.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}
