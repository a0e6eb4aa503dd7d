//! Job execution span helpers.

use tracing::Span;

use crate::model::JobId;

/// Start a span covering one delivery of a job, from lease to ack.
///
/// The `job.state` field is declared empty and can be filled in by
/// [`record_state_transition`].
pub fn start_job_span(kind: &str, id: &JobId, attempt: u32) -> Span {
    tracing::info_span!(
        "job.execute",
        "job.kind" = kind,
        "job.id" = %id,
        "job.attempt" = attempt,
        "job.state" = tracing::field::Empty,
    )
}

/// Record a state transition event on `span`.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("job.state", to);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
