//! Batch execution span helpers.
//!
//! Provides span creation and outcome recording for claim batches flowing
//! through a worker loop.

use tracing::Span;

use crate::model::Stage;

/// Start a span covering one claimed batch, from claim to the last report.
///
/// The `batch.done` and `batch.failed` fields are declared empty and are
/// filled in via [`record_batch_outcome`].
pub fn start_batch_span(stage: Stage, worker_id: &str, size: usize) -> Span {
    tracing::info_span!(
        "batch.execute",
        "batch.stage" = stage.as_str(),
        "batch.worker_id" = worker_id,
        "batch.size" = size,
        "batch.done" = tracing::field::Empty,
        "batch.failed" = tracing::field::Empty,
    )
}

/// Record the batch outcome on the span.
pub fn record_batch_outcome(span: &Span, done: usize, failed: usize) {
    span.record("batch.done", done);
    span.record("batch.failed", failed);
}
