//! Task execution span helpers.
//!
//! Provides span creation and outcome recording for tasks a worker pops off
//! a topic queue.

use tracing::Span;

use crate::id::RequestId;
use crate::model::Status;

/// Start a span for executing one task.
///
/// The `task.status` field is declared empty and is filled in by
/// [`record_task_status`].
pub fn start_task_span(topic: &str, method: &str, request_id: &RequestId) -> Span {
    tracing::info_span!(
        "task.execute",
        "task.topic" = topic,
        "task.method" = method,
        "task.request_id" = %request_id,
        "task.status" = tracing::field::Empty,
    )
}

/// Record the status a task finished with on its span.
pub fn record_task_status(span: &Span, status: Status, duration_ms: u64) {
    span.record("task.status", status.as_str());
    span.in_scope(|| {
        tracing::debug!(status = status.as_str(), duration_ms, "task finished");
    });
}
