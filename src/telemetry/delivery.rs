//! Delivery span helpers.

use tracing::Span;

use crate::model::{DeliveryOutcome, WorkItem};

/// Start a span covering one delivery attempt and its settlement.
///
/// `delivery.outcome` is declared empty and filled by [`record_outcome`].
pub fn start_delivery_span(item: &WorkItem) -> Span {
    tracing::info_span!(
        "delivery.attempt",
        "work.id" = %item.id,
        "delivery.attempt" = item.attempts + 1,
        "delivery.outcome" = tracing::field::Empty,
    )
}

/// Record the sender's verdict on the span and emit an event inside it.
pub fn record_outcome(span: &Span, outcome: &DeliveryOutcome, duration_ms: u64) {
    span.record("delivery.outcome", outcome.label());
    span.in_scope(|| match outcome {
        DeliveryOutcome::Success => tracing::debug!(duration_ms, "delivered"),
        DeliveryOutcome::TransientFailure(reason) | DeliveryOutcome::PermanentFailure(reason) => {
            tracing::info!(duration_ms, outcome = outcome.label(), %reason, "delivery failed");
        }
    });
}
