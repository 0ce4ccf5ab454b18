//! Delivery of a single work item to its destination.

pub mod http;
pub mod signing;

pub use http::{HttpSender, HttpSenderConfig};

use async_trait::async_trait;

use crate::model::{DeliveryOutcome, WorkItem};

/// Delivers one work item and classifies what happened.
///
/// Implementations make exactly one outbound call per invocation and never
/// retry internally; retry and backoff belong to the dispatch loop.
/// Ordinary network failures are reported as
/// [`DeliveryOutcome::TransientFailure`], never as panics or errors.
#[async_trait]
pub trait Sender: Send + Sync {
    async fn deliver(&self, item: &WorkItem) -> DeliveryOutcome;
}
