//! Structured events emitted by the dispatch loop.
//!
//! Subscribers build dashboards, alerting, or dead-letter handling on top of
//! this stream. Dead-lettered items are reported here rather than as errors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::WorkId;

/// A structured event emitted by the dispatch loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence number. Consumers can detect gaps (lagged receivers).
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    Delivered {
        id: WorkId,
        /// Attempt number that succeeded, 1-based.
        attempt: u32,
    },
    Retried {
        id: WorkId,
        attempt: u32,
        backoff_ms: u64,
        reason: String,
    },
    DeadLettered {
        id: WorkId,
        attempts: u32,
        reason: String,
    },
    /// The worker's lease was taken over before it could settle the item.
    LeaseLost {
        id: WorkId,
    },
    Stopped {
        /// Set when the loop stopped on a fatal error.
        error: Option<String>,
    },
}
