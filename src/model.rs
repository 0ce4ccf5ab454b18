//! Core data model.
//!
//! A work item is one outbound webhook waiting for delivery. It carries an
//! opaque payload, where to send it, and the lease bookkeeping the store
//! uses to hand it to exactly one worker at a time.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::query::{QueryParams, parse_query_string};

// ---------------------------------------------------------------------------
// Work Item
// ---------------------------------------------------------------------------

/// A queued webhook delivery tracked by a [`WorkItemStore`](crate::store::WorkItemStore).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    /// Unique identifier.
    pub id: WorkId,

    /// Request body. Opaque to the queue.
    pub payload: Vec<u8>,

    /// Where the payload goes.
    pub destination: Destination,

    /// Number of completed delivery attempts that did not succeed.
    pub attempts: u32,

    /// The item cannot be leased before this instant. While leased it marks
    /// the lease expiry.
    pub next_visible_at: DateTime<Utc>,

    /// Set while a worker holds the item.
    pub lease_token: Option<LeaseToken>,

    /// Reason recorded by the last release or dead-letter.
    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Set once the item is moved to the dead-letter state.
    pub dead_lettered_at: Option<DateTime<Utc>>,
}

impl WorkItem {
    /// Build a fresh item from a submission: zero attempts, visible at `now`.
    pub(crate) fn from_new(new: NewWorkItem, now: DateTime<Utc>) -> Self {
        Self {
            id: new.id.unwrap_or_default(),
            payload: new.payload,
            destination: new.destination,
            attempts: 0,
            next_visible_at: now,
            lease_token: None,
            last_error: None,
            created_at: now,
            updated_at: now,
            dead_lettered_at: None,
        }
    }

    pub fn is_dead_lettered(&self) -> bool {
        self.dead_lettered_at.is_some()
    }

    /// Can this item be leased at `now`?
    ///
    /// A held lease whose window has passed counts as released; the next
    /// lease replaces its token.
    pub fn is_visible_at(&self, now: DateTime<Utc>) -> bool {
        !self.is_dead_lettered() && now >= self.next_visible_at
    }

    /// Is the item currently held under `token`?
    pub fn is_leased_by(&self, token: &LeaseToken, now: DateTime<Utc>) -> bool {
        !self.is_dead_lettered()
            && self.lease_token.as_ref() == Some(token)
            && now < self.next_visible_at
    }
}

/// Work item identifier. Opaque; UUID v4 unless the caller supplies one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkId(pub String);

impl WorkId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for WorkId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for WorkId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for WorkId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Proof of a lease. A fresh token is minted on every lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeaseToken(pub Uuid);

impl LeaseToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LeaseToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Destination
// ---------------------------------------------------------------------------

/// Target of a delivery: callback URL plus extra request headers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl Destination {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: BTreeMap::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Parsed query string of the callback URL.
    pub fn query_params(&self) -> Result<QueryParams> {
        parse_query_string(&self.url)
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Result of one delivery attempt, as classified by a sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "reason", rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Success,
    /// Worth retrying later (network errors, 5xx, throttling).
    TransientFailure(String),
    /// Retrying will not help (4xx, malformed destination).
    PermanentFailure(String),
}

impl DeliveryOutcome {
    /// Short label used for metrics and span fields.
    pub fn label(&self) -> &'static str {
        match self {
            DeliveryOutcome::Success => "success",
            DeliveryOutcome::TransientFailure(_) => "transient_failure",
            DeliveryOutcome::PermanentFailure(_) => "permanent_failure",
        }
    }
}

impl std::fmt::Display for DeliveryOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryOutcome::Success => write!(f, "success"),
            DeliveryOutcome::TransientFailure(reason) => write!(f, "transient failure: {reason}"),
            DeliveryOutcome::PermanentFailure(reason) => write!(f, "permanent failure: {reason}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for new work items. The store's public API for submitting work.
#[derive(Debug, Clone)]
pub struct NewWorkItem {
    pub(crate) id: Option<WorkId>,
    pub(crate) payload: Vec<u8>,
    pub(crate) destination: Destination,
}

impl NewWorkItem {
    pub fn new(destination: Destination, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: None,
            payload: payload.into(),
            destination,
        }
    }

    /// Use a caller-chosen identifier instead of a random one.
    pub fn id(mut self, id: impl Into<WorkId>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// `now + d`, saturating at the far future.
pub(crate) fn add_duration(now: DateTime<Utc>, d: std::time::Duration) -> DateTime<Utc> {
    TimeDelta::from_std(d)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
