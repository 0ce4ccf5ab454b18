//! Durable queue abstraction with lease-style dequeue.
//!
//! All mutation of work items goes through these operations; each one is
//! atomic per item, which is what the dispatch loop relies on for
//! correctness.

pub mod memory;

pub use memory::InMemoryStore;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{LeaseToken, NewWorkItem, WorkId, WorkItem};

#[async_trait]
pub trait WorkItemStore: Send + Sync {
    /// Insert a new item: zero attempts, immediately visible.
    async fn enqueue(&self, new: NewWorkItem) -> Result<WorkId>;

    /// Lease up to `max_count` visible items for `lease_duration`.
    ///
    /// Returned items carry a fresh lease token and `next_visible_at` set to
    /// the lease expiry. Concurrent callers never receive the same item
    /// within one lease window.
    async fn lease_batch(&self, max_count: usize, lease_duration: Duration)
    -> Result<Vec<WorkItem>>;

    /// Delete a delivered item. `LeaseMismatch` if `token` is not the
    /// current lease; the item is left untouched.
    async fn acknowledge(&self, id: &WorkId, token: &LeaseToken) -> Result<()>;

    /// Return a leased item to the queue after `backoff`, counting the
    /// failed attempt.
    async fn release(
        &self,
        id: &WorkId,
        token: &LeaseToken,
        backoff: Duration,
        reason: &str,
    ) -> Result<()>;

    /// Move a leased item to the terminal dead-letter state, counting the
    /// failed attempt. The payload is kept for inspection.
    async fn dead_letter(&self, id: &WorkId, token: &LeaseToken, reason: &str) -> Result<()>;

    /// Look up an item in any state.
    async fn get(&self, id: &WorkId) -> Result<Option<WorkItem>>;

    /// Dead-lettered items, oldest first.
    async fn dead_letters(&self, limit: usize) -> Result<Vec<WorkItem>>;

    /// Put a dead-lettered item back in the queue with a clean attempt count.
    async fn requeue_dead_letter(&self, id: &WorkId) -> Result<()>;

    /// Number of live (not dead-lettered) items.
    async fn depth(&self) -> Result<u64>;
}
