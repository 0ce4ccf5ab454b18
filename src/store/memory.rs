//! In-process store for tests and embedded use.
//!
//! Not durable. One mutex guards the whole table, so every operation is
//! atomic with respect to every other.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use super::WorkItemStore;
use crate::error::{Error, Result};
use crate::model::{LeaseToken, NewWorkItem, WorkId, WorkItem, add_duration};
use crate::telemetry::metrics;

#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    items: HashMap<WorkId, Entry>,
    next_seq: u64,
}

/// Insertion sequence breaks ties between items visible at the same instant.
struct Entry {
    seq: u64,
    item: WorkItem,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Inner {
    /// The entry for `id` if `token` is its live lease.
    fn leased_mut(&mut self, id: &WorkId, token: &LeaseToken) -> Result<&mut WorkItem> {
        let now = Utc::now();
        match self.items.get_mut(id) {
            Some(entry) if entry.item.is_leased_by(token, now) => Ok(&mut entry.item),
            _ => Err(Error::LeaseMismatch { id: id.to_string() }),
        }
    }
}

#[async_trait]
impl WorkItemStore for InMemoryStore {
    async fn enqueue(&self, new: NewWorkItem) -> Result<WorkId> {
        let mut inner = self.inner.lock().await;
        let item = WorkItem::from_new(new, Utc::now());
        let id = item.id.clone();

        if inner.items.contains_key(&id) {
            return Err(Error::Storage(format!("duplicate work item id {id}")));
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.items.insert(id.clone(), Entry { seq, item });

        metrics::work_enqueued().add(1, &[]);
        Ok(id)
    }

    async fn lease_batch(
        &self,
        max_count: usize,
        lease_duration: Duration,
    ) -> Result<Vec<WorkItem>> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();

        let mut visible: Vec<(chrono::DateTime<Utc>, u64, WorkId)> = inner
            .items
            .values()
            .filter(|entry| entry.item.is_visible_at(now))
            .map(|entry| (entry.item.next_visible_at, entry.seq, entry.item.id.clone()))
            .collect();
        visible.sort();

        let expires_at = add_duration(now, lease_duration);
        let mut leased = Vec::with_capacity(visible.len().min(max_count));
        for (_, _, id) in visible.into_iter().take(max_count) {
            if let Some(entry) = inner.items.get_mut(&id) {
                entry.item.lease_token = Some(LeaseToken::new());
                entry.item.next_visible_at = expires_at;
                entry.item.updated_at = now;
                leased.push(entry.item.clone());
            }
        }

        metrics::record_queue_operation(if leased.is_empty() { "lease_empty" } else { "lease" });
        Ok(leased)
    }

    async fn acknowledge(&self, id: &WorkId, token: &LeaseToken) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.leased_mut(id, token)?;
        inner.items.remove(id);
        metrics::record_queue_operation("acknowledge");
        Ok(())
    }

    async fn release(
        &self,
        id: &WorkId,
        token: &LeaseToken,
        backoff: Duration,
        reason: &str,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let item = inner.leased_mut(id, token)?;
        let now = Utc::now();
        item.lease_token = None;
        item.attempts += 1;
        item.next_visible_at = add_duration(now, backoff);
        item.last_error = Some(reason.to_string());
        item.updated_at = now;
        metrics::record_queue_operation("release");
        Ok(())
    }

    async fn dead_letter(&self, id: &WorkId, token: &LeaseToken, reason: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let item = inner.leased_mut(id, token)?;
        let now = Utc::now();
        item.lease_token = None;
        item.attempts += 1;
        item.last_error = Some(reason.to_string());
        item.dead_lettered_at = Some(now);
        item.updated_at = now;
        metrics::record_queue_operation("dead_letter");
        Ok(())
    }

    async fn get(&self, id: &WorkId) -> Result<Option<WorkItem>> {
        let inner = self.inner.lock().await;
        Ok(inner.items.get(id).map(|entry| entry.item.clone()))
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<WorkItem>> {
        let inner = self.inner.lock().await;
        let mut dead: Vec<&WorkItem> = inner
            .items
            .values()
            .map(|entry| &entry.item)
            .filter(|item| item.is_dead_lettered())
            .collect();
        dead.sort_by_key(|item| item.dead_lettered_at);
        Ok(dead.into_iter().take(limit).cloned().collect())
    }

    async fn requeue_dead_letter(&self, id: &WorkId) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let item = match inner.items.get_mut(id) {
            Some(entry) if entry.item.is_dead_lettered() => &mut entry.item,
            _ => return Err(Error::NotFound(format!("dead-lettered work item {id}"))),
        };
        let now = Utc::now();
        item.dead_lettered_at = None;
        item.attempts = 0;
        item.next_visible_at = now;
        item.updated_at = now;
        metrics::record_queue_operation("requeue");
        Ok(())
    }

    async fn depth(&self) -> Result<u64> {
        let inner = self.inner.lock().await;
        Ok(inner
            .items
            .values()
            .filter(|entry| !entry.item.is_dead_lettered())
            .count() as u64)
    }
}
