//! [`WorkItemStore`] over the `work_items` table.
//!
//! Leasing uses `FOR UPDATE SKIP LOCKED` so concurrent dispatchers never pick
//! the same row. Every lease-guarded mutation matches on the token and on the
//! lease still being live, using the database clock.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use uuid::Uuid;

use super::Db;
use crate::error::{Error, Result};
use crate::model::{Destination, LeaseToken, NewWorkItem, WorkId, WorkItem};
use crate::store::WorkItemStore;
use crate::telemetry::metrics;

const COLUMNS: &str = "id, payload, destination, attempts, next_visible_at, lease_token, last_error, created_at, updated_at, dead_lettered_at";

#[async_trait]
impl WorkItemStore for Db {
    async fn enqueue(&self, new: NewWorkItem) -> Result<WorkId> {
        let item = WorkItem::from_new(new, Utc::now());

        sqlx::query(
            "INSERT INTO work_items (id, payload, destination, attempts, next_visible_at, created_at, updated_at)
             VALUES ($1, $2, $3, 0, $4, $4, $4)",
        )
        .bind(item.id.as_str())
        .bind(&item.payload)
        .bind(Json(&item.destination))
        .bind(item.created_at)
        .execute(self.pool())
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                Error::Storage(format!("duplicate work item id {}", item.id))
            }
            other => Error::Database(other),
        })?;

        metrics::work_enqueued().add(1, &[]);
        Ok(item.id)
    }

    async fn lease_batch(
        &self,
        max_count: usize,
        lease_duration: Duration,
    ) -> Result<Vec<WorkItem>> {
        let rows: Vec<WorkItemRow> = sqlx::query_as(
            "WITH picked AS (
                 SELECT id, next_visible_at AS visible_from, seq
                 FROM work_items
                 WHERE dead_lettered_at IS NULL AND next_visible_at <= now()
                 ORDER BY next_visible_at, seq
                 LIMIT $1
                 FOR UPDATE SKIP LOCKED
             ), leased AS (
                 UPDATE work_items AS w
                 SET lease_token = gen_random_uuid(),
                     next_visible_at = now() + make_interval(secs => $2),
                     updated_at = now()
                 FROM picked
                 WHERE w.id = picked.id
                 RETURNING w.id, w.payload, w.destination, w.attempts, w.next_visible_at,
                           w.lease_token, w.last_error, w.created_at, w.updated_at,
                           w.dead_lettered_at, picked.visible_from, picked.seq
             )
             SELECT * FROM leased ORDER BY visible_from, seq",
        )
        .bind(i64::try_from(max_count).unwrap_or(i64::MAX))
        .bind(lease_duration.as_secs_f64())
        .fetch_all(self.pool())
        .await?;

        metrics::record_queue_operation(if rows.is_empty() { "lease_empty" } else { "lease" });
        rows.into_iter().map(WorkItemRow::try_into_work_item).collect()
    }

    async fn acknowledge(&self, id: &WorkId, token: &LeaseToken) -> Result<()> {
        let rows_affected = sqlx::query(
            "DELETE FROM work_items
             WHERE id = $1 AND lease_token = $2
               AND next_visible_at > now() AND dead_lettered_at IS NULL",
        )
        .bind(id.as_str())
        .bind(token.0)
        .execute(self.pool())
        .await?
        .rows_affected();

        ensure_leased(id, rows_affected)?;
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
        let rows_affected = sqlx::query(
            "UPDATE work_items
             SET lease_token = NULL,
                 attempts = attempts + 1,
                 next_visible_at = now() + make_interval(secs => $3),
                 last_error = $4,
                 updated_at = now()
             WHERE id = $1 AND lease_token = $2
               AND next_visible_at > now() AND dead_lettered_at IS NULL",
        )
        .bind(id.as_str())
        .bind(token.0)
        .bind(backoff.as_secs_f64())
        .bind(reason)
        .execute(self.pool())
        .await?
        .rows_affected();

        ensure_leased(id, rows_affected)?;
        metrics::record_queue_operation("release");
        Ok(())
    }

    async fn dead_letter(&self, id: &WorkId, token: &LeaseToken, reason: &str) -> Result<()> {
        let rows_affected = sqlx::query(
            "UPDATE work_items
             SET lease_token = NULL,
                 attempts = attempts + 1,
                 last_error = $3,
                 dead_lettered_at = now(),
                 updated_at = now()
             WHERE id = $1 AND lease_token = $2
               AND next_visible_at > now() AND dead_lettered_at IS NULL",
        )
        .bind(id.as_str())
        .bind(token.0)
        .bind(reason)
        .execute(self.pool())
        .await?
        .rows_affected();

        ensure_leased(id, rows_affected)?;
        metrics::record_queue_operation("dead_letter");
        Ok(())
    }

    async fn get(&self, id: &WorkId) -> Result<Option<WorkItem>> {
        let row: Option<WorkItemRow> =
            sqlx::query_as(&format!("SELECT {COLUMNS} FROM work_items WHERE id = $1"))
                .bind(id.as_str())
                .fetch_optional(self.pool())
                .await?;
        row.map(WorkItemRow::try_into_work_item).transpose()
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<WorkItem>> {
        let rows: Vec<WorkItemRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM work_items
             WHERE dead_lettered_at IS NOT NULL
             ORDER BY dead_lettered_at, seq
             LIMIT $1"
        ))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(WorkItemRow::try_into_work_item).collect()
    }

    async fn requeue_dead_letter(&self, id: &WorkId) -> Result<()> {
        let rows_affected = sqlx::query(
            "UPDATE work_items
             SET dead_lettered_at = NULL, attempts = 0, lease_token = NULL,
                 next_visible_at = now(), updated_at = now()
             WHERE id = $1 AND dead_lettered_at IS NOT NULL",
        )
        .bind(id.as_str())
        .execute(self.pool())
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(Error::NotFound(format!("dead-lettered work item {id}")));
        }
        metrics::record_queue_operation("requeue");
        Ok(())
    }

    async fn depth(&self) -> Result<u64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM work_items WHERE dead_lettered_at IS NULL")
                .fetch_one(self.pool())
                .await?;
        Ok(count.max(0) as u64)
    }
}

/// A lease-guarded statement that touched no row lost its lease.
fn ensure_leased(id: &WorkId, rows_affected: u64) -> Result<()> {
    if rows_affected == 0 {
        Err(Error::LeaseMismatch { id: id.to_string() })
    } else {
        Ok(())
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct WorkItemRow {
    id: String,
    payload: Vec<u8>,
    destination: Json<Destination>,
    attempts: i32,
    next_visible_at: DateTime<Utc>,
    lease_token: Option<Uuid>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    dead_lettered_at: Option<DateTime<Utc>>,
}

impl WorkItemRow {
    fn try_into_work_item(self) -> Result<WorkItem> {
        let attempts = u32::try_from(self.attempts)
            .map_err(|_| Error::Storage(format!("negative attempts on work item {}", self.id)))?;

        Ok(WorkItem {
            id: WorkId(self.id),
            payload: self.payload,
            destination: self.destination.0,
            attempts,
            next_visible_at: self.next_visible_at,
            lease_token: self.lease_token.map(LeaseToken),
            last_error: self.last_error,
            created_at: self.created_at,
            updated_at: self.updated_at,
            dead_lettered_at: self.dead_lettered_at,
        })
    }
}
