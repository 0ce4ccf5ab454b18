//! Dispatch loop: lease batches, deliver on a bounded worker pool, settle.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use opentelemetry::KeyValue;
use tokio::sync::{Semaphore, broadcast, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

use super::backoff::Backoff;
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::event::{Event, EventKind};
use crate::model::{DeliveryOutcome, LeaseToken, WorkId, WorkItem};
use crate::sender::Sender;
use crate::store::WorkItemStore;
use crate::telemetry::delivery::{record_outcome, start_delivery_span};
use crate::telemetry::metrics;

const EVENT_CAPACITY: usize = 1024;

/// Configuration for the dispatch loop.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Maximum items leased per round trip to the store.
    pub batch_size: usize,
    /// How long a leased item stays hidden from other workers.
    pub lease_duration: Duration,
    /// Maximum deliveries in flight at once.
    pub max_parallelism: usize,
    /// Sleep between polls when the queue is empty.
    pub poll_interval: Duration,
    /// Attempts before a transiently failing item is dead-lettered.
    pub max_attempts: u32,
    /// Retry delay for failed deliveries and failed lease calls.
    pub backoff: Backoff,
    /// Consecutive lease failures tolerated before the loop stops.
    pub max_storage_retries: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 16,
            lease_duration: Duration::from_secs(60),
            max_parallelism: 8,
            poll_interval: Duration::from_secs(1),
            max_attempts: 5,
            backoff: Backoff::default(),
            max_storage_retries: 3,
        }
    }
}

impl DispatchConfig {
    /// Defaults overridden by any `dispatch.*` keys present in `settings`.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let mut config = Self::default();
        let millis = |key: &str| -> Result<Option<Duration>> {
            Ok(settings.get_parsed::<u64>(key)?.map(Duration::from_millis))
        };

        if let Some(v) = settings.get_parsed("dispatch.batch_size")? {
            config.batch_size = v;
        }
        if let Some(v) = millis("dispatch.lease_duration_ms")? {
            config.lease_duration = v;
        }
        if let Some(v) = settings.get_parsed("dispatch.max_parallelism")? {
            config.max_parallelism = v;
        }
        if let Some(v) = millis("dispatch.poll_interval_ms")? {
            config.poll_interval = v;
        }
        if let Some(v) = settings.get_parsed("dispatch.max_attempts")? {
            config.max_attempts = v;
        }
        if let Some(v) = millis("dispatch.backoff_base_ms")? {
            config.backoff.base = v;
        }
        if let Some(v) = millis("dispatch.backoff_max_ms")? {
            config.backoff.max = v;
        }
        if let Some(v) = settings.get_parsed("dispatch.max_storage_retries")? {
            config.max_storage_retries = v;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(Error::Config(msg.to_string()));
        if self.batch_size == 0 {
            return invalid("batch_size must be at least 1");
        }
        if self.max_parallelism == 0 {
            return invalid("max_parallelism must be at least 1");
        }
        if self.lease_duration.is_zero() {
            return invalid("lease_duration must be positive");
        }
        if self.poll_interval.is_zero() {
            return invalid("poll_interval must be positive");
        }
        if self.max_attempts == 0 {
            return invalid("max_attempts must be at least 1");
        }
        if self.backoff.base > self.backoff.max {
            return invalid("backoff base must not exceed backoff max");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Running,
    Stopped,
}

/// Counts of what the loop did before it stopped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub delivered: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub lease_lost: u64,
}

impl DispatchSummary {
    fn record(&mut self, settlement: Settlement) {
        match settlement {
            Settlement::Delivered => self.delivered += 1,
            Settlement::Retried => self.retried += 1,
            Settlement::DeadLettered => self.dead_lettered += 1,
            Settlement::LeaseLost => self.lease_lost += 1,
        }
    }
}

/// What happened to one leased item.
enum Settlement {
    Delivered,
    Retried,
    DeadLettered,
    LeaseLost,
}

/// Sequenced broadcast of [`Event`]s. Sends with no subscribers are dropped.
struct EventBus {
    tx: broadcast::Sender<Event>,
    seq: AtomicU64,
}

impl EventBus {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            tx,
            seq: AtomicU64::new(0),
        }
    }

    fn emit(&self, kind: EventKind) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let _ = self.tx.send(Event {
            seq,
            timestamp: Utc::now(),
            kind,
        });
    }
}

/// Drains a [`WorkItemStore`] through a [`Sender`] until cancelled.
pub struct DispatchLoop {
    worker: Arc<Worker>,
    config: DispatchConfig,
    permits: Arc<Semaphore>,
    state: watch::Sender<LoopState>,
}

impl DispatchLoop {
    /// # Errors
    ///
    /// `Error::Config` if `config` is invalid.
    pub fn new(
        store: Arc<dyn WorkItemStore>,
        sender: Arc<dyn Sender>,
        config: DispatchConfig,
    ) -> Result<Self> {
        config.validate()?;
        let (state, _) = watch::channel(LoopState::Stopped);
        Ok(Self {
            worker: Arc::new(Worker {
                store,
                sender,
                max_attempts: config.max_attempts,
                backoff: config.backoff,
                events: EventBus::new(),
            }),
            permits: Arc::new(Semaphore::new(config.max_parallelism)),
            config,
            state,
        })
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn state(&self) -> LoopState {
        *self.state.borrow()
    }

    /// Observe state changes.
    pub fn watch_state(&self) -> watch::Receiver<LoopState> {
        self.state.subscribe()
    }

    /// Receive events emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.worker.events.tx.subscribe()
    }

    /// Run until `cancel` fires or the store fails for good.
    ///
    /// On cancellation no new lease is taken; deliveries already in flight
    /// finish and are settled first. Returns the summary on clean shutdown
    /// and the storage error when the loop had to stop.
    pub async fn start(&self, cancel: CancellationToken) -> Result<DispatchSummary> {
        if self.state.send_replace(LoopState::Running) == LoopState::Running {
            return Err(Error::Other("dispatch loop is already running".to_string()));
        }
        info!(
            batch_size = self.config.batch_size,
            max_parallelism = self.config.max_parallelism,
            max_attempts = self.config.max_attempts,
            "dispatch loop started"
        );

        let result = self.run(&cancel).await;

        self.state.send_replace(LoopState::Stopped);
        match &result {
            Ok(summary) => info!(
                delivered = summary.delivered,
                retried = summary.retried,
                dead_lettered = summary.dead_lettered,
                lease_lost = summary.lease_lost,
                "dispatch loop stopped"
            ),
            Err(e) => error!(error = %e, "dispatch loop stopped on fatal error"),
        }
        self.worker.events.emit(EventKind::Stopped {
            error: result.as_ref().err().map(ToString::to_string),
        });

        result
    }

    async fn run(&self, cancel: &CancellationToken) -> Result<DispatchSummary> {
        let mut summary = DispatchSummary::default();
        let mut lease_failures = 0u32;

        while !cancel.is_cancelled() {
            let leased = self
                .worker
                .store
                .lease_batch(self.config.batch_size, self.config.lease_duration)
                .await;

            let batch = match leased {
                Ok(batch) => {
                    lease_failures = 0;
                    batch
                }
                Err(e) if lease_failures < self.config.max_storage_retries => {
                    let delay = self.config.backoff.delay(lease_failures);
                    lease_failures += 1;
                    warn!(
                        error = %e,
                        failures = lease_failures,
                        delay_ms = delay.as_millis() as u64,
                        "lease failed, backing off"
                    );
                    pause(cancel, delay).await;
                    continue;
                }
                Err(e) => return Err(e),
            };

            if batch.is_empty() {
                pause(cancel, self.config.poll_interval).await;
                continue;
            }

            debug!(count = batch.len(), "leased batch");
            self.dispatch_batch(batch, &mut summary).await?;
        }

        Ok(summary)
    }

    /// Deliver every item of a batch, at most `max_parallelism` at a time,
    /// and wait for all of them to settle.
    async fn dispatch_batch(
        &self,
        batch: Vec<WorkItem>,
        summary: &mut DispatchSummary,
    ) -> Result<()> {
        let mut in_flight = JoinSet::new();
        for item in batch {
            let permit = Arc::clone(&self.permits)
                .acquire_owned()
                .await
                .map_err(|_| Error::Other("worker pool closed".to_string()))?;
            let worker = Arc::clone(&self.worker);
            in_flight.spawn(async move {
                let settled = worker.process(item).await;
                drop(permit);
                settled
            });
        }

        let mut fatal = None;
        while let Some(joined) = in_flight.join_next().await {
            match joined {
                Ok(Ok(settlement)) => summary.record(settlement),
                Ok(Err(e)) => {
                    error!(error = %e, "failed to settle work item");
                    fatal.get_or_insert(e);
                }
                // The item stays leased and comes back when the lease expires.
                Err(e) => error!(error = %e, "delivery task panicked"),
            }
        }

        fatal.map_or(Ok(()), Err)
    }
}

async fn pause(cancel: &CancellationToken, duration: Duration) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(duration) => {}
    }
}

/// Shared state of the delivery workers.
struct Worker {
    store: Arc<dyn WorkItemStore>,
    sender: Arc<dyn Sender>,
    max_attempts: u32,
    backoff: Backoff,
    events: EventBus,
}

impl Worker {
    async fn process(&self, item: WorkItem) -> Result<Settlement> {
        let Some(token) = item.lease_token else {
            warn!(id = %item.id, "leased item has no lease token");
            return Ok(Settlement::LeaseLost);
        };

        let span = start_delivery_span(&item);
        async {
            let started = Instant::now();
            let outcome = self.sender.deliver(&item).await;
            let duration_ms = started.elapsed().as_millis() as u64;

            record_outcome(&span, &outcome, duration_ms);
            metrics::delivery_outcomes().add(1, &[KeyValue::new("outcome", outcome.label())]);
            metrics::delivery_duration_ms().record(duration_ms as f64, &[]);

            self.settle(&item, token, outcome).await
        }
        .instrument(span.clone())
        .await
    }

    async fn settle(
        &self,
        item: &WorkItem,
        token: LeaseToken,
        outcome: DeliveryOutcome,
    ) -> Result<Settlement> {
        let id = &item.id;
        let attempt = item.attempts + 1;

        match outcome {
            DeliveryOutcome::Success => {
                let applied = self
                    .apply("acknowledge", id, || self.store.acknowledge(id, &token))
                    .await?;
                if !applied {
                    return Ok(self.lease_lost(id));
                }
                self.events.emit(EventKind::Delivered {
                    id: id.clone(),
                    attempt,
                });
                Ok(Settlement::Delivered)
            }
            DeliveryOutcome::TransientFailure(reason) if attempt < self.max_attempts => {
                let backoff = self.backoff.delay(item.attempts);
                let applied = self
                    .apply("release", id, || {
                        self.store.release(id, &token, backoff, &reason)
                    })
                    .await?;
                if !applied {
                    return Ok(self.lease_lost(id));
                }
                let backoff_ms = backoff.as_millis() as u64;
                info!(%id, attempt, backoff_ms, %reason, "retry scheduled");
                self.events.emit(EventKind::Retried {
                    id: id.clone(),
                    attempt,
                    backoff_ms,
                    reason,
                });
                Ok(Settlement::Retried)
            }
            DeliveryOutcome::TransientFailure(reason) => {
                let reason = format!("gave up after {attempt} attempts: {reason}");
                self.dead_letter(item, token, reason).await
            }
            DeliveryOutcome::PermanentFailure(reason) => {
                self.dead_letter(item, token, reason).await
            }
        }
    }

    async fn dead_letter(
        &self,
        item: &WorkItem,
        token: LeaseToken,
        reason: String,
    ) -> Result<Settlement> {
        let id = &item.id;
        let applied = self
            .apply("dead_letter", id, || {
                self.store.dead_letter(id, &token, &reason)
            })
            .await?;
        if !applied {
            return Ok(self.lease_lost(id));
        }

        let attempts = item.attempts + 1;
        warn!(%id, attempts, %reason, "work item dead-lettered");
        metrics::dead_lettered().add(1, &[]);
        self.events.emit(EventKind::DeadLettered {
            id: id.clone(),
            attempts,
            reason,
        });
        Ok(Settlement::DeadLettered)
    }

    fn lease_lost(&self, id: &WorkId) -> Settlement {
        warn!(%id, "lease lost before the item could be settled");
        self.events.emit(EventKind::LeaseLost { id: id.clone() });
        Settlement::LeaseLost
    }

    /// Run a store mutation, retrying once on failure.
    ///
    /// `Ok(false)` means the lease no longer belongs to this worker; that is
    /// not a store failure and is never retried.
    async fn apply<F, Fut>(&self, operation: &'static str, id: &WorkId, op: F) -> Result<bool>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let first = match op().await {
            Ok(()) => return Ok(true),
            Err(e) if e.is_lease_mismatch() => return Ok(false),
            Err(e) => e,
        };

        warn!(%id, operation, error = %first, "store operation failed, retrying once");
        match op().await {
            Ok(()) => Ok(true),
            Err(e) if e.is_lease_mismatch() => Ok(false),
            Err(e) => Err(e),
        }
    }
}
