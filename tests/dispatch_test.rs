//! Integration tests for the dispatch loop over the in-memory store.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use hookq::engine::{Backoff, DispatchConfig, DispatchLoop, DispatchSummary, LoopState};
use hookq::error::{Error, Result};
use hookq::event::{Event, EventKind};
use hookq::model::{DeliveryOutcome, Destination, LeaseToken, NewWorkItem, WorkId, WorkItem};
use hookq::sender::Sender;
use hookq::store::{InMemoryStore, WorkItemStore};
use tokio::sync::{Mutex, Semaphore, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn fast_config() -> DispatchConfig {
    DispatchConfig {
        batch_size: 8,
        lease_duration: Duration::from_secs(30),
        max_parallelism: 4,
        poll_interval: Duration::from_millis(10),
        max_attempts: 5,
        backoff: Backoff::new(Duration::from_millis(5), Duration::from_millis(50)),
        max_storage_retries: 2,
    }
}

fn hook(tag: &str) -> NewWorkItem {
    NewWorkItem::new(
        Destination::new(format!("http://localhost/{tag}")),
        format!(r#"{{"tag":"{tag}"}}"#),
    )
}

/// Replays scripted outcomes, then succeeds. Records the attempt count of
/// every delivery it sees.
#[derive(Default)]
struct ScriptedSender {
    script: Mutex<VecDeque<DeliveryOutcome>>,
    seen: Mutex<Vec<(WorkId, u32)>>,
}

impl ScriptedSender {
    fn new(script: impl IntoIterator<Item = DeliveryOutcome>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            seen: Mutex::default(),
        }
    }

    async fn attempts_seen(&self) -> Vec<u32> {
        self.seen.lock().await.iter().map(|(_, a)| *a).collect()
    }
}

#[async_trait]
impl Sender for ScriptedSender {
    async fn deliver(&self, item: &WorkItem) -> DeliveryOutcome {
        self.seen.lock().await.push((item.id.clone(), item.attempts));
        self.script
            .lock()
            .await
            .pop_front()
            .unwrap_or(DeliveryOutcome::Success)
    }
}

/// Always reports the same outcome.
struct FixedSender(DeliveryOutcome);

#[async_trait]
impl Sender for FixedSender {
    async fn deliver(&self, _item: &WorkItem) -> DeliveryOutcome {
        self.0.clone()
    }
}

/// Blocks every delivery until the test opens the gate.
struct GatedSender {
    gate: Semaphore,
    started: mpsc::UnboundedSender<WorkId>,
}

#[async_trait]
impl Sender for GatedSender {
    async fn deliver(&self, item: &WorkItem) -> DeliveryOutcome {
        let _ = self.started.send(item.id.clone());
        match self.gate.acquire().await {
            Ok(permit) => {
                permit.forget();
                DeliveryOutcome::Success
            }
            Err(_) => DeliveryOutcome::TransientFailure("gate closed".to_string()),
        }
    }
}

/// Tracks how many deliveries run at once.
#[derive(Default)]
struct ConcurrencyProbe {
    current: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl Sender for ConcurrencyProbe {
    async fn deliver(&self, _item: &WorkItem) -> DeliveryOutcome {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        DeliveryOutcome::Success
    }
}

/// Outlives its lease on the first delivery, succeeds quickly afterwards.
struct SlowFirstSender {
    calls: AtomicUsize,
    stall: Duration,
}

#[async_trait]
impl Sender for SlowFirstSender {
    async fn deliver(&self, _item: &WorkItem) -> DeliveryOutcome {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            tokio::time::sleep(self.stall).await;
        }
        DeliveryOutcome::Success
    }
}

/// In-memory store that counts lease calls and fails the first N lease or
/// acknowledge calls.
#[derive(Default)]
struct ObservedStore {
    inner: InMemoryStore,
    leases: AtomicUsize,
    lease_failures: AtomicUsize,
    ack_failures: AtomicUsize,
}

impl ObservedStore {
    fn failing_leases(times: usize) -> Self {
        Self {
            lease_failures: AtomicUsize::new(times),
            ..Default::default()
        }
    }

    fn failing_acks(times: usize) -> Self {
        Self {
            ack_failures: AtomicUsize::new(times),
            ..Default::default()
        }
    }

    fn lease_calls(&self) -> usize {
        self.leases.load(Ordering::SeqCst)
    }
}

/// Consume one scheduled failure, if any are left.
fn take_failure(remaining: &AtomicUsize) -> bool {
    remaining
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl WorkItemStore for ObservedStore {
    async fn enqueue(&self, new: NewWorkItem) -> Result<WorkId> {
        self.inner.enqueue(new).await
    }

    async fn lease_batch(
        &self,
        max_count: usize,
        lease_duration: Duration,
    ) -> Result<Vec<WorkItem>> {
        self.leases.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.lease_failures) {
            return Err(Error::Storage("backend unavailable".to_string()));
        }
        self.inner.lease_batch(max_count, lease_duration).await
    }

    async fn acknowledge(&self, id: &WorkId, token: &LeaseToken) -> Result<()> {
        if take_failure(&self.ack_failures) {
            return Err(Error::Storage("write timed out".to_string()));
        }
        self.inner.acknowledge(id, token).await
    }

    async fn release(
        &self,
        id: &WorkId,
        token: &LeaseToken,
        backoff: Duration,
        reason: &str,
    ) -> Result<()> {
        self.inner.release(id, token, backoff, reason).await
    }

    async fn dead_letter(&self, id: &WorkId, token: &LeaseToken, reason: &str) -> Result<()> {
        self.inner.dead_letter(id, token, reason).await
    }

    async fn get(&self, id: &WorkId) -> Result<Option<WorkItem>> {
        self.inner.get(id).await
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<WorkItem>> {
        self.inner.dead_letters(limit).await
    }

    async fn requeue_dead_letter(&self, id: &WorkId) -> Result<()> {
        self.inner.requeue_dead_letter(id).await
    }

    async fn depth(&self) -> Result<u64> {
        self.inner.depth().await
    }
}

struct Running {
    dispatch: Arc<DispatchLoop>,
    cancel: CancellationToken,
    events: broadcast::Receiver<Event>,
    handle: JoinHandle<Result<DispatchSummary>>,
}

impl Running {
    async fn stop(self) -> DispatchSummary {
        self.cancel.cancel();
        tokio::time::timeout(WAIT, self.handle)
            .await
            .expect("loop did not stop in time")
            .expect("loop task panicked")
            .expect("loop returned an error")
    }
}

fn spawn_loop(
    store: Arc<dyn WorkItemStore>,
    sender: Arc<dyn Sender>,
    config: DispatchConfig,
) -> Running {
    let dispatch = Arc::new(DispatchLoop::new(store, sender, config).unwrap());
    let events = dispatch.subscribe();
    let cancel = CancellationToken::new();
    let handle = tokio::spawn({
        let dispatch = Arc::clone(&dispatch);
        let cancel = cancel.clone();
        async move { dispatch.start(cancel).await }
    });
    Running {
        dispatch,
        cancel,
        events,
        handle,
    }
}

/// Next event matching `pred`, skipping the rest.
async fn wait_for(
    events: &mut broadcast::Receiver<Event>,
    pred: impl Fn(&EventKind) -> bool,
) -> EventKind {
    tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event stream closed");
            if pred(&event.kind) {
                return event.kind;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

// ---------------------------------------------------------------------------
// Delivery outcomes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn transient_failures_retry_until_success() {
    let store = Arc::new(InMemoryStore::new());
    let sender = Arc::new(ScriptedSender::new([
        DeliveryOutcome::TransientFailure("503".to_string()),
        DeliveryOutcome::TransientFailure("503".to_string()),
        DeliveryOutcome::TransientFailure("timeout".to_string()),
    ]));
    let id = store.enqueue(hook("retry")).await.unwrap();

    let mut running = spawn_loop(store.clone(), sender.clone(), fast_config());
    let delivered = wait_for(&mut running.events, |k| {
        matches!(k, EventKind::Delivered { .. })
    })
    .await;
    let summary = running.stop().await;

    assert_eq!(
        delivered,
        EventKind::Delivered {
            id: id.clone(),
            attempt: 4
        }
    );
    assert_eq!(sender.attempts_seen().await, vec![0, 1, 2, 3]);
    assert!(store.get(&id).await.unwrap().is_none(), "acknowledged item is removed");
    assert_eq!(summary.retried, 3);
    assert_eq!(summary.delivered, 1);
    assert_eq!(summary.dead_lettered, 0);
}

#[tokio::test]
async fn retries_report_growing_backoff() {
    let store = Arc::new(InMemoryStore::new());
    let sender = Arc::new(ScriptedSender::new([
        DeliveryOutcome::TransientFailure("503".to_string()),
        DeliveryOutcome::TransientFailure("503".to_string()),
    ]));
    store.enqueue(hook("backoff")).await.unwrap();

    let mut running = spawn_loop(store, sender, fast_config());
    let mut backoffs = Vec::new();
    for _ in 0..2 {
        if let EventKind::Retried { backoff_ms, .. } =
            wait_for(&mut running.events, |k| matches!(k, EventKind::Retried { .. })).await
        {
            backoffs.push(backoff_ms);
        }
    }
    running.stop().await;

    assert_eq!(backoffs, vec![5, 10]);
}

#[tokio::test]
async fn permanent_failure_dead_letters_without_retry() {
    let store = Arc::new(InMemoryStore::new());
    let sender = Arc::new(ScriptedSender::new([DeliveryOutcome::PermanentFailure(
        "410 Gone".to_string(),
    )]));
    let id = store.enqueue(hook("gone")).await.unwrap();

    let mut running = spawn_loop(store.clone(), sender.clone(), fast_config());
    let event = wait_for(&mut running.events, |k| {
        matches!(k, EventKind::DeadLettered { .. })
    })
    .await;
    let summary = running.stop().await;

    assert_eq!(
        event,
        EventKind::DeadLettered {
            id: id.clone(),
            attempts: 1,
            reason: "410 Gone".to_string(),
        }
    );
    assert_eq!(sender.attempts_seen().await, vec![0]);

    let item = store.get(&id).await.unwrap().expect("dead letter is kept");
    assert!(item.is_dead_lettered());
    assert_eq!(item.attempts, 1);
    assert_eq!(item.last_error.as_deref(), Some("410 Gone"));
    assert_eq!(item.payload, br#"{"tag":"gone"}"#.to_vec());
    assert_eq!(summary.dead_lettered, 1);
    assert_eq!(summary.retried, 0);
}

#[tokio::test]
async fn exhausted_attempts_dead_letter() {
    let store = Arc::new(InMemoryStore::new());
    let sender = Arc::new(FixedSender(DeliveryOutcome::TransientFailure(
        "connection refused".to_string(),
    )));
    let id = store.enqueue(hook("down")).await.unwrap();

    let config = DispatchConfig {
        max_attempts: 3,
        ..fast_config()
    };
    let mut running = spawn_loop(store.clone(), sender, config);
    let event = wait_for(&mut running.events, |k| {
        matches!(k, EventKind::DeadLettered { .. })
    })
    .await;
    let summary = running.stop().await;

    match event {
        EventKind::DeadLettered {
            id: dead, attempts, reason,
        } => {
            assert_eq!(dead, id);
            assert_eq!(attempts, 3);
            assert!(reason.contains("connection refused"), "{reason}");
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(summary.retried, 2);
    assert_eq!(summary.dead_lettered, 1);
    assert_eq!(store.dead_letters(10).await.unwrap().len(), 1);
    assert_eq!(store.depth().await.unwrap(), 0);
}

#[tokio::test]
async fn max_attempts_of_one_never_retries() {
    let store = Arc::new(InMemoryStore::new());
    let sender = Arc::new(FixedSender(DeliveryOutcome::TransientFailure(
        "503".to_string(),
    )));
    store.enqueue(hook("once")).await.unwrap();

    let config = DispatchConfig {
        max_attempts: 1,
        ..fast_config()
    };
    let mut running = spawn_loop(store, sender, config);
    wait_for(&mut running.events, |k| {
        matches!(k, EventKind::DeadLettered { attempts: 1, .. })
    })
    .await;
    let summary = running.stop().await;
    assert_eq!(summary.retried, 0);
}

#[tokio::test]
async fn expired_lease_is_reported_and_item_redelivered() {
    let store = Arc::new(InMemoryStore::new());
    let sender = Arc::new(SlowFirstSender {
        calls: AtomicUsize::new(0),
        stall: Duration::from_millis(200),
    });
    let id = store.enqueue(hook("slow")).await.unwrap();

    let config = DispatchConfig {
        lease_duration: Duration::from_millis(50),
        ..fast_config()
    };
    let mut running = spawn_loop(store.clone(), sender, config);
    let lost = wait_for(&mut running.events, |k| {
        matches!(k, EventKind::LeaseLost { .. })
    })
    .await;
    let delivered = wait_for(&mut running.events, |k| {
        matches!(k, EventKind::Delivered { .. })
    })
    .await;
    let summary = running.stop().await;

    assert_eq!(lost, EventKind::LeaseLost { id: id.clone() });
    // A lost lease is not a failed attempt.
    assert_eq!(delivered, EventKind::Delivered { id, attempt: 1 });
    assert_eq!(summary.lease_lost, 1);
    assert_eq!(summary.delivered, 1);
}

// ---------------------------------------------------------------------------
// Worker pool and shutdown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn parallelism_is_bounded() {
    let store = Arc::new(InMemoryStore::new());
    let probe = Arc::new(ConcurrencyProbe::default());
    for i in 0..12 {
        store.enqueue(hook(&format!("p{i}"))).await.unwrap();
    }

    let config = DispatchConfig {
        batch_size: 12,
        max_parallelism: 3,
        ..fast_config()
    };
    let mut running = spawn_loop(store.clone(), probe.clone(), config);
    for _ in 0..12 {
        wait_for(&mut running.events, |k| {
            matches!(k, EventKind::Delivered { .. })
        })
        .await;
    }
    let summary = running.stop().await;

    assert_eq!(summary.delivered, 12);
    let peak = probe.peak.load(Ordering::SeqCst);
    assert!(peak <= 3, "peak concurrency {peak} exceeded the pool");
    assert!(peak >= 2, "deliveries never overlapped");
    assert_eq!(store.depth().await.unwrap(), 0);
}

#[tokio::test]
async fn cancellation_drains_in_flight_deliveries() {
    let store = Arc::new(ObservedStore::default());
    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    let sender = Arc::new(GatedSender {
        gate: Semaphore::new(0),
        started: started_tx,
    });
    store.enqueue(hook("a")).await.unwrap();
    store.enqueue(hook("b")).await.unwrap();

    let running = spawn_loop(store.clone(), sender.clone(), fast_config());
    for _ in 0..2 {
        tokio::time::timeout(WAIT, started_rx.recv())
            .await
            .expect("delivery never started");
    }
    let leases_at_cancel = store.lease_calls();

    running.cancel.cancel();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!running.handle.is_finished(), "loop stopped before draining");
    assert_eq!(running.dispatch.state(), LoopState::Running);

    sender.gate.add_permits(2);
    let dispatch = Arc::clone(&running.dispatch);
    let summary = running.stop().await;

    assert_eq!(summary.delivered, 2);
    assert_eq!(store.lease_calls(), leases_at_cancel, "leased after cancel");
    assert_eq!(store.depth().await.unwrap(), 0);
    assert_eq!(dispatch.state(), LoopState::Stopped);
}

#[tokio::test]
async fn idle_loop_stops_promptly() {
    let store = Arc::new(InMemoryStore::new());
    let sender = Arc::new(FixedSender(DeliveryOutcome::Success));
    let config = DispatchConfig {
        poll_interval: Duration::from_secs(3600),
        ..fast_config()
    };

    let mut running = spawn_loop(store, sender, config);
    tokio::time::sleep(Duration::from_millis(20)).await;
    let dispatch = Arc::clone(&running.dispatch);
    running.cancel.cancel();
    let stopped = wait_for(&mut running.events, |k| {
        matches!(k, EventKind::Stopped { .. })
    })
    .await;
    let summary = running.stop().await;

    assert_eq!(summary, DispatchSummary::default());
    assert_eq!(stopped, EventKind::Stopped { error: None });
    assert_eq!(dispatch.state(), LoopState::Stopped);
}

#[tokio::test]
async fn second_start_is_rejected_while_running() {
    let store = Arc::new(InMemoryStore::new());
    let sender = Arc::new(FixedSender(DeliveryOutcome::Success));
    let running = spawn_loop(store, sender, fast_config());

    let mut state = running.dispatch.watch_state();
    tokio::time::timeout(WAIT, state.wait_for(|s| *s == LoopState::Running))
        .await
        .expect("loop never started")
        .unwrap();

    let second = running.dispatch.start(CancellationToken::new()).await;
    assert!(matches!(second, Err(Error::Other(_))));

    running.stop().await;
}

// ---------------------------------------------------------------------------
// Failure modes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn persistent_storage_failure_stops_the_loop() {
    let store = Arc::new(ObservedStore::failing_leases(usize::MAX));
    let sender = Arc::new(FixedSender(DeliveryOutcome::Success));
    let config = DispatchConfig {
        max_storage_retries: 2,
        backoff: Backoff::new(Duration::from_millis(1), Duration::from_millis(5)),
        ..fast_config()
    };

    let dispatch = DispatchLoop::new(store.clone(), sender, config).unwrap();
    let mut events = dispatch.subscribe();
    let result = tokio::time::timeout(WAIT, dispatch.start(CancellationToken::new()))
        .await
        .expect("loop did not give up");

    let err = result.expect_err("storage failure must be fatal");
    assert!(err.is_storage());
    assert_eq!(store.lease_calls(), 3, "initial attempt plus two retries");
    assert_eq!(dispatch.state(), LoopState::Stopped);

    let stopped = wait_for(&mut events, |k| matches!(k, EventKind::Stopped { .. })).await;
    assert!(matches!(stopped, EventKind::Stopped { error: Some(_) }));
}

#[tokio::test]
async fn repeated_settle_failure_stops_after_draining_the_batch() {
    let store = Arc::new(ObservedStore::failing_acks(usize::MAX));
    let sender = Arc::new(FixedSender(DeliveryOutcome::Success));
    let first = store.enqueue(hook("a")).await.unwrap();
    store.enqueue(hook("b")).await.unwrap();

    let dispatch = DispatchLoop::new(store.clone(), sender, fast_config()).unwrap();
    let result = tokio::time::timeout(WAIT, dispatch.start(CancellationToken::new()))
        .await
        .expect("loop did not stop");

    assert!(result.expect_err("settle failure must be fatal").is_storage());
    assert_eq!(store.lease_calls(), 1, "no lease after a fatal settle");
    // Still leased; it comes back once the lease runs out.
    let item = store.get(&first).await.unwrap().unwrap();
    assert!(item.lease_token.is_some());
    assert_eq!(item.attempts, 0);
}

#[tokio::test]
async fn transient_lease_failure_recovers() {
    let store = Arc::new(ObservedStore::failing_leases(1));
    let sender = Arc::new(FixedSender(DeliveryOutcome::Success));
    let id = store.enqueue(hook("flaky-lease")).await.unwrap();

    let config = DispatchConfig {
        backoff: Backoff::new(Duration::from_millis(1), Duration::from_millis(5)),
        ..fast_config()
    };
    let mut running = spawn_loop(store.clone(), sender, config);
    let delivered = wait_for(&mut running.events, |k| {
        matches!(k, EventKind::Delivered { .. })
    })
    .await;
    assert_eq!(running.dispatch.state(), LoopState::Running);
    let summary = running.stop().await;

    assert_eq!(delivered, EventKind::Delivered { id: id.clone(), attempt: 1 });
    assert!(store.lease_calls() >= 2, "failed lease was not retried");
    assert_eq!(summary.delivered, 1);
    assert!(store.get(&id).await.unwrap().is_none());
}

#[tokio::test]
async fn acknowledge_failing_once_is_retried() {
    let store = Arc::new(ObservedStore::failing_acks(1));
    let sender = Arc::new(FixedSender(DeliveryOutcome::Success));
    let id = store.enqueue(hook("flaky-ack")).await.unwrap();

    let mut running = spawn_loop(store.clone(), sender, fast_config());
    let delivered = wait_for(&mut running.events, |k| {
        matches!(k, EventKind::Delivered { .. })
    })
    .await;
    assert_eq!(running.dispatch.state(), LoopState::Running);
    let summary = running.stop().await;

    assert_eq!(delivered, EventKind::Delivered { id: id.clone(), attempt: 1 });
    assert_eq!(summary.delivered, 1);
    assert_eq!(summary.lease_lost, 0);
    assert!(store.get(&id).await.unwrap().is_none(), "acknowledged item is removed");
}

#[test]
fn invalid_config_is_rejected_at_construction() {
    let store = Arc::new(InMemoryStore::new());
    let sender = Arc::new(FixedSender(DeliveryOutcome::Success));
    let config = DispatchConfig {
        batch_size: 0,
        ..fast_config()
    };

    let result = DispatchLoop::new(store, sender, config);
    assert!(matches!(result, Err(Error::Config(_))));
}
