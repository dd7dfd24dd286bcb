//! Admission, execution and lifecycle bookkeeping for operations.
//!
//! The scheduler owns every lifecycle transition. All admission state
//! (pending queue, running set, busy exclusion groups, idempotency keys)
//! lives behind one mutex, so a submit, a cancel and an executor finishing
//! can never interleave halfway. The lock is never held across an await.

use std::any::Any;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nodekeeper_core::{
    FailureCause, FailureKind, FieldDef, Operation, OperationId, OperationState,
};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::clock::Clock;
use super::config::EngineConfig;
use super::executor::{ExecutionContext, ExecutionError, ExecutorFactory, ProgressReporter};
use super::ledger::{OperationFilter, OperationLedger};
use super::metrics;
use super::operation::EngineError;
use super::registry::OperationRegistry;

// ---------------------------------------------------------------------------
// Admission state
// ---------------------------------------------------------------------------

struct Queued {
    id: OperationId,
    type_name: &'static str,
    group: Option<&'static str>,
    factory: ExecutorFactory,
}

struct Running {
    group: Option<&'static str>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Admission {
    /// Keyed by submission sequence, so iteration order is FIFO.
    pending: BTreeMap<u64, Queued>,
    running: HashMap<OperationId, Running>,
    busy_groups: HashSet<&'static str>,
    idempotency: HashMap<String, OperationId>,
    next_seq: u64,
    shutting_down: bool,
}

impl Admission {
    fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.running.is_empty()
    }

    /// Earliest pending operation whose exclusion group is free.
    fn next_eligible(&self) -> Option<u64> {
        self.pending
            .iter()
            .find(|(_, q)| q.group.is_none_or(|g| !self.busy_groups.contains(g)))
            .map(|(seq, _)| *seq)
    }
}

/// Public description of a submittable operation type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationTypeInfo {
    pub name: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exclusion_group: Option<&'static str>,
    pub fields: Vec<FieldDef>,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

struct Inner {
    registry: Arc<OperationRegistry>,
    ledger: Arc<OperationLedger>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    admission: Mutex<Admission>,
    idle: Notify,
}

/// Bounded, exclusion-aware executor pool in front of the operation ledger.
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let adm = self.inner.admission.lock();
        f.debug_struct("Scheduler")
            .field("running", &adm.running.len())
            .field("pending", &adm.pending.len())
            .field("shutting_down", &adm.shutting_down)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    #[must_use]
    pub fn new(registry: Arc<OperationRegistry>, config: EngineConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                ledger: Arc::new(OperationLedger::new()),
                clock,
                config,
                admission: Mutex::new(Admission::default()),
                idle: Notify::new(),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn registry(&self) -> &OperationRegistry {
        &self.inner.registry
    }

    /// Validates and enqueues an operation, returning its id.
    ///
    /// Must be called from within a tokio runtime: admission may start the
    /// executor immediately.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UnknownType`], [`EngineError::DisabledType`] or
    /// [`EngineError::Validation`] when the request is rejected (no operation
    /// is created), and [`EngineError::ShuttingDown`] after [`Scheduler::shutdown`].
    pub fn submit(&self, type_name: &str, payload: serde_json::Value) -> Result<OperationId, EngineError> {
        self.submit_with_key(type_name, payload, None)
    }

    /// Like [`Scheduler::submit`], but a repeated `idempotency_key` returns the
    /// id of the operation first submitted with it, as long as that operation
    /// is still retained.
    ///
    /// # Errors
    ///
    /// See [`Scheduler::submit`].
    pub fn submit_with_key(
        &self,
        type_name: &str,
        payload: serde_json::Value,
        idempotency_key: Option<String>,
    ) -> Result<OperationId, EngineError> {
        let descriptor = self.inner.registry.lookup(type_name)?;
        let request = descriptor.decode(payload)?;

        let mut adm = self.inner.admission.lock();
        if adm.shutting_down {
            return Err(EngineError::ShuttingDown);
        }
        if let Some(key) = &idempotency_key {
            if let Some(existing) = adm.idempotency.get(key) {
                if self.inner.ledger.contains(existing) {
                    tracing::debug!(op_id = %existing, idempotency_key = %key, "duplicate submission");
                    return Ok(*existing);
                }
            }
        }

        let id = loop {
            let candidate = OperationId::generate();
            if !self.inner.ledger.contains(&candidate) {
                break candidate;
            }
        };
        let op = Operation::new(id, request, self.inner.clock.now_ms(), idempotency_key.clone());
        self.inner.ledger.insert(op);
        if let Some(key) = idempotency_key {
            adm.idempotency.insert(key, id);
        }

        let seq = adm.next_seq;
        adm.next_seq += 1;
        adm.pending.insert(
            seq,
            Queued {
                id,
                type_name: descriptor.name(),
                group: descriptor.exclusion_group(),
                factory: Arc::clone(descriptor.executor_factory()),
            },
        );

        tracing::info!(op_id = %id, op_type = descriptor.name(), "operation submitted");
        metrics::record_submitted(descriptor.name());

        self.pump(&mut adm);
        Ok(id)
    }

    /// Requests cancellation and returns the state the operation moved to.
    ///
    /// A pending operation becomes `CANCELLED` without its executor ever
    /// running. A running one becomes `CANCELLING` and its executor is
    /// signalled; it turns `CANCELLED` once the executor returns. Cancelling
    /// an operation that is already `CANCELLING` is acknowledged again.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] for unknown or evicted ids and
    /// [`EngineError::AlreadyTerminal`] for finished operations.
    pub fn cancel(&self, id: &OperationId) -> Result<OperationState, EngineError> {
        let mut adm = self.inner.admission.lock();
        let state = self
            .inner
            .ledger
            .get(id)
            .map(|op| op.state())
            .ok_or_else(|| EngineError::NotFound { id: id.to_string() })?;

        match state {
            OperationState::Pending => {
                adm.pending.retain(|_, q| q.id != *id);
                let cancelled = self.transition(id, OperationState::Cancelled);
                if let Some(op) = cancelled {
                    tracing::info!(op_id = %id, op_type = op.type_name(), "pending operation cancelled");
                    metrics::record_finished(op.type_name(), OperationState::Cancelled);
                }
                self.publish_gauges(&adm);
                if adm.is_idle() {
                    self.inner.idle.notify_waiters();
                }
                Ok(OperationState::Cancelled)
            }
            OperationState::Running => {
                if let Some(running) = adm.running.get(id) {
                    running.cancel.cancel();
                }
                self.transition(id, OperationState::Cancelling);
                tracing::info!(op_id = %id, "cancellation requested");
                Ok(OperationState::Cancelling)
            }
            OperationState::Cancelling => Ok(OperationState::Cancelling),
            terminal => Err(EngineError::AlreadyTerminal {
                id: id.to_string(),
                state: terminal,
            }),
        }
    }

    /// Snapshot of one operation.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] for unknown or evicted ids.
    pub fn get(&self, id: &OperationId) -> Result<Operation, EngineError> {
        self.inner
            .ledger
            .get(id)
            .ok_or_else(|| EngineError::NotFound { id: id.to_string() })
    }

    #[must_use]
    pub fn list(&self, filter: &OperationFilter) -> Vec<Operation> {
        self.inner.ledger.list(filter)
    }

    /// Enabled operation types in registration order.
    #[must_use]
    pub fn types(&self) -> Vec<OperationTypeInfo> {
        self.inner
            .registry
            .enabled()
            .map(|d| OperationTypeInfo {
                name: d.name(),
                exclusion_group: d.exclusion_group(),
                fields: d.schema().fields().to_vec(),
            })
            .collect()
    }

    /// Evicts terminal operations older than the retention period and
    /// returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let mut adm = self.inner.admission.lock();
        let evicted = self
            .inner
            .ledger
            .remove_expired(self.inner.clock.now_ms(), self.inner.config.retention_ms);
        for op in &evicted {
            if let Some(key) = op.idempotency_key() {
                if adm.idempotency.get(key) == Some(&op.id()) {
                    adm.idempotency.remove(key);
                }
            }
        }
        drop(adm);

        if !evicted.is_empty() {
            tracing::debug!(count = evicted.len(), "evicted expired operations");
            metrics::record_evicted(evicted.len());
        }
        evicted.len()
    }

    /// Stops admitting work: new submissions fail, pending operations are
    /// cancelled and running ones are signalled to stop.
    pub fn shutdown(&self) {
        let mut adm = self.inner.admission.lock();
        if adm.shutting_down {
            return;
        }
        adm.shutting_down = true;

        let pending = std::mem::take(&mut adm.pending);
        for queued in pending.values() {
            if self.transition(&queued.id, OperationState::Cancelled).is_some() {
                metrics::record_finished(queued.type_name, OperationState::Cancelled);
            }
        }
        for (id, running) in &adm.running {
            running.cancel.cancel();
            self.transition(id, OperationState::Cancelling);
        }
        tracing::info!(
            cancelled_pending = pending.len(),
            signalled_running = adm.running.len(),
            "scheduler shutting down"
        );

        self.publish_gauges(&adm);
        if adm.is_idle() {
            self.inner.idle.notify_waiters();
        }
    }

    /// Waits until no operation is pending or running. Returns `false` if
    /// `timeout` elapsed first.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.inner.idle.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                let idle = self.inner.admission.lock().is_idle();
                if idle {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    #[must_use]
    pub fn running_count(&self) -> usize {
        self.inner.admission.lock().running.len()
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.admission.lock().pending.len()
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.inner.admission.lock().shutting_down
    }

    // -- internals -----------------------------------------------------------

    /// Admits pending operations while workers and groups allow.
    fn pump(&self, adm: &mut Admission) {
        let max_workers = self.inner.config.max_workers.max(1);
        while adm.running.len() < max_workers {
            let Some(queued) = adm.next_eligible().and_then(|seq| adm.pending.remove(&seq)) else {
                break;
            };
            self.start(adm, queued);
        }
        self.publish_gauges(adm);
    }

    fn start(&self, adm: &mut Admission, queued: Queued) {
        let Queued {
            id,
            type_name,
            group,
            factory,
        } = queued;

        let Some(request) = self
            .transition(&id, OperationState::Running)
            .map(|op| Arc::clone(op.request()))
        else {
            tracing::warn!(op_id = %id, "admitted operation vanished from ledger");
            return;
        };

        let cancel = CancellationToken::new();
        if let Some(group) = group {
            adm.busy_groups.insert(group);
        }
        adm.running.insert(
            id,
            Running {
                group,
                cancel: cancel.clone(),
            },
        );
        tracing::info!(op_id = %id, op_type = type_name, group = group.unwrap_or("-"), "operation started");

        let ctx = ExecutionContext::new(
            id,
            cancel,
            ProgressReporter::new(id, Arc::clone(&self.inner.ledger)),
        );
        let span = tracing::info_span!(
            "operation",
            op_id = %id,
            op_type = type_name,
            duration_ms = tracing::field::Empty,
            state = tracing::field::Empty,
        );
        let scheduler = self.clone();

        tokio::spawn(
            async move {
                let started = Instant::now();
                let run = tokio::spawn(
                    async move {
                        let mut executor = factory();
                        executor.execute(&request, &ctx).await
                    }
                    .in_current_span(),
                );
                let outcome = match run.await {
                    Ok(outcome) => outcome,
                    Err(join) if join.is_panic() => Err(ExecutionError::Failed(FailureCause::new(
                        FailureKind::Panic,
                        format!("executor panicked: {}", panic_message(join.into_panic().as_ref())),
                    ))),
                    Err(_) => Err(ExecutionError::Failed(FailureCause::new(
                        FailureKind::Internal,
                        "executor task was aborted",
                    ))),
                };
                let state = scheduler.finish(&id, type_name, outcome);

                #[allow(clippy::cast_possible_truncation)]
                let duration_ms = started.elapsed().as_millis() as u64;
                tracing::Span::current().record("duration_ms", duration_ms);
                tracing::Span::current().record("state", state.map_or("-", |s| s.as_str()));
            }
            .instrument(span),
        );
    }

    /// Records an executor's outcome, frees its worker and group, and admits
    /// whatever became eligible.
    fn finish(
        &self,
        id: &OperationId,
        type_name: &'static str,
        outcome: Result<serde_json::Value, ExecutionError>,
    ) -> Option<OperationState> {
        let mut adm = self.inner.admission.lock();
        if let Some(running) = adm.running.remove(id) {
            if let Some(group) = running.group {
                adm.busy_groups.remove(group);
            }
        }

        let now = self.inner.clock.now_ms();
        let state = self
            .inner
            .ledger
            .update(id, |op| finalize(op, outcome, now));

        match &state {
            Some(Ok(state)) => {
                tracing::info!(op_id = %id, op_type = type_name, state = %state, "operation finished");
                metrics::record_finished(type_name, *state);
            }
            Some(Err(e)) => {
                tracing::error!(op_id = %id, op_type = type_name, error = %e, "could not record outcome");
            }
            None => tracing::warn!(op_id = %id, "finished operation missing from ledger"),
        }

        self.pump(&mut adm);
        if adm.is_idle() {
            self.inner.idle.notify_waiters();
        }
        state.and_then(Result::ok)
    }

    fn transition(&self, id: &OperationId, next: OperationState) -> Option<Operation> {
        let now = self.inner.clock.now_ms();
        match self.inner.ledger.update(id, |op| {
            op.transition(next, now).map(|()| op.clone())
        }) {
            Some(Ok(op)) => Some(op),
            Some(Err(e)) => {
                tracing::warn!(op_id = %id, error = %e, "rejected lifecycle transition");
                None
            }
            None => None,
        }
    }

    fn publish_gauges(&self, adm: &Admission) {
        metrics::set_queue_depth(adm.running.len(), adm.pending.len());
    }
}

/// Applies an executor outcome to a `RUNNING` or `CANCELLING` operation.
fn finalize(
    op: &mut Operation,
    outcome: Result<serde_json::Value, ExecutionError>,
    now_ms: u64,
) -> Result<OperationState, nodekeeper_core::InvalidTransition> {
    if op.state() == OperationState::Cancelling {
        let discarded = match &outcome {
            Ok(_) => Some("completed".to_string()),
            Err(ExecutionError::Failed(cause)) => Some(format!("failed ({cause})")),
            Err(ExecutionError::Cancelled) => None,
        };
        if let Some(discarded) = discarded {
            let progress = op
                .progress()
                .clone()
                .with_message(format!("cancelled; executor {discarded} after cancellation"));
            op.set_progress(progress);
        }
        op.transition(OperationState::Cancelled, now_ms)?;
        return Ok(OperationState::Cancelled);
    }

    match outcome {
        Ok(result) => op.complete(result, now_ms)?,
        Err(ExecutionError::Failed(cause)) => {
            tracing::warn!(op_id = %op.id(), op_type = op.type_name(), cause = %cause, "operation failed");
            op.fail(cause, now_ms)?;
        }
        Err(ExecutionError::Cancelled) => op.fail(
            FailureCause::new(
                FailureKind::Internal,
                "executor reported cancellation that was never requested",
            ),
            now_ms,
        )?,
    }
    Ok(op.state())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use nodekeeper_core::requests::{
        CleanupRequest, DrainRequest, FlushRequest, ScrubRequest, TruncateRequest,
    };
    use nodekeeper_core::OperationRequest;
    use proptest::prelude::*;
    use serde_json::json;
    use tokio::sync::Semaphore;

    use super::*;
    use crate::service::clock::ManualClock;
    use crate::service::executor::Executor;
    use crate::service::registry::OperationTypeDescriptor;

    /// Shared observation point for test executors.
    struct Tracker {
        started: parking_lot::Mutex<Vec<OperationId>>,
        active: AtomicUsize,
        max_active: AtomicUsize,
        release: Semaphore,
    }

    impl Default for Tracker {
        fn default() -> Self {
            Self {
                started: parking_lot::Mutex::default(),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
                release: Semaphore::new(0),
            }
        }
    }

    impl Tracker {
        fn release(&self, n: usize) {
            self.release.add_permits(n);
        }

        fn started(&self) -> Vec<OperationId> {
            self.started.lock().clone()
        }
    }

    #[derive(Clone, Copy)]
    enum Behaviour {
        /// Waits for a permit or cancellation.
        Block,
        /// Waits for a permit, ignoring cancellation.
        IgnoreCancel,
        Instant,
        Panic,
        SpuriousCancel,
        Fail,
    }

    struct TestExecutor {
        tracker: Arc<Tracker>,
        behaviour: Behaviour,
    }

    #[async_trait]
    impl Executor for TestExecutor {
        async fn execute(
            &mut self,
            _request: &OperationRequest,
            ctx: &ExecutionContext,
        ) -> Result<serde_json::Value, ExecutionError> {
            self.tracker.started.lock().push(ctx.id());
            let now = self.tracker.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.tracker.max_active.fetch_max(now, Ordering::SeqCst);

            let outcome = match self.behaviour {
                Behaviour::Block => {
                    tokio::select! {
                        () = ctx.cancelled() => Err(ExecutionError::Cancelled),
                        permit = self.tracker.release.acquire() => {
                            permit.expect("semaphore open").forget();
                            Ok(json!({ "done": true }))
                        }
                    }
                }
                Behaviour::IgnoreCancel => {
                    self.tracker
                        .release
                        .acquire()
                        .await
                        .expect("semaphore open")
                        .forget();
                    Ok(json!({ "done": true }))
                }
                Behaviour::Instant => Ok(json!({ "done": true })),
                Behaviour::Panic => panic!("boom"),
                Behaviour::SpuriousCancel => Err(ExecutionError::Cancelled),
                Behaviour::Fail => Err(ExecutionError::failed(
                    FailureKind::ManagementRpc,
                    "connection refused",
                )),
            };
            self.tracker.active.fetch_sub(1, Ordering::SeqCst);
            outcome
        }
    }

    fn factory(
        tracker: &Arc<Tracker>,
        behaviour: Behaviour,
    ) -> impl Fn() -> Box<dyn Executor> + Send + Sync + 'static {
        let tracker = Arc::clone(tracker);
        move || {
            Box::new(TestExecutor {
                tracker: Arc::clone(&tracker),
                behaviour,
            }) as Box<dyn Executor>
        }
    }

    struct Harness {
        scheduler: Scheduler,
        tracker: Arc<Tracker>,
        clock: Arc<ManualClock>,
    }

    /// cleanup/scrub: blocking, group "maintenance"; flush: instant, no group;
    /// drain: blocking, no group; truncate: disabled.
    fn harness_with(max_workers: usize, drain: Behaviour) -> Harness {
        let tracker = Arc::new(Tracker::default());
        let registry = OperationRegistry::builder()
            .register(
                OperationTypeDescriptor::of::<CleanupRequest>(factory(&tracker, Behaviour::Block))
                    .in_group("maintenance"),
            )
            .unwrap()
            .register(
                OperationTypeDescriptor::of::<ScrubRequest>(factory(&tracker, Behaviour::Block))
                    .in_group("maintenance"),
            )
            .unwrap()
            .register(OperationTypeDescriptor::of::<FlushRequest>(factory(
                &tracker,
                Behaviour::Instant,
            )))
            .unwrap()
            .register(OperationTypeDescriptor::of::<DrainRequest>(factory(&tracker, drain)))
            .unwrap()
            .register(
                OperationTypeDescriptor::of::<TruncateRequest>(factory(&tracker, Behaviour::Instant))
                    .enabled(false),
            )
            .unwrap()
            .build();
        let clock = Arc::new(ManualClock::new(1_000));
        let config = EngineConfig {
            max_workers,
            retention_ms: 5,
            ..EngineConfig::default()
        };
        let scheduler = Scheduler::new(Arc::new(registry), config, clock.clone());
        Harness {
            scheduler,
            tracker,
            clock,
        }
    }

    fn harness(max_workers: usize) -> Harness {
        harness_with(max_workers, Behaviour::Block)
    }

    async fn wait_for(scheduler: &Scheduler, id: &OperationId, state: OperationState) -> Operation {
        for _ in 0..2_000 {
            let op = scheduler.get(id).unwrap();
            if op.state() == state {
                return op;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!(
            "operation {id} never reached {state}, last seen {}",
            scheduler.get(id).unwrap().state()
        );
    }

    fn cleanup(h: &Harness) -> OperationId {
        h.scheduler
            .submit("cleanup", json!({ "keyspace": "ks1" }))
            .unwrap()
    }

    fn scrub(h: &Harness) -> OperationId {
        h.scheduler
            .submit("scrub", json!({ "keyspace": "ks1" }))
            .unwrap()
    }

    #[tokio::test]
    async fn submitted_operations_get_unique_ids() {
        let h = harness(4);
        let ids: HashSet<_> = (0..50)
            .map(|_| h.scheduler.submit("flush", json!({})).unwrap())
            .collect();
        assert_eq!(ids.len(), 50);
        assert!(h.scheduler.wait_idle(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn flush_completes_with_result() {
        let h = harness(4);
        let id = h.scheduler.submit("flush", json!({})).unwrap();
        let op = wait_for(&h.scheduler, &id, OperationState::Completed).await;
        assert_eq!(op.result(), Some(&json!({ "done": true })));
        assert!(op.started_at().is_some());
        assert!(op.completed_at().is_some());
    }

    #[tokio::test]
    async fn unknown_type_creates_nothing() {
        let h = harness(4);
        let err = h.scheduler.submit("bogus-op", json!({})).unwrap_err();
        assert_eq!(
            err,
            EngineError::UnknownType {
                name: "bogus-op".into()
            }
        );
        assert!(h.scheduler.list(&OperationFilter::default()).is_empty());
    }

    #[tokio::test]
    async fn invalid_payload_is_rejected_with_fields() {
        let h = harness(4);
        let err = h
            .scheduler
            .submit("cleanup", json!({ "tables": ["t1"] }))
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
        assert!(err.field_errors().iter().any(|e| e.field == "keyspace"));
        assert!(h.scheduler.list(&OperationFilter::default()).is_empty());
    }

    #[tokio::test]
    async fn disabled_type_is_rejected_while_others_work() {
        let h = harness(4);
        let err = h
            .scheduler
            .submit("truncate", json!({ "keyspace": "ks1", "table": "t1" }))
            .unwrap_err();
        assert_eq!(err.kind(), "disabled-type");

        let id = h.scheduler.submit("flush", json!({})).unwrap();
        wait_for(&h.scheduler, &id, OperationState::Completed).await;
        assert!(h.scheduler.types().iter().all(|t| t.name != "truncate"));
    }

    #[tokio::test]
    async fn exclusion_group_serializes_in_fifo_order() {
        let h = harness(4);
        let a = cleanup(&h);
        let b = scrub(&h);
        let c = cleanup(&h);
        let flush = h.scheduler.submit("flush", json!({})).unwrap();

        wait_for(&h.scheduler, &a, OperationState::Running).await;
        wait_for(&h.scheduler, &flush, OperationState::Completed).await;
        assert_eq!(h.scheduler.get(&b).unwrap().state(), OperationState::Pending);
        assert_eq!(h.scheduler.get(&c).unwrap().state(), OperationState::Pending);

        h.tracker.release(1);
        wait_for(&h.scheduler, &a, OperationState::Completed).await;
        wait_for(&h.scheduler, &b, OperationState::Running).await;
        assert_eq!(h.scheduler.get(&c).unwrap().state(), OperationState::Pending);

        h.tracker.release(2);
        wait_for(&h.scheduler, &c, OperationState::Completed).await;

        let maintenance: Vec<_> = h
            .tracker
            .started()
            .into_iter()
            .filter(|id| *id != flush)
            .collect();
        assert_eq!(maintenance, vec![a, b, c]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_submissions_keep_one_running_per_group() {
        let h = harness(4);
        let submitters: Vec<_> = (0..6)
            .map(|n| {
                let scheduler = h.scheduler.clone();
                tokio::spawn(async move {
                    let type_name = if n % 2 == 0 { "cleanup" } else { "scrub" };
                    scheduler
                        .submit(type_name, json!({ "keyspace": "ks1" }))
                        .unwrap()
                })
            })
            .collect();
        let mut ids = Vec::new();
        for submitter in submitters {
            ids.push(submitter.await.unwrap());
        }

        let sampler = {
            let scheduler = h.scheduler.clone();
            let ids = ids.clone();
            tokio::spawn(async move {
                let mut max_running = 0;
                while !ids.iter().all(|id| scheduler.get(id).unwrap().state().is_terminal()) {
                    let running = scheduler
                        .list(&OperationFilter {
                            type_name: None,
                            state: Some(OperationState::Running),
                        })
                        .len();
                    max_running = max_running.max(running);
                    tokio::task::yield_now().await;
                }
                max_running
            })
        };

        for _ in &ids {
            tokio::time::sleep(Duration::from_millis(5)).await;
            h.tracker.release(1);
        }
        assert!(h.scheduler.wait_idle(Duration::from_secs(5)).await);

        assert_eq!(sampler.await.unwrap(), 1);
        assert_eq!(h.tracker.max_active.load(Ordering::SeqCst), 1);
        assert_eq!(h.tracker.started().len(), 6);
        for id in &ids {
            assert_eq!(h.scheduler.get(id).unwrap().state(), OperationState::Completed);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn ids_are_unique_across_the_ledger(
            types in proptest::collection::vec(
                prop_oneof![Just("flush"), Just("drain"), Just("cleanup")],
                1..40,
            ),
            max_workers in 1usize..4,
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(async {
                let h = harness(max_workers);
                let ids: Vec<_> = types
                    .iter()
                    .map(|t| {
                        let payload = if *t == "cleanup" {
                            json!({ "keyspace": "ks1" })
                        } else {
                            json!({})
                        };
                        h.scheduler.submit(t, payload).unwrap()
                    })
                    .collect();
                let distinct: HashSet<_> = ids.iter().collect();
                prop_assert_eq!(distinct.len(), ids.len());
                prop_assert_eq!(h.scheduler.list(&OperationFilter::default()).len(), ids.len());

                h.scheduler.shutdown();
                prop_assert!(h.scheduler.wait_idle(Duration::from_secs(5)).await);
                Ok(())
            })?;
        }
    }

    #[tokio::test]
    async fn worker_limit_bounds_concurrency() {
        let h = harness(2);
        let ids: Vec<_> = (0..4)
            .map(|_| h.scheduler.submit("drain", json!({})).unwrap())
            .collect();
        wait_for(&h.scheduler, &ids[0], OperationState::Running).await;
        wait_for(&h.scheduler, &ids[1], OperationState::Running).await;
        assert_eq!(h.scheduler.running_count(), 2);
        assert_eq!(h.scheduler.pending_count(), 2);

        h.tracker.release(4);
        assert!(h.scheduler.wait_idle(Duration::from_secs(5)).await);
        assert_eq!(h.tracker.max_active.load(Ordering::SeqCst), 2);
        assert_eq!(h.tracker.started(), ids);
    }

    #[tokio::test]
    async fn cancelling_pending_operation_never_runs_it() {
        let h = harness(1);
        let first = h.scheduler.submit("drain", json!({})).unwrap();
        let second = h.scheduler.submit("drain", json!({})).unwrap();
        wait_for(&h.scheduler, &first, OperationState::Running).await;

        assert_eq!(h.scheduler.cancel(&second), Ok(OperationState::Cancelled));
        let op = h.scheduler.get(&second).unwrap();
        assert_eq!(op.state(), OperationState::Cancelled);
        assert!(op.started_at().is_none());

        h.tracker.release(1);
        assert!(h.scheduler.wait_idle(Duration::from_secs(5)).await);
        assert_eq!(h.tracker.started(), vec![first]);
    }

    #[tokio::test]
    async fn cancelling_running_operation_goes_through_cancelling() {
        let h = harness(4);
        let id = h.scheduler.submit("drain", json!({})).unwrap();
        wait_for(&h.scheduler, &id, OperationState::Running).await;

        assert_eq!(h.scheduler.cancel(&id), Ok(OperationState::Cancelling));
        let op = wait_for(&h.scheduler, &id, OperationState::Cancelled).await;
        assert!(op.result().is_none());
        assert!(op.failure_cause().is_none());

        let err = h.scheduler.cancel(&id).unwrap_err();
        assert_eq!(
            err,
            EngineError::AlreadyTerminal {
                id: id.to_string(),
                state: OperationState::Cancelled
            }
        );
    }

    #[tokio::test]
    async fn late_success_after_cancel_still_ends_cancelled() {
        let h = harness_with(4, Behaviour::IgnoreCancel);
        let id = h.scheduler.submit("drain", json!({})).unwrap();
        wait_for(&h.scheduler, &id, OperationState::Running).await;

        assert_eq!(h.scheduler.cancel(&id), Ok(OperationState::Cancelling));
        assert_eq!(h.scheduler.cancel(&id), Ok(OperationState::Cancelling));
        h.tracker.release(1);

        let op = wait_for(&h.scheduler, &id, OperationState::Cancelled).await;
        assert!(op.result().is_none());
        assert!(op
            .progress()
            .message
            .as_deref()
            .is_some_and(|m| m.contains("completed")));
    }

    #[tokio::test]
    async fn cancel_unknown_id_is_not_found() {
        let h = harness(4);
        let err = h.scheduler.cancel(&OperationId::generate()).unwrap_err();
        assert_eq!(err.kind(), "not-found");
    }

    #[tokio::test]
    async fn executor_failure_is_recorded() {
        let h = harness_with(4, Behaviour::Fail);
        let id = h.scheduler.submit("drain", json!({})).unwrap();
        let op = wait_for(&h.scheduler, &id, OperationState::Failed).await;
        let cause = op.failure_cause().unwrap();
        assert_eq!(cause.kind, FailureKind::ManagementRpc);
        assert_eq!(cause.message, "connection refused");
    }

    #[tokio::test]
    async fn executor_panic_fails_operation_and_frees_worker() {
        let h = harness_with(1, Behaviour::Panic);
        let id = h.scheduler.submit("drain", json!({})).unwrap();
        let op = wait_for(&h.scheduler, &id, OperationState::Failed).await;
        let cause = op.failure_cause().unwrap();
        assert_eq!(cause.kind, FailureKind::Panic);
        assert!(cause.message.contains("boom"));

        let next = h.scheduler.submit("flush", json!({})).unwrap();
        wait_for(&h.scheduler, &next, OperationState::Completed).await;
    }

    #[tokio::test]
    async fn unrequested_cancellation_is_a_failure() {
        let h = harness_with(4, Behaviour::SpuriousCancel);
        let id = h.scheduler.submit("drain", json!({})).unwrap();
        let op = wait_for(&h.scheduler, &id, OperationState::Failed).await;
        assert_eq!(op.failure_cause().unwrap().kind, FailureKind::Internal);
    }

    #[tokio::test]
    async fn retention_evicts_finished_operations() {
        let h = harness(4);
        let id = h.scheduler.submit("flush", json!({})).unwrap();
        wait_for(&h.scheduler, &id, OperationState::Completed).await;

        assert_eq!(h.scheduler.sweep_expired(), 0);
        h.clock.advance(10);
        assert_eq!(h.scheduler.sweep_expired(), 1);
        assert_eq!(h.scheduler.get(&id).unwrap_err().kind(), "not-found");
    }

    #[tokio::test]
    async fn running_operations_are_never_evicted() {
        let h = harness(4);
        let id = h.scheduler.submit("drain", json!({})).unwrap();
        wait_for(&h.scheduler, &id, OperationState::Running).await;
        h.clock.advance(1_000_000);
        assert_eq!(h.scheduler.sweep_expired(), 0);
        assert!(h.scheduler.get(&id).is_ok());
        h.tracker.release(1);
    }

    #[tokio::test]
    async fn idempotency_key_deduplicates_until_eviction() {
        let h = harness(4);
        let key = Some("nightly-flush".to_string());
        let first = h
            .scheduler
            .submit_with_key("flush", json!({}), key.clone())
            .unwrap();
        let again = h
            .scheduler
            .submit_with_key("flush", json!({}), key.clone())
            .unwrap();
        assert_eq!(first, again);
        assert_eq!(h.scheduler.list(&OperationFilter::default()).len(), 1);

        wait_for(&h.scheduler, &first, OperationState::Completed).await;
        h.clock.advance(10);
        h.scheduler.sweep_expired();

        let fresh = h.scheduler.submit_with_key("flush", json!({}), key).unwrap();
        assert_ne!(fresh, first);
    }

    #[tokio::test]
    async fn shutdown_cancels_everything_and_refuses_new_work() {
        let h = harness(1);
        let running = h.scheduler.submit("drain", json!({})).unwrap();
        let pending = h.scheduler.submit("drain", json!({})).unwrap();
        wait_for(&h.scheduler, &running, OperationState::Running).await;

        h.scheduler.shutdown();
        assert!(h.scheduler.is_shutting_down());
        assert_eq!(
            h.scheduler.submit("flush", json!({})).unwrap_err(),
            EngineError::ShuttingDown
        );
        assert!(h.scheduler.wait_idle(Duration::from_secs(5)).await);
        assert_eq!(
            h.scheduler.get(&running).unwrap().state(),
            OperationState::Cancelled
        );
        assert_eq!(
            h.scheduler.get(&pending).unwrap().state(),
            OperationState::Cancelled
        );
        assert_eq!(h.tracker.started(), vec![running]);
    }

    #[tokio::test]
    async fn wait_idle_times_out_while_busy() {
        let h = harness(4);
        let id = h.scheduler.submit("drain", json!({})).unwrap();
        wait_for(&h.scheduler, &id, OperationState::Running).await;
        assert!(!h.scheduler.wait_idle(Duration::from_millis(20)).await);
        h.tracker.release(1);
        assert!(h.scheduler.wait_idle(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn list_filters_by_type_and_state() {
        let h = harness(4);
        let flush = h.scheduler.submit("flush", json!({})).unwrap();
        let drain = h.scheduler.submit("drain", json!({})).unwrap();
        wait_for(&h.scheduler, &flush, OperationState::Completed).await;
        wait_for(&h.scheduler, &drain, OperationState::Running).await;

        let running = h.scheduler.list(&OperationFilter {
            type_name: None,
            state: Some(OperationState::Running),
        });
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id(), drain);

        let flushes = h.scheduler.list(&OperationFilter {
            type_name: Some("flush".into()),
            state: None,
        });
        assert_eq!(flushes.len(), 1);
        h.tracker.release(1);
    }
}
