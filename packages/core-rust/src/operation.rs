use std::sync::Arc;

use serde::Serialize;

use crate::requests::OperationRequest;
use crate::state::{InvalidTransition, OperationState};
use crate::types::{FailureCause, OperationId, Progress};

/// Mutable lifecycle record of one submitted operation.
///
/// Fields are private so the state machine can only be driven through
/// [`Operation::transition`], [`Operation::complete`] and [`Operation::fail`],
/// which keep the timestamp invariants:
/// - `started_at` is set exactly when the state first becomes `RUNNING`;
/// - `completed_at` is set exactly when the state first becomes terminal;
/// - `created_at <= started_at <= completed_at`.
///
/// Timestamps are milliseconds since the Unix epoch.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    id: OperationId,
    #[serde(rename = "type")]
    type_name: &'static str,
    state: OperationState,
    request: Arc<OperationRequest>,
    created_at: u64,
    started_at: Option<u64>,
    completed_at: Option<u64>,
    progress: Progress,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    failure_cause: Option<FailureCause>,
    #[serde(skip_serializing_if = "Option::is_none")]
    idempotency_key: Option<String>,
}

impl Operation {
    /// Creates a `PENDING` operation. The type name is taken from the request
    /// so the two can never disagree.
    #[must_use]
    pub fn new(
        id: OperationId,
        request: OperationRequest,
        created_at: u64,
        idempotency_key: Option<String>,
    ) -> Self {
        Self {
            id,
            type_name: request.type_name(),
            state: OperationState::Pending,
            request: Arc::new(request),
            created_at,
            started_at: None,
            completed_at: None,
            progress: Progress::default(),
            result: None,
            failure_cause: None,
            idempotency_key,
        }
    }

    #[must_use]
    pub fn id(&self) -> OperationId {
        self.id
    }

    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    #[must_use]
    pub fn state(&self) -> OperationState {
        self.state
    }

    #[must_use]
    pub fn request(&self) -> &Arc<OperationRequest> {
        &self.request
    }

    #[must_use]
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    #[must_use]
    pub fn started_at(&self) -> Option<u64> {
        self.started_at
    }

    #[must_use]
    pub fn completed_at(&self) -> Option<u64> {
        self.completed_at
    }

    #[must_use]
    pub fn progress(&self) -> &Progress {
        &self.progress
    }

    #[must_use]
    pub fn result(&self) -> Option<&serde_json::Value> {
        self.result.as_ref()
    }

    #[must_use]
    pub fn failure_cause(&self) -> Option<&FailureCause> {
        self.failure_cause.as_ref()
    }

    #[must_use]
    pub fn idempotency_key(&self) -> Option<&str> {
        self.idempotency_key.as_deref()
    }

    /// Moves to `next`, stamping `started_at`/`completed_at` as required.
    ///
    /// `now_ms` is clamped so timestamps never decrease even if the wall
    /// clock steps backwards.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTransition`] if `next` is not reachable from the
    /// current state; the record is left untouched.
    pub fn transition(&mut self, next: OperationState, now_ms: u64) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        if next == OperationState::Running {
            self.started_at = Some(now_ms.max(self.created_at));
        }
        if next.is_terminal() {
            let floor = self.started_at.unwrap_or(self.created_at);
            self.completed_at = Some(now_ms.max(floor));
        }
        self.state = next;
        Ok(())
    }

    /// Finishes a running operation successfully.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTransition`] unless the operation is `RUNNING`.
    pub fn complete(&mut self, result: serde_json::Value, now_ms: u64) -> Result<(), InvalidTransition> {
        self.transition(OperationState::Completed, now_ms)?;
        self.result = Some(result);
        Ok(())
    }

    /// Finishes a running operation with a failure.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTransition`] unless the operation is `RUNNING`.
    pub fn fail(&mut self, cause: FailureCause, now_ms: u64) -> Result<(), InvalidTransition> {
        self.transition(OperationState::Failed, now_ms)?;
        self.failure_cause = Some(cause);
        Ok(())
    }

    /// Replaces the advisory progress. Ignored once terminal; returns whether
    /// the update was applied.
    pub fn set_progress(&mut self, progress: Progress) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.progress = progress;
        true
    }

    /// Whether a terminal operation has outlived `retention_ms` at `now_ms`.
    /// Non-terminal operations never expire.
    #[must_use]
    pub fn is_expired(&self, now_ms: u64, retention_ms: u64) -> bool {
        match (self.state.is_terminal(), self.completed_at) {
            (true, Some(completed_at)) => now_ms.saturating_sub(completed_at) > retention_ms,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;
    use crate::requests::{CleanupRequest, FlushRequest};
    use crate::types::FailureKind;

    fn flush_op(created_at: u64) -> Operation {
        Operation::new(
            OperationId::generate(),
            FlushRequest {
                keyspace: None,
                tables: vec![],
            }
            .into(),
            created_at,
            None,
        )
    }

    #[test]
    fn new_operation_is_pending_and_typed_by_its_request() {
        let op = Operation::new(
            OperationId::generate(),
            CleanupRequest {
                keyspace: "ks1".into(),
                tables: vec![],
                jobs: 0,
            }
            .into(),
            100,
            Some("key-1".into()),
        );
        assert_eq!(op.state(), OperationState::Pending);
        assert_eq!(op.type_name(), "cleanup");
        assert_eq!(op.request().type_name(), op.type_name());
        assert_eq!(op.started_at(), None);
        assert_eq!(op.idempotency_key(), Some("key-1"));
    }

    #[test]
    fn timestamps_follow_the_lifecycle() {
        let mut op = flush_op(100);
        op.transition(OperationState::Running, 150).unwrap();
        assert_eq!(op.started_at(), Some(150));
        assert_eq!(op.completed_at(), None);

        op.complete(json!({ "filesProcessed": 12 }), 200).unwrap();
        assert_eq!(op.state(), OperationState::Completed);
        assert_eq!(op.completed_at(), Some(200));
        assert_eq!(op.result(), Some(&json!({ "filesProcessed": 12 })));
    }

    #[test]
    fn timestamps_never_decrease_when_clock_steps_back() {
        let mut op = flush_op(100);
        op.transition(OperationState::Running, 90).unwrap();
        assert_eq!(op.started_at(), Some(100));
        op.transition(OperationState::Cancelling, 95).unwrap();
        op.transition(OperationState::Cancelled, 80).unwrap();
        assert_eq!(op.completed_at(), Some(100));
    }

    #[test]
    fn pending_cancel_never_sets_started_at() {
        let mut op = flush_op(100);
        op.transition(OperationState::Cancelled, 120).unwrap();
        assert_eq!(op.started_at(), None);
        assert_eq!(op.completed_at(), Some(120));
    }

    #[test]
    fn invalid_transition_leaves_record_untouched() {
        let mut op = flush_op(100);
        let err = op
            .complete(json!({}), 110)
            .expect_err("pending cannot complete");
        assert_eq!(err.from, OperationState::Pending);
        assert_eq!(op.state(), OperationState::Pending);
        assert!(op.result().is_none());
        assert!(op.completed_at().is_none());
    }

    #[test]
    fn fail_records_cause() {
        let mut op = flush_op(0);
        op.transition(OperationState::Running, 1).unwrap();
        op.fail(FailureCause::new(FailureKind::ManagementRpc, "refused"), 2)
            .unwrap();
        assert_eq!(op.state(), OperationState::Failed);
        assert_eq!(op.failure_cause().unwrap().message, "refused");
        assert!(op.result().is_none());
    }

    #[test]
    fn progress_is_frozen_once_terminal() {
        let mut op = flush_op(0);
        op.transition(OperationState::Running, 1).unwrap();
        assert!(op.set_progress(Progress::new(1, 2)));
        op.complete(json!(null), 2).unwrap();
        assert!(!op.set_progress(Progress::new(2, 2)));
        assert_eq!(op.progress(), &Progress::new(1, 2));
    }

    #[test]
    fn expiry_only_applies_to_terminal_operations() {
        let mut op = flush_op(0);
        op.transition(OperationState::Running, 0).unwrap();
        assert!(!op.is_expired(1_000_000, 5));

        op.complete(json!({}), 10).unwrap();
        assert!(!op.is_expired(15, 5));
        assert!(op.is_expired(20, 5));
    }

    #[test]
    fn snapshot_serializes_wire_shape() {
        let mut op = flush_op(7);
        op.transition(OperationState::Running, 8).unwrap();
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["type"], "flush");
        assert_eq!(json["state"], "RUNNING");
        assert_eq!(json["createdAt"], 7);
        assert_eq!(json["startedAt"], 8);
        assert!(json["completedAt"].is_null());
        assert!(json.get("result").is_none());
        assert!(json.get("failureCause").is_none());
    }

    #[derive(Debug, Clone, Copy)]
    enum Event {
        Admit,
        Cancel,
        Complete,
        Fail,
        Finish,
    }

    fn event() -> impl Strategy<Value = Event> {
        prop_oneof![
            Just(Event::Admit),
            Just(Event::Cancel),
            Just(Event::Complete),
            Just(Event::Fail),
            Just(Event::Finish),
        ]
    }

    proptest! {
        /// Whatever events hit an operation, the observed states form a path
        /// through the state machine and never revisit PENDING or RUNNING.
        #[test]
        fn observed_states_form_a_valid_path(
            events in proptest::collection::vec((event(), 0u64..1_000), 0..24)
        ) {
            let mut op = flush_op(500);
            let mut observed = vec![op.state()];

            for (event, now) in events {
                let _ = match event {
                    Event::Admit => op.transition(OperationState::Running, now),
                    Event::Cancel => {
                        let next = if op.state() == OperationState::Pending {
                            OperationState::Cancelled
                        } else {
                            OperationState::Cancelling
                        };
                        op.transition(next, now)
                    }
                    Event::Complete => op.complete(json!({}), now),
                    Event::Fail => op.fail(FailureCause::new(FailureKind::Internal, "x"), now),
                    Event::Finish => op.transition(OperationState::Cancelled, now),
                };
                if observed.last() != Some(&op.state()) {
                    observed.push(op.state());
                }
            }

            for pair in observed.windows(2) {
                prop_assert!(pair[0].can_transition_to(pair[1]));
            }
            let running_visits = observed.iter().filter(|s| **s == OperationState::Running).count();
            prop_assert!(running_visits <= 1);
            prop_assert_eq!(observed.iter().filter(|s| **s == OperationState::Pending).count(), 1);

            if let Some(started) = op.started_at() {
                prop_assert!(started >= op.created_at());
            }
            if let Some(completed) = op.completed_at() {
                prop_assert!(op.state().is_terminal());
                prop_assert!(completed >= op.started_at().unwrap_or(op.created_at()));
            }
        }
    }
}
