//! Executor contract: the unit of work behind every operation type.
//!
//! An executor receives its typed request and an [`ExecutionContext`] and
//! reports exactly one outcome: a JSON result, a structured failure, or an
//! acknowledgement that it stopped because cancellation was signalled.
//! Cancellation is cooperative: executors poll [`ExecutionContext::check_cancelled`]
//! or await [`ExecutionContext::cancelled`] at their own safe points.

use std::future::Future;
use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use nodekeeper_core::{FailureCause, FailureKind, OperationId, OperationRequest, Progress};
use tokio_util::sync::CancellationToken;

use super::ledger::OperationLedger;

// ---------------------------------------------------------------------------
// Executor trait
// ---------------------------------------------------------------------------

/// Performs the work of one operation type.
///
/// A fresh executor is created per operation by the type's factory, so
/// implementations may keep per-run state in `&mut self`.
#[async_trait]
pub trait Executor: Send + 'static {
    async fn execute(
        &mut self,
        request: &OperationRequest,
        ctx: &ExecutionContext,
    ) -> Result<serde_json::Value, ExecutionError>;
}

/// Creates one executor per admitted operation.
pub type ExecutorFactory = Arc<dyn Fn() -> Box<dyn Executor> + Send + Sync>;

// ---------------------------------------------------------------------------
// ExecutionError
// ---------------------------------------------------------------------------

/// Non-success outcome of an executor run.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    /// The executor observed the cancellation signal and stopped.
    #[error("cancellation acknowledged")]
    Cancelled,
    #[error(transparent)]
    Failed(#[from] FailureCause),
}

impl ExecutionError {
    #[must_use]
    pub fn failed(kind: FailureKind, message: impl Into<String>) -> Self {
        ExecutionError::Failed(FailureCause::new(kind, message))
    }

    /// Request variant did not match the executor's type. The registry makes
    /// this unreachable; it is still reported rather than panicking.
    #[must_use]
    pub fn mismatch(expected: &str, request: &OperationRequest) -> Self {
        Self::failed(
            FailureKind::Internal,
            format!(
                "executor for {expected} received a {} request",
                request.type_name()
            ),
        )
    }
}

/// Converts collaborator errors into structured failures.
pub trait FailureExt<T> {
    /// Maps the error chain into a [`FailureCause`] of the given kind.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutionError::Failed`] if `self` is an error.
    fn or_fail(self, kind: FailureKind) -> Result<T, ExecutionError>;
}

impl<T> FailureExt<T> for anyhow::Result<T> {
    fn or_fail(self, kind: FailureKind) -> Result<T, ExecutionError> {
        self.map_err(|e| ExecutionError::Failed(FailureCause::from_error(kind, &e)))
    }
}

/// Extracts the expected variant from an `OperationRequest`, returning a
/// mismatch failure from the enclosing executor otherwise.
macro_rules! typed_request {
    ($request:expr, $variant:ident) => {
        match $request {
            nodekeeper_core::OperationRequest::$variant(inner) => inner,
            other => {
                return Err($crate::service::executor::ExecutionError::mismatch(
                    stringify!($variant),
                    other,
                ))
            }
        }
    };
}
pub(crate) use typed_request;

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

/// Handle given to a running executor: its id, cancellation signal and
/// progress channel.
#[derive(Clone)]
pub struct ExecutionContext {
    id: OperationId,
    cancel: CancellationToken,
    progress: ProgressReporter,
}

impl ExecutionContext {
    #[must_use]
    pub fn new(id: OperationId, cancel: CancellationToken, progress: ProgressReporter) -> Self {
        Self {
            id,
            cancel,
            progress,
        }
    }

    #[must_use]
    pub fn id(&self) -> OperationId {
        self.id
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once cancellation has been signalled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// Safe-point check.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutionError::Cancelled`] once cancellation was signalled.
    pub fn check_cancelled(&self) -> Result<(), ExecutionError> {
        if self.cancel.is_cancelled() {
            Err(ExecutionError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Publishes advisory progress.
    pub fn report(&self, progress: Progress) {
        self.progress.report(progress);
    }

    /// Awaits a management call at a safe point: checks cancellation first,
    /// then lets the call run to completion.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutionError::Cancelled`] if cancellation was already
    /// signalled, or a `management-rpc` failure if the call fails.
    pub async fn call_node<T>(
        &self,
        action: &str,
        call: impl Future<Output = anyhow::Result<T>>,
    ) -> Result<T, ExecutionError> {
        self.check_cancelled()?;
        tracing::debug!(op_id = %self.id, action, "calling node management");
        call.await
            .with_context(|| format!("{action} failed"))
            .or_fail(FailureKind::ManagementRpc)
    }
}

/// Writes executor progress into the ledger. Progress is the only field an
/// executor writes directly; lifecycle fields belong to the scheduler.
#[derive(Clone)]
pub struct ProgressReporter {
    id: OperationId,
    ledger: Arc<OperationLedger>,
}

impl ProgressReporter {
    #[must_use]
    pub fn new(id: OperationId, ledger: Arc<OperationLedger>) -> Self {
        Self { id, ledger }
    }

    pub fn report(&self, progress: Progress) {
        self.ledger.set_progress(&self.id, progress);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
