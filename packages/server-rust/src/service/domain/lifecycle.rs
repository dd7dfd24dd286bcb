//! Node lifecycle executors: decommission, drain, restart.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nodekeeper_core::{FailureKind, OperationRequest, Progress};
use serde_json::{json, Value};
use tokio::time::Instant;

use super::ExecutorDeps;
use crate::service::executor::{typed_request, ExecutionContext, ExecutionError, Executor};
use crate::traits::NodeManagement;

/// Operation mode of a node that serves requests.
const MODE_NORMAL: &str = "NORMAL";

pub struct DecommissionExecutor {
    management: Arc<dyn NodeManagement>,
}

impl DecommissionExecutor {
    #[must_use]
    pub fn new(deps: &ExecutorDeps) -> Self {
        Self {
            management: Arc::clone(&deps.management),
        }
    }
}

#[async_trait]
impl Executor for DecommissionExecutor {
    async fn execute(&mut self, request: &OperationRequest, ctx: &ExecutionContext) -> Result<Value, ExecutionError> {
        let request = typed_request!(request, Decommission);
        ctx.report(Progress::new(0, 1).with_message("streaming data to remaining replicas"));
        ctx.call_node("decommission", self.management.decommission(request.force))
            .await?;
        Ok(json!({ "force": request.force }))
    }
}

pub struct DrainExecutor {
    management: Arc<dyn NodeManagement>,
}

impl DrainExecutor {
    #[must_use]
    pub fn new(deps: &ExecutorDeps) -> Self {
        Self {
            management: Arc::clone(&deps.management),
        }
    }
}

#[async_trait]
impl Executor for DrainExecutor {
    async fn execute(&mut self, request: &OperationRequest, ctx: &ExecutionContext) -> Result<Value, ExecutionError> {
        let _ = typed_request!(request, Drain);
        ctx.call_node("drain", self.management.drain()).await?;
        let mode = ctx
            .call_node("read operation mode", self.management.operation_mode())
            .await?;
        Ok(json!({ "mode": mode }))
    }
}

/// Drains the node, restarts it, then polls its mode until it serves again.
///
/// Mode polls that fail are expected while the process is down and are
/// retried until the deadline.
pub struct RestartExecutor {
    management: Arc<dyn NodeManagement>,
    poll_interval: Duration,
}

impl RestartExecutor {
    #[must_use]
    pub fn new(deps: &ExecutorDeps) -> Self {
        Self {
            management: Arc::clone(&deps.management),
            poll_interval: deps.restart_poll,
        }
    }
}

#[async_trait]
impl Executor for RestartExecutor {
    async fn execute(&mut self, request: &OperationRequest, ctx: &ExecutionContext) -> Result<Value, ExecutionError> {
        let request = typed_request!(request, Restart);
        let wait = Duration::from_secs(request.wait_timeout_seconds);

        ctx.report(Progress::new(0, 3).with_message("draining"));
        ctx.call_node("drain", self.management.drain()).await?;
        ctx.report(Progress::new(1, 3).with_message("restarting"));
        ctx.call_node("restart", self.management.restart()).await?;
        ctx.report(Progress::new(2, 3).with_message("waiting for node"));

        let started = Instant::now();
        // A wait too large to represent never expires.
        let deadline = started.checked_add(wait);
        let mut polls = 0u64;
        loop {
            ctx.check_cancelled()?;
            polls += 1;
            match self.management.operation_mode().await {
                Ok(mode) if mode == MODE_NORMAL => break,
                Ok(mode) => tracing::debug!(op_id = %ctx.id(), %mode, "node not ready yet"),
                Err(e) => tracing::debug!(op_id = %ctx.id(), error = %e, "node not reachable yet"),
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(ExecutionError::failed(
                    FailureKind::Timeout,
                    format!(
                        "restart-timeout: node did not return to {MODE_NORMAL} within {}s",
                        request.wait_timeout_seconds
                    ),
                ));
            }
            tokio::select! {
                () = ctx.cancelled() => return Err(ExecutionError::Cancelled),
                () = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        ctx.report(Progress::new(3, 3).with_message("node is serving"));
        #[allow(clippy::cast_possible_truncation)]
        let waited_ms = started.elapsed().as_millis() as u64;
        Ok(json!({ "mode": MODE_NORMAL, "polls": polls, "waitedMs": waited_ms }))
    }
}

#[cfg(test)]
mod tests {
    use nodekeeper_core::requests::{DecommissionRequest, DrainRequest, RestartRequest};

    use super::super::test_support::{context, deps};
    use super::*;
    use crate::management::fake::RecordingManagement;

    fn restart(wait_timeout_seconds: u64) -> OperationRequest {
        RestartRequest {
            wait_timeout_seconds,
        }
        .into()
    }

    #[tokio::test]
    async fn decommission_forwards_force() {
        let management = Arc::new(RecordingManagement::new());
        let (ctx, _token) = context();
        DecommissionExecutor::new(&deps(&management, vec![]))
            .execute(&DecommissionRequest { force: true }.into(), &ctx)
            .await
            .unwrap();
        assert_eq!(management.calls(), vec!["decommission force=true"]);
    }

    #[tokio::test]
    async fn drain_reports_resulting_mode() {
        let management = Arc::new(RecordingManagement::new().with_modes(&["DRAINED"]));
        let (ctx, _token) = context();
        let result = DrainExecutor::new(&deps(&management, vec![]))
            .execute(&DrainRequest {}.into(), &ctx)
            .await
            .unwrap();
        assert_eq!(result["mode"], "DRAINED");
    }

    #[tokio::test(start_paused = true)]
    async fn restart_waits_until_node_is_normal() {
        let management = Arc::new(
            RecordingManagement::new().with_modes(&["DRAINED", "STARTING", "STARTING", "NORMAL"]),
        );
        let (ctx, _token) = context();
        let result = RestartExecutor::new(&deps(&management, vec![]))
            .execute(&restart(60), &ctx)
            .await
            .unwrap();

        assert_eq!(result["polls"], 4);
        let calls = management.calls();
        assert_eq!(&calls[..2], &["drain", "restart"]);
        assert_eq!(calls.len(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_times_out() {
        let management = Arc::new(RecordingManagement::new().with_modes(&["STARTING"]));
        let (ctx, _token) = context();
        let err = RestartExecutor::new(&deps(&management, vec![]))
            .execute(&restart(1), &ctx)
            .await
            .unwrap_err();
        let ExecutionError::Failed(cause) = err else {
            panic!("expected failure");
        };
        assert_eq!(cause.kind, FailureKind::Timeout);
        assert!(cause.message.starts_with("restart-timeout"));
    }

    #[tokio::test(start_paused = true)]
    async fn restart_wait_observes_cancellation() {
        let (ctx, token) = context();
        let management = Arc::new(
            RecordingManagement::new()
                .with_modes(&["STARTING"])
                .cancel_on("operation_mode", token),
        );
        let err = RestartExecutor::new(&deps(&management, vec![]))
            .execute(&restart(600), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Cancelled));
        assert_eq!(
            management.calls().iter().filter(|c| *c == "operation_mode").count(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_wait_does_not_overflow_deadline() {
        let management = Arc::new(RecordingManagement::new().with_modes(&["STARTING", "NORMAL"]));
        let (ctx, _token) = context();
        let result = RestartExecutor::new(&deps(&management, vec![]))
            .execute(&restart(u64::MAX), &ctx)
            .await
            .unwrap();
        assert_eq!(result["mode"], MODE_NORMAL);
        assert_eq!(result["polls"], 2);
        assert_eq!(&management.calls()[..2], &["drain", "restart"]);
    }

    #[tokio::test]
    async fn failed_drain_stops_restart() {
        let management = Arc::new(RecordingManagement::new().failing("drain"));
        let (ctx, _token) = context();
        let err = RestartExecutor::new(&deps(&management, vec![]))
            .execute(&restart(60), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Failed(_)));
        assert_eq!(management.calls(), vec!["drain"]);
    }
}
