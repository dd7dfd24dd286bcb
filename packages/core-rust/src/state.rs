//! Operation lifecycle state machine.
//!
//! ```text
//! Pending ──► Running ──► Completed
//!    │           │   └──► Failed
//!    │           └──► Cancelling ──► Cancelled
//!    └──────────────────────────────► Cancelled
//! ```
//!
//! `Completed`, `Failed` and `Cancelled` are absorbing. Nothing leads back to
//! `Pending` or `Running`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a single operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationState {
    /// Recorded, waiting for a worker slot and its exclusion group.
    Pending,
    /// Admitted; its executor is running.
    Running,
    /// Executor finished successfully.
    Completed,
    /// Executor reported a failure.
    Failed,
    /// Cancellation was signalled to a running executor.
    Cancelling,
    /// Cancelled, either before admission or after the executor stopped.
    Cancelled,
}

impl OperationState {
    /// All states, in lifecycle order.
    pub const ALL: [OperationState; 6] = [
        OperationState::Pending,
        OperationState::Running,
        OperationState::Completed,
        OperationState::Failed,
        OperationState::Cancelling,
        OperationState::Cancelled,
    ];

    /// Whether the state is absorbing.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OperationState::Completed | OperationState::Failed | OperationState::Cancelled
        )
    }

    /// Whether `self -> next` is an edge of the state machine.
    #[must_use]
    pub fn can_transition_to(self, next: OperationState) -> bool {
        use OperationState::{Cancelled, Cancelling, Completed, Failed, Pending, Running};
        matches!(
            (self, next),
            (Pending, Running | Cancelled)
                | (Running, Completed | Failed | Cancelling)
                | (Cancelling, Cancelled)
        )
    }

    /// Wire name of the state, e.g. `"RUNNING"`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            OperationState::Pending => "PENDING",
            OperationState::Running => "RUNNING",
            OperationState::Completed => "COMPLETED",
            OperationState::Failed => "FAILED",
            OperationState::Cancelling => "CANCELLING",
            OperationState::Cancelled => "CANCELLED",
        }
    }

    /// Parses a wire name case-insensitively.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid operation state transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: OperationState,
    pub to: OperationState,
}
