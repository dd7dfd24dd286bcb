use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Engine-generated operation identifier. Never supplied by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(Uuid);

impl OperationId {
    /// Generates a fresh random (v4) identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

impl FromStr for OperationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Advisory progress reported by a running executor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    /// Units of work finished so far.
    pub completed: u64,
    /// Total units of work, 0 when unknown.
    pub total: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Progress {
    #[must_use]
    pub fn new(completed: u64, total: u64) -> Self {
        Self {
            completed,
            total,
            message: None,
        }
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Completed share in `0.0..=1.0`, or `None` when the total is unknown.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn fraction(&self) -> Option<f64> {
        if self.total == 0 {
            return None;
        }
        Some((self.completed as f64 / self.total as f64).min(1.0))
    }
}

/// Machine-readable category of an execution failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    /// The node's management interface rejected or failed a call.
    ManagementRpc,
    /// Moving data to or from remote storage failed.
    StorageTransfer,
    /// Local filesystem error.
    Io,
    /// Downloaded data did not match its recorded digest.
    Integrity,
    /// The request could not be carried out as specified.
    InvalidRequest,
    /// A wait for the node exceeded its deadline.
    Timeout,
    /// The executor panicked.
    Panic,
    /// Anything else.
    Internal,
}

impl FailureKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::ManagementRpc => "management-rpc",
            FailureKind::StorageTransfer => "storage-transfer",
            FailureKind::Io => "io",
            FailureKind::Integrity => "integrity",
            FailureKind::InvalidRequest => "invalid-request",
            FailureKind::Timeout => "timeout",
            FailureKind::Panic => "panic",
            FailureKind::Internal => "internal",
        }
    }
}

/// Structured failure recorded on a `FAILED` operation.
///
/// Causes nest: `cause` holds the error that led to this one, so an
/// `anyhow` chain converted with [`FailureCause::from_error`] keeps every
/// link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureCause {
    pub kind: FailureKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<FailureCause>>,
}

impl FailureCause {
    #[must_use]
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
        }
    }

    #[must_use]
    pub fn with_cause(mut self, cause: FailureCause) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Converts an error chain, outermost context first.
    #[must_use]
    pub fn from_error(kind: FailureKind, error: &anyhow::Error) -> Self {
        let mut messages = error.chain().map(ToString::to_string).rev();
        let innermost = messages.next().unwrap_or_default();
        messages.fold(Self::new(kind, innermost), |cause, message| {
            Self::new(kind, message).with_cause(cause)
        })
    }

    /// Iterates this cause and every nested one.
    pub fn chain(&self) -> impl Iterator<Item = &FailureCause> {
        std::iter::successors(Some(self), |c| c.cause.as_deref())
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for FailureCause {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|c| c as &(dyn std::error::Error + 'static))
    }
}
