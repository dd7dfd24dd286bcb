//! Errors returned synchronously by the engine's submit/query/cancel calls.

use nodekeeper_core::{FieldError, OperationState};

/// Errors surfaced to callers of the scheduler and registry.
///
/// Execution-time failures never appear here: they are recorded on the
/// operation as its `failureCause`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("unknown operation type: {name}")]
    UnknownType { name: String },
    #[error("operation type is disabled: {name}")]
    DisabledType { name: String },
    #[error("invalid {type_name} request: {}", summarize(.errors))]
    Validation {
        type_name: String,
        errors: Vec<FieldError>,
    },
    #[error("operation type registered twice: {name}")]
    DuplicateType { name: String },
    #[error("operation not found: {id}")]
    NotFound { id: String },
    #[error("operation {id} is already {state}")]
    AlreadyTerminal { id: String, state: OperationState },
    #[error("scheduler is shutting down")]
    ShuttingDown,
}

impl EngineError {
    /// Machine-readable error kind, stable across releases.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::UnknownType { .. } => "unknown-type",
            EngineError::DisabledType { .. } => "disabled-type",
            EngineError::Validation { .. } => "validation",
            EngineError::DuplicateType { .. } => "duplicate-type",
            EngineError::NotFound { .. } => "not-found",
            EngineError::AlreadyTerminal { .. } => "already-terminal",
            EngineError::ShuttingDown => "shutting-down",
        }
    }

    /// Field-level detail of a validation failure; empty otherwise.
    #[must_use]
    pub fn field_errors(&self) -> &[FieldError] {
        match self {
            EngineError::Validation { errors, .. } => errors,
            _ => &[],
        }
    }
}

fn summarize(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| {
            if e.field.is_empty() {
                e.message.clone()
            } else {
                format!("{}: {}", e.field, e.message)
            }
        })
        .collect::<Vec<_>>()
        .join("; ")
}
