//! `nodekeeper` core: operation state machine, lifecycle records, request schemas.

pub mod location;
pub mod operation;
pub mod requests;
pub mod schema;
pub mod state;
pub mod types;

pub use location::{LocationError, RemoteLocation};
pub use operation::Operation;
pub use requests::{decode_payload, OperationPayload, OperationRequest};
pub use schema::{FieldDef, FieldError, FieldKind, RequestSchema, ValidationResult};
pub use state::{InvalidTransition, OperationState};
pub use types::{FailureCause, FailureKind, OperationId, Progress};
