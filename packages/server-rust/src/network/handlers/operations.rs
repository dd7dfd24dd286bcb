//! Operation endpoints: submit, status, list, cancel and the type catalogue.
//!
//! - `POST /operations` body `{ "type": ..., <payload fields> }`, optional
//!   `Idempotency-Key` header -> 201 snapshot
//! - `GET /operations?type=&state=` -> list of snapshots
//! - `GET /operations/{id}` -> snapshot
//! - `DELETE /operations/{id}` -> 202 snapshot
//! - `GET /operations/types` -> enabled types with their fields

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use nodekeeper_core::{Operation, OperationId, OperationState};
use serde::Deserialize;
use serde_json::Value;

use super::{ApiError, AppState};
use crate::service::{EngineError, OperationFilter, OperationTypeInfo};

pub const IDEMPOTENCY_KEY: &str = "idempotency-key";

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    #[serde(rename = "type")]
    pub type_name: Option<String>,
    pub state: Option<String>,
}

impl ListQuery {
    fn into_filter(self) -> Result<OperationFilter, ApiError> {
        let state = match self.state.as_deref() {
            None | Some("") => None,
            Some(raw) => Some(OperationState::parse(raw).ok_or_else(|| {
                ApiError::invalid_field("state", format!("unknown operation state '{raw}'"))
            })?),
        };
        Ok(OperationFilter {
            type_name: self.type_name.filter(|t| !t.is_empty()),
            state,
        })
    }
}

/// Unknown or malformed ids cannot name an operation, so both are 404.
fn parse_id(raw: &str) -> Result<OperationId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::from(EngineError::NotFound { id: raw.to_string() }))
}

/// Splits `{ "type": ..., rest }` into the type name and the payload.
fn split_type(body: Value) -> Result<(String, Value), ApiError> {
    let Value::Object(mut fields) = body else {
        return Err(ApiError::invalid_field("", "request body must be a JSON object"));
    };
    match fields.remove("type") {
        Some(Value::String(type_name)) => Ok((type_name, Value::Object(fields))),
        Some(_) => Err(ApiError::invalid_field("type", "must be a string")),
        None => Err(ApiError::invalid_field("type", "required field is missing")),
    }
}

pub async fn submit_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<(StatusCode, Json<Operation>), ApiError> {
    let _guard = state.shutdown.in_flight_guard();
    let Json(body) = body?;
    let (type_name, payload) = split_type(body)?;
    let idempotency_key = headers
        .get(IDEMPOTENCY_KEY)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string);

    let id = state
        .scheduler
        .submit_with_key(&type_name, payload, idempotency_key)?;
    let operation = state.scheduler.get(&id)?;
    Ok((StatusCode::CREATED, Json(operation)))
}

pub async fn get_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Operation>, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(state.scheduler.get(&id)?))
}

pub async fn list_handler(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Operation>>, ApiError> {
    let filter = query.into_filter()?;
    Ok(Json(state.scheduler.list(&filter)))
}

/// Acknowledges the cancellation request. The returned snapshot is either
/// `CANCELLED` (was pending) or `CANCELLING` (executor signalled).
pub async fn cancel_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<Operation>), ApiError> {
    let _guard = state.shutdown.in_flight_guard();
    let id = parse_id(&id)?;
    state.scheduler.cancel(&id)?;
    Ok((StatusCode::ACCEPTED, Json(state.scheduler.get(&id)?)))
}

pub async fn types_handler(State(state): State<AppState>) -> Json<Vec<OperationTypeInfo>> {
    Json(state.scheduler.types())
}
