//! HTTP handlers of the control surface.
//!
//! This module defines `AppState` (the shared state carried through axum
//! extractors) and re-exports all handler functions for building the router.

pub mod error;
pub mod health;
pub mod operations;

pub use error::ApiError;
pub use health::{health_handler, liveness_handler, readiness_handler};
pub use operations::{
    cancel_handler, get_handler, list_handler, submit_handler, types_handler,
};

use std::sync::Arc;
use std::time::Instant;

use super::ShutdownController;
use crate::service::Scheduler;

/// Shared application state passed to all axum handlers via `State` extraction.
///
/// Holds `Arc` references and a cheaply cloneable scheduler handle.
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Scheduler,
    /// Graceful shutdown controller with health state and in-flight tracking.
    pub shutdown: Arc<ShutdownController>,
    /// Server process start time, used for uptime calculation.
    pub start_time: Instant,
}
