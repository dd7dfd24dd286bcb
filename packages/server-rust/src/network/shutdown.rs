//! Process-wide shutdown: health state, in-flight control calls, and the
//! scheduler's drain.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::watch;

use crate::service::Scheduler;

/// Server health state, transitioned by the shutdown controller.
///
/// State machine: Starting -> Ready -> Draining -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// Listener not bound yet.
    Starting,
    /// Accepting control calls and operations.
    Ready,
    /// Rejecting new operations while running ones stop.
    Draining,
    /// Every in-flight call and operation finished.
    Stopped,
}

impl HealthState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            HealthState::Starting => "starting",
            HealthState::Ready => "ready",
            HealthState::Draining => "draining",
            HealthState::Stopped => "stopped",
        }
    }
}

/// What [`ShutdownController::drain`] managed to finish within the grace period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainOutcome {
    /// No control call was still being handled.
    pub requests_drained: bool,
    /// No operation was still pending or running.
    pub operations_drained: bool,
}

impl DrainOutcome {
    #[must_use]
    pub fn is_complete(self) -> bool {
        self.requests_drained && self.operations_drained
    }
}

/// Coordinates shutdown of the control surface and the scheduler.
///
/// 1. Health probes read `health_state()`
/// 2. `trigger_shutdown()` moves to Draining, stops the scheduler admitting
///    work and signals listeners
/// 3. `drain()` waits for in-flight calls and running operations
#[derive(Debug)]
pub struct ShutdownController {
    shutdown_signal: watch::Sender<bool>,
    in_flight: Arc<AtomicU64>,
    health_state: ArcSwap<HealthState>,
    scheduler: Scheduler,
}

impl ShutdownController {
    /// Creates a controller in the `Starting` state.
    #[must_use]
    pub fn new(scheduler: Scheduler) -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            shutdown_signal: tx,
            in_flight: Arc::new(AtomicU64::new(0)),
            health_state: ArcSwap::from_pointee(HealthState::Starting),
            scheduler,
        }
    }

    pub fn set_ready(&self) {
        self.health_state.store(Arc::new(HealthState::Ready));
    }

    /// Receiver notified once shutdown is triggered.
    #[must_use]
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_signal.subscribe()
    }

    /// Moves to `Draining` and shuts the scheduler down: pending operations
    /// are cancelled and running ones signalled. Idempotent.
    pub fn trigger_shutdown(&self) {
        self.health_state.store(Arc::new(HealthState::Draining));
        self.scheduler.shutdown();
        // Ignore send errors -- receivers may have been dropped
        let _ = self.shutdown_signal.send(true);
    }

    #[must_use]
    pub fn health_state(&self) -> HealthState {
        **self.health_state.load()
    }

    /// Tracks one control call until the guard is dropped.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Waits up to `grace` for in-flight calls, then for the scheduler to go
    /// idle. Transitions to `Stopped` only if both drained.
    pub async fn drain(&self, grace: Duration) -> DrainOutcome {
        let deadline = tokio::time::Instant::now() + grace;

        let requests_drained = loop {
            if self.in_flight.load(Ordering::Relaxed) == 0 {
                break true;
            }
            if tokio::time::Instant::now() >= deadline {
                break false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };

        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let operations_drained = self.scheduler.wait_idle(remaining).await;

        let outcome = DrainOutcome {
            requests_drained,
            operations_drained,
        };
        if outcome.is_complete() {
            self.health_state.store(Arc::new(HealthState::Stopped));
        }
        outcome
    }
}

/// Decrements the in-flight counter when dropped, including on unwind.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}
