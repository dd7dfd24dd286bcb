//! Background workers: a generic periodic loop and the expiry sweeper
//! built on it.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::scheduler::Scheduler;

// ---------------------------------------------------------------------------
// BackgroundRunnable
// ---------------------------------------------------------------------------

/// Logic run by a [`BackgroundWorker`] on every tick.
#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    async fn on_tick(&mut self);

    /// Called once when the worker stops. Default is a no-op.
    async fn shutdown(&mut self) {}
}

// ---------------------------------------------------------------------------
// BackgroundWorker
// ---------------------------------------------------------------------------

/// Owns the tokio task driving a [`BackgroundRunnable`].
pub struct BackgroundWorker {
    name: &'static str,
    stop_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundWorker {
    /// Spawns the worker loop. The first tick fires one full interval after start.
    pub fn start<R: BackgroundRunnable>(name: &'static str, mut runnable: R, tick: Duration) -> Self {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + tick, tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tracing::debug!(worker = name, tick_ms = tick.as_millis(), "background worker started");

            loop {
                tokio::select! {
                    _ = interval.tick() => runnable.on_tick().await,
                    _ = &mut stop_rx => break,
                }
            }

            runnable.shutdown().await;
            tracing::debug!(worker = name, "background worker stopped");
        });

        Self {
            name,
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stops the loop and waits for [`BackgroundRunnable::shutdown`] to finish.
    pub async fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                tracing::warn!(worker = self.name, error = %e, "background worker ended abnormally");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ExpirySweeper
// ---------------------------------------------------------------------------

/// Evicts terminal operations past their retention period on every tick.
pub struct ExpirySweeper {
    scheduler: Scheduler,
}

impl ExpirySweeper {
    #[must_use]
    pub fn new(scheduler: Scheduler) -> Self {
        Self { scheduler }
    }

    /// Starts the sweeper at the scheduler's configured interval.
    #[must_use]
    pub fn spawn(scheduler: Scheduler) -> BackgroundWorker {
        let tick = Duration::from_millis(scheduler.config().sweep_interval_ms.max(1));
        BackgroundWorker::start("expiry-sweeper", Self::new(scheduler), tick)
    }
}

#[async_trait]
impl BackgroundRunnable for ExpirySweeper {
    async fn on_tick(&mut self) {
        let evicted = self.scheduler.sweep_expired();
        if evicted > 0 {
            tracing::debug!(evicted, "expired operations swept");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use nodekeeper_core::requests::FlushRequest;
    use nodekeeper_core::{OperationRequest, OperationState};
    use serde_json::json;

    use super::*;
    use crate::service::clock::ManualClock;
    use crate::service::config::EngineConfig;
    use crate::service::executor::{ExecutionContext, ExecutionError, Executor};
    use crate::service::registry::{OperationRegistry, OperationTypeDescriptor};

    #[derive(Default)]
    struct Counters {
        ticks: AtomicU32,
        shutdowns: AtomicU32,
    }

    struct CountingRunnable(Arc<Counters>);

    #[async_trait]
    impl BackgroundRunnable for CountingRunnable {
        async fn on_tick(&mut self) {
            self.0.ticks.fetch_add(1, Ordering::SeqCst);
        }

        async fn shutdown(&mut self) {
            self.0.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_fire_on_interval() {
        let counters = Arc::new(Counters::default());
        let mut worker = BackgroundWorker::start(
            "counting",
            CountingRunnable(counters.clone()),
            Duration::from_millis(100),
        );
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(counters.ticks.load(Ordering::SeqCst), 3);
        worker.stop().await;
    }

    #[tokio::test]
    async fn stop_runs_shutdown_once() {
        let counters = Arc::new(Counters::default());
        let mut worker = BackgroundWorker::start(
            "counting",
            CountingRunnable(counters.clone()),
            Duration::from_secs(60),
        );
        assert!(worker.is_running());

        worker.stop().await;
        worker.stop().await;
        assert!(!worker.is_running());
        assert_eq!(counters.shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(counters.ticks.load(Ordering::SeqCst), 0);
    }

    struct Done;

    #[async_trait]
    impl Executor for Done {
        async fn execute(
            &mut self,
            _request: &OperationRequest,
            _ctx: &ExecutionContext,
        ) -> Result<serde_json::Value, ExecutionError> {
            Ok(json!({}))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_evicts_on_tick() {
        let registry = OperationRegistry::builder()
            .register(OperationTypeDescriptor::of::<FlushRequest>(|| {
                Box::new(Done) as Box<dyn Executor>
            }))
            .unwrap()
            .build();
        let clock = Arc::new(ManualClock::new(0));
        let config = EngineConfig {
            retention_ms: 100,
            sweep_interval_ms: 50,
            ..EngineConfig::default()
        };
        let scheduler = Scheduler::new(Arc::new(registry), config, clock.clone());
        let id = scheduler.submit("flush", json!({})).unwrap();
        assert!(scheduler.wait_idle(Duration::from_secs(5)).await);
        assert_eq!(scheduler.get(&id).unwrap().state(), OperationState::Completed);

        let mut worker = ExpirySweeper::spawn(scheduler.clone());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(scheduler.get(&id).is_ok(), "still within retention");

        clock.advance(101);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(scheduler.get(&id).is_err());
        worker.stop().await;
    }
}
