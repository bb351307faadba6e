//! Bounded, detached execution of best-effort writes.
//!
//! Writes to the analytical store and the recent feed must never hold up
//! the acknowledgment of a batch. Each one runs in its own task; a semaphore
//! caps how many can be in flight, and work arriving while every permit is
//! taken is dropped and counted as a failure of its operation.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{debug, warn};

use tally_core::{MetricsSink, Result};

pub struct BestEffortDispatcher {
    permits: Arc<Semaphore>,
    max_in_flight: usize,
    metrics: Arc<dyn MetricsSink>,
}

impl BestEffortDispatcher {
    pub fn new(max_in_flight: usize, metrics: Arc<dyn MetricsSink>) -> Self {
        let max_in_flight = max_in_flight.max(1);
        Self {
            permits: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
            metrics,
        }
    }

    /// Spawn `task` if a slot is free. Returns whether it was spawned.
    ///
    /// A failed or dropped task is recorded as `event_failed(operation)`.
    pub fn dispatch<F>(&self, operation: &'static str, task: F) -> bool
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let permit = match self.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(
                    subsystem = "worker",
                    component = "fanout",
                    op = operation,
                    max_in_flight = self.max_in_flight,
                    "Best-effort slots exhausted, dropping write"
                );
                self.metrics.event_failed(operation);
                return false;
            }
        };

        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            let _permit = permit;
            match task.await {
                Ok(()) => debug!(op = operation, "Best-effort write done"),
                Err(e) => {
                    warn!(
                        subsystem = "worker",
                        component = "fanout",
                        op = operation,
                        error = %e,
                        "Best-effort write failed"
                    );
                    metrics.event_failed(operation);
                }
            }
        });
        true
    }

    pub fn in_flight(&self) -> usize {
        self.max_in_flight - self.permits.available_permits()
    }

    /// Wait up to `timeout` for every in-flight task. Returns `true` once
    /// all have finished.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let all = u32::try_from(self.max_in_flight).unwrap_or(u32::MAX);
        matches!(
            tokio::time::timeout(timeout, self.permits.acquire_many(all)).await,
            Ok(Ok(_))
        )
    }
}
