//! Capped task pool.
//!
//! The gateway fans every accepted request and every upstream call out to
//! its own task. Unbounded spawning would let a slow upstream pile up work
//! without limit, so all dispatch goes through [`TaskPool`]: a semaphore
//! caps the number of live tasks, and submission waits when the cap is hit.
//! A shared cancellation token stops the pool; tasks observe it at their own
//! await points.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Hard ceiling on concurrently live tasks.
pub const MAX_LIVE_TASKS: usize = 15_000;

/// Error returned when a task is submitted after [`TaskPool::stop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStopped;

impl std::fmt::Display for PoolStopped {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("task pool is stopped")
    }
}

impl std::error::Error for PoolStopped {}

/// Semaphore-capped task spawner shared by the whole gateway.
#[derive(Clone)]
pub struct TaskPool {
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
    running: Arc<AtomicUsize>,
}

impl TaskPool {
    pub fn new(capacity: usize) -> Self {
        TaskPool {
            permits: Arc::new(Semaphore::new(capacity)),
            cancel: CancellationToken::new(),
            running: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Submits a task. Waits for a free slot when the pool is at capacity;
    /// fails only after [`stop`](Self::stop).
    pub async fn spawn<F, T>(&self, fut: F) -> Result<JoinHandle<T>, PoolStopped>
    where
        F: std::future::Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PoolStopped)?;
        let running = Arc::clone(&self.running);
        running.fetch_add(1, Ordering::Relaxed);
        Ok(tokio::spawn(async move {
            let _permit = permit;
            let out = fut.await;
            running.fetch_sub(1, Ordering::Relaxed);
            out
        }))
    }

    /// Number of tasks currently live.
    pub fn running(&self) -> usize {
        self.running.load(Ordering::Relaxed)
    }

    /// Token observed by long-running tasks spawned through this pool.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Rejects further submissions and cancels the shared token.
    pub fn stop(&self) {
        debug!(running = self.running(), "stopping task pool");
        self.permits.close();
        self.cancel.cancel();
    }
}

impl Default for TaskPool {
    fn default() -> Self {
        Self::new(MAX_LIVE_TASKS)
    }
}
