//! Bounded worker pool
//!
//! Limits how many units of work run at once. `run` gates work that is awaited
//! in place, `schedule` spawns detached `'static` work on the tokio runtime.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    max_workers: usize,
}

impl WorkerPool {
    /// Create a pool allowing `max_workers` concurrent units (at least one)
    pub fn new(max_workers: usize) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_workers)),
            max_workers,
        }
    }

    /// Run a future once a worker slot is free
    pub async fn run<F>(&self, fut: F) -> F::Output
    where
        F: Future,
    {
        // The semaphore is never closed, so acquisition only waits.
        let _permit = self.semaphore.acquire().await.ok();
        fut.await
    }

    /// Spawn a future that starts once a worker slot is free
    pub fn schedule<F>(&self, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let semaphore = Arc::clone(&self.semaphore);
        tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok();
            fut.await
        })
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Number of currently free worker slots
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(1024)
    }
}
