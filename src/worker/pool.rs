//! Bounded pool of blocking workers.
//!
//! Jobs run on tokio's blocking threads; a semaphore caps how many run at
//! once so a burst of fit requests queues instead of oversubscribing the
//! machine. Jobs that spawn a child process hold their permit for the
//! lifetime of the child.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::debug;

use super::WorkerError;

#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(capacity.max(1))),
        }
    }

    /// Queue `job`; it starts once a worker is free.
    pub fn spawn<T, F>(&self, job: F) -> WorkerHandle<T>
    where
        F: FnOnce() -> Result<T, WorkerError> + Send + 'static,
        T: Send + 'static,
    {
        let permits = self.permits.clone();
        let inner = tokio::spawn(async move {
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|_| WorkerError::Cancelled)?;
            debug!("Worker job started");
            match tokio::task::spawn_blocking(job).await {
                Ok(result) => result,
                Err(e) if e.is_panic() => Err(WorkerError::Panicked(panic_message(e.into_panic()))),
                Err(_) => Err(WorkerError::Cancelled),
            }
        });
        WorkerHandle { inner }
    }
}

/// Future of a queued job.
pub struct WorkerHandle<T> {
    inner: JoinHandle<Result<T, WorkerError>>,
}

impl<T> WorkerHandle<T> {
    pub fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }

    pub async fn join(self) -> Result<T, WorkerError> {
        match self.inner.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(WorkerError::Panicked(panic_message(e.into_panic()))),
            Err(_) => Err(WorkerError::Cancelled),
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
