//! Bounded offload of blocking fetch calls.
//!
//! Fetchers may block (HTTP clients in blocking mode, browser drivers), so
//! they run on tokio's blocking thread pool. A semaphore caps how many run at
//! once; the cap is a tunable of its own, separate from the scheduler's
//! per-day semaphore and the executor's concurrency limit.

use crate::errors::{PipelineError, Result};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{error, info};

#[derive(Debug)]
pub struct BlockingPool {
    size: usize,
    permits: Arc<Semaphore>,
}

impl BlockingPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        info!(threads = size, "Created blocking offload pool");
        Self {
            size,
            permits: Arc::new(Semaphore::new(size)),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Run `f` on the blocking thread pool once a slot is free and await its
    /// result. A panic in `f` is reported as a fetch error.
    pub async fn run<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| PipelineError::Cancelled)?;

        tokio::task::spawn_blocking(move || {
            let out = f();
            drop(permit);
            out
        })
        .await
        .map_err(|e| {
            if e.is_panic() {
                error!("Offloaded job panicked");
                PipelineError::Fetch("offload job panicked".into())
            } else {
                PipelineError::Fetch(format!("offload job aborted: {e}"))
            }
        })
    }

    /// Stop accepting work. Jobs already running finish on their own.
    pub fn close(&self) {
        self.permits.close();
        info!("Blocking offload pool closed");
    }
}
