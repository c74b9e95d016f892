//! Chunked, concurrency-limited task runner with per-item retry.
//!
//! [`BoundedExecutor`] runs a caller-supplied async operation over a list of
//! items. Items are dispatched chunk by chunk; inside a chunk at most
//! `concurrency` operations are in flight. Each item is wrapped in a
//! [`WorkItem`] and retried with exponential backoff. An item that exhausts
//! its attempts contributes `None` and is counted as an error; it never
//! aborts the batch.
//!
//! Results are always returned in input order, whatever order the items
//! completed in.

use crate::config::ExecutorConfig;
use crate::errors::{PipelineError, Result};
use crate::models::WorkItem;
use crate::retry::{sleep_or_cancel, RetryPolicy};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::fmt::Debug;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Aggregate counters for a batch run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct BatchStats {
    pub total: usize,
    pub success: usize,
    pub error: usize,
    pub duration: Duration,
}

/// Per-item results plus counters, returned by [`BoundedExecutor::execute_batch`].
#[derive(Debug)]
pub struct BatchOutcome<R> {
    pub results: Vec<Option<R>>,
    pub stats: BatchStats,
}

#[derive(Debug, Clone)]
pub struct BoundedExecutor {
    concurrency: usize,
    chunk_size: usize,
    retry: RetryPolicy,
}

impl BoundedExecutor {
    pub fn new(concurrency: usize, chunk_size: usize, retry: RetryPolicy) -> Self {
        Self {
            concurrency,
            chunk_size: chunk_size.max(1),
            retry,
        }
    }

    pub fn from_config(config: &ExecutorConfig) -> Self {
        Self::new(config.concurrency, config.chunk_size, config.retry)
    }

    /// Same limits, different retry policy.
    pub fn with_retry(&self, retry: RetryPolicy) -> Self {
        Self {
            retry,
            ..self.clone()
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Run `op` over every item with bounded concurrency.
    ///
    /// Returns one slot per input item, in input order; `None` marks an item
    /// that exhausted its attempts. The call itself only fails when it cannot
    /// be dispatched (zero concurrency) or when `cancel` fires.
    #[instrument(level = "info", skip_all, fields(items = items.len(), concurrency = self.concurrency))]
    pub async fn execute_parallel<T, R, F, Fut>(
        &self,
        items: Vec<T>,
        cancel: &CancellationToken,
        op: F,
    ) -> Result<Vec<Option<R>>>
    where
        T: Clone + Debug,
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        if self.concurrency == 0 {
            return Err(PipelineError::InvalidRequest(
                "executor concurrency must be at least 1".into(),
            ));
        }

        let t0 = Instant::now();
        let total = items.len();
        let mut results = Vec::with_capacity(total);
        let mut processed = 0usize;
        let mut errors = 0usize;

        let mut items = items.into_iter();
        loop {
            let chunk: Vec<T> = items.by_ref().take(self.chunk_size).collect();
            if chunk.is_empty() {
                break;
            }
            let chunk_len = chunk.len();

            let chunk_results: Vec<Option<R>> = stream::iter(chunk)
                .map(|item| self.run_item(item, cancel, &op))
                .buffered(self.concurrency)
                .collect()
                .await;

            if cancel.is_cancelled() {
                warn!(processed, total, "Parallel execution cancelled");
                return Err(PipelineError::Cancelled);
            }

            processed += chunk_len;
            errors += chunk_results.iter().filter(|r| r.is_none()).count();
            results.extend(chunk_results);

            info!(
                progress = %format!("{:.1}%", processed as f64 / total as f64 * 100.0),
                processed,
                total,
                errors,
                "Chunk complete"
            );
        }

        info!(
            elapsed_ms = t0.elapsed().as_millis() as u64,
            total,
            errors,
            "Parallel execution completed"
        );
        Ok(results)
    }

    /// Split `items` into batches of `batch_size` and run each through
    /// [`execute_parallel`](Self::execute_parallel), aggregating counters.
    #[instrument(level = "info", skip_all, fields(items = items.len(), batch_size = batch_size))]
    pub async fn execute_batch<T, R, F, Fut>(
        &self,
        items: Vec<T>,
        batch_size: usize,
        cancel: &CancellationToken,
        op: F,
    ) -> Result<BatchOutcome<R>>
    where
        T: Clone + Debug,
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let t0 = Instant::now();
        let total = items.len();
        let batch_size = batch_size.max(1);
        let batch_count = total.div_ceil(batch_size);
        let mut all_results = Vec::with_capacity(total);
        let mut stats = BatchStats {
            total,
            ..Default::default()
        };

        let mut items = items.into_iter();
        for i in 1..=batch_count {
            let batch: Vec<T> = items.by_ref().take(batch_size).collect();
            info!(batch = i, of = batch_count, size = batch.len(), "Processing batch");

            let results = self.execute_parallel(batch, cancel, &op).await?;
            let success = results.iter().filter(|r| r.is_some()).count();
            let failed = results.len() - success;
            stats.success += success;
            stats.error += failed;
            all_results.extend(results);

            info!(batch = i, success, errors = failed, "Batch completed");
        }

        stats.duration = t0.elapsed();
        info!(
            total = stats.total,
            success = stats.success,
            errors = stats.error,
            duration_ms = stats.duration.as_millis() as u64,
            "Batch execution completed"
        );
        Ok(BatchOutcome {
            results: all_results,
            stats,
        })
    }

    async fn run_item<T, R, F, Fut>(&self, key: T, cancel: &CancellationToken, op: &F) -> Option<R>
    where
        T: Clone + Debug,
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let mut item = WorkItem::new(key, self.retry.max_attempts);

        while !item.exhausted() {
            if cancel.is_cancelled() {
                return None;
            }
            item.attempts += 1;

            match op(item.key.clone()).await {
                Ok(value) => {
                    debug!(key = ?item.key, attempt = item.attempts, "Item succeeded");
                    return Some(value);
                }
                Err(e) => {
                    let retryable = e.is_retryable();
                    item.last_error = Some(e.to_string());

                    if !retryable || item.exhausted() {
                        error!(
                            key = ?item.key,
                            attempts = item.attempts,
                            error = %e,
                            "Item failed permanently"
                        );
                        return None;
                    }

                    let delay = self.retry.delay_for(item.attempts);
                    warn!(
                        key = ?item.key,
                        attempt = item.attempts,
                        max = item.max_attempts,
                        ?delay,
                        error = %e,
                        "Item failed; retrying"
                    );
                    if sleep_or_cancel(delay, cancel).await.is_err() {
                        return None;
                    }
                }
            }
        }
        None
    }
}
