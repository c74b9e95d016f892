//! Durable consumption with bounded retry and poison-message isolation.
//!
//! For each delivery:
//!
//! 1. Undecodable body: rejected without requeue (dead-lettered), never
//!    retried.
//! 2. Body fails the queue schema: acknowledged and dropped with a warning.
//! 3. Otherwise the queue's handler runs, retried with backoff up to
//!    `handler_attempts`. Success is acknowledged.
//! 4. A handler that still fails is requeued. Failures are counted per
//!    message body; after `max_redeliveries` requeues the message is
//!    rejected without requeue instead. Permanent handler errors skip
//!    straight to that step; cancellation always requeues.
//!
//! A first delivery (not flagged redelivered) starts a fresh count, and
//! counts untouched for [`FAILURE_TTL`] are pruned, so bodies settled by
//! another consumer do not linger.
//!
//! The channel prefetch bounds unsettled deliveries, and each queue
//! processes at most that many messages at once.

use super::broker::{Broker, Delivery};
use super::publisher::connect_with_retry;
use super::schema;
use crate::config::{BrokerConfig, SubscriberConfig};
use crate::errors::{PipelineError, Result};
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::utils::truncate_for_log;
use async_trait::async_trait;
use futures::future::join_all;
use futures::StreamExt;
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Processes messages from one queue.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    fn queue(&self) -> &str;

    async fn handle(&self, message: &Value, cancel: &CancellationToken) -> Result<()>;
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Acked,
    Dropped,
    Poisoned,
    Requeued,
    DeadLettered,
}

/// How long a failure count survives without a new failure.
pub const FAILURE_TTL: Duration = Duration::from_secs(60 * 60);

type BodyKey = (String, u64);

#[derive(Debug, Clone, Copy)]
struct FailureCount {
    count: u32,
    last: Instant,
}

pub struct Subscriber {
    broker: Arc<dyn Broker>,
    broker_config: BrokerConfig,
    config: SubscriberConfig,
    handlers: Vec<Arc<dyn MessageHandler>>,
    failures: Mutex<HashMap<BodyKey, FailureCount>>,
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let queues: Vec<&str> = self.handlers.iter().map(|h| h.queue()).collect();
        f.debug_struct("Subscriber")
            .field("queues", &queues)
            .field("config", &self.config)
            .finish()
    }
}

fn body_key(queue: &str, body: &[u8]) -> BodyKey {
    let mut hasher = DefaultHasher::new();
    body.hash(&mut hasher);
    (queue.to_string(), hasher.finish())
}

fn settle(result: Result<()>, queue: &str) {
    if let Err(e) = result {
        error!(%queue, error = %e, "Failed to settle delivery");
    }
}

impl Subscriber {
    pub fn new(broker: Arc<dyn Broker>, broker_config: BrokerConfig, config: SubscriberConfig) -> Self {
        Self {
            broker,
            broker_config,
            config,
            handlers: Vec::new(),
            failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Consume every handler's queue until `cancel` fires.
    ///
    /// Returns an error if the connection cannot be established or a
    /// consumer stream ends while not cancelled.
    #[instrument(level = "info", skip_all, fields(queues = self.handlers.len()))]
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let channel = connect_with_retry(self.broker.as_ref(), &self.broker_config).await?;
        channel.set_prefetch(self.broker_config.prefetch).await?;

        let mut consumers = Vec::with_capacity(self.handlers.len());
        for (i, handler) in self.handlers.iter().enumerate() {
            let queue = handler.queue().to_string();
            channel.declare_queue(&queue).await?;
            let tag = format!("news_pipeline-{queue}-{i}");
            let stream = channel.consume(&queue, &tag).await?;
            info!(%queue, prefetch = self.broker_config.prefetch, "Consuming");
            consumers.push(self.consume(Arc::clone(handler), stream, cancel.clone()));
        }

        let results = join_all(consumers).await;
        let _ = channel.close().await;
        results.into_iter().collect::<Result<Vec<()>>>()?;
        Ok(())
    }

    async fn consume(
        &self,
        handler: Arc<dyn MessageHandler>,
        stream: super::broker::DeliveryStream,
        cancel: CancellationToken,
    ) -> Result<()> {
        let limit = usize::from(self.broker_config.prefetch.max(1));
        let handler = handler.as_ref();
        let cancel_ref = &cancel;

        stream
            .take_until(cancel.cancelled())
            .for_each_concurrent(limit, |item| async move {
                match item {
                    Ok(delivery) => {
                        self.process(handler, delivery, cancel_ref).await;
                    }
                    Err(e) => error!(queue = handler.queue(), error = %e, "Delivery error"),
                }
            })
            .await;

        if cancel.is_cancelled() {
            info!(queue = handler.queue(), "Consumer stopped");
            Ok(())
        } else {
            Err(PipelineError::Connection(format!(
                "consumer for {} ended unexpectedly",
                handler.queue()
            )))
        }
    }

    /// Decode, validate, dispatch and settle one delivery.
    pub async fn process(
        &self,
        handler: &dyn MessageHandler,
        delivery: Delivery,
        cancel: &CancellationToken,
    ) -> Outcome {
        let queue = handler.queue();

        let message: Value = match serde_json::from_slice(&delivery.body) {
            Ok(v) => v,
            Err(e) => {
                error!(
                    %queue,
                    error = %e,
                    body = %truncate_for_log(&String::from_utf8_lossy(&delivery.body), 200),
                    "Undecodable message; rejecting without requeue"
                );
                settle(delivery.reject(false).await, queue);
                return Outcome::Poisoned;
            }
        };

        if let Err(e) = schema::validate(queue, &message) {
            warn!(%queue, error = %e, "Dropping invalid message");
            settle(delivery.ack().await, queue);
            return Outcome::Dropped;
        }

        let key = body_key(queue, &delivery.body);
        if !delivery.redelivered {
            self.forget(&key);
        }
        let policy = RetryPolicy::new(
            self.config.handler_attempts,
            Duration::from_millis(self.config.handler_retry_delay_ms),
        );
        let result = retry_with_backoff(&policy, cancel, queue, |_| handler.handle(&message, cancel)).await;

        match result {
            Ok(()) => {
                self.forget(&key);
                debug!(%queue, redelivered = delivery.redelivered, "Message handled");
                settle(delivery.ack().await, queue);
                Outcome::Acked
            }
            Err(PipelineError::Cancelled) => {
                info!(%queue, "Handling cancelled; requeueing");
                settle(delivery.reject(true).await, queue);
                Outcome::Requeued
            }
            Err(e) if !e.is_retryable() => {
                self.forget(&key);
                error!(%queue, error = %e, "Permanent handler failure; dead-lettering");
                settle(delivery.reject(false).await, queue);
                Outcome::DeadLettered
            }
            Err(e) => {
                let failures = self.record_failure(&key, Instant::now());
                if failures > self.config.max_redeliveries {
                    self.forget(&key);
                    error!(
                        %queue,
                        failures,
                        error = %e,
                        "Redelivery limit reached; dead-lettering"
                    );
                    settle(delivery.reject(false).await, queue);
                    Outcome::DeadLettered
                } else {
                    warn!(
                        %queue,
                        failures,
                        max = self.config.max_redeliveries,
                        error = %e,
                        "Handler failed; requeueing"
                    );
                    settle(delivery.reject(true).await, queue);
                    Outcome::Requeued
                }
            }
        }
    }

    fn record_failure(&self, key: &BodyKey, now: Instant) -> u32 {
        let mut failures = self.failures.lock().unwrap_or_else(|p| p.into_inner());
        failures.retain(|_, f| now.saturating_duration_since(f.last) < FAILURE_TTL);
        let entry = failures.entry(key.clone()).or_insert(FailureCount { count: 0, last: now });
        entry.count += 1;
        entry.last = now;
        entry.count
    }

    #[cfg(test)]
    fn tracked_failures(&self) -> usize {
        self.failures.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    fn forget(&self, key: &BodyKey) {
        self.failures
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(key);
    }
}
