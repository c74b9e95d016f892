//! Validated, persistent, all-or-nothing publishing.

use super::broker::{Broker, BrokerChannel};
use super::{schema, Envelope};
use crate::config::BrokerConfig;
use crate::errors::{PipelineError, Result};
use crate::utils::truncate_for_log;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

/// Open a channel, trying up to `max_retries` times with a fixed delay.
pub async fn connect_with_retry(
    broker: &dyn Broker,
    config: &BrokerConfig,
) -> Result<Arc<dyn BrokerChannel>> {
    let attempts = config.max_retries.max(1);
    let mut last_error = None;
    for attempt in 1..=attempts {
        match broker.connect().await {
            Ok(channel) => {
                if attempt > 1 {
                    info!(attempt, "Broker connection established after retry");
                }
                return Ok(channel);
            }
            Err(e) => {
                warn!(attempt, max = attempts, error = %e, "Broker connection failed");
                last_error = Some(e);
                if attempt < attempts {
                    sleep(config.retry_delay()).await;
                }
            }
        }
    }
    let reason = last_error.map(|e| e.to_string()).unwrap_or_default();
    error!(attempts, %reason, "Giving up on broker connection");
    Err(PipelineError::Connection(format!(
        "failed after {attempts} attempts: {reason}"
    )))
}

pub struct Publisher {
    broker: Arc<dyn Broker>,
    config: BrokerConfig,
    channel: Mutex<Option<Arc<dyn BrokerChannel>>>,
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("max_retries", &self.config.max_retries)
            .finish()
    }
}

impl Publisher {
    pub fn new(broker: Arc<dyn Broker>, config: BrokerConfig) -> Self {
        Self {
            broker,
            config,
            channel: Mutex::new(None),
        }
    }

    async fn channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let mut slot = self.channel.lock().await;
        if let Some(channel) = slot.as_ref().filter(|c| c.is_open()) {
            return Ok(Arc::clone(channel));
        }
        let channel = connect_with_retry(self.broker.as_ref(), &self.config).await?;
        *slot = Some(Arc::clone(&channel));
        Ok(channel)
    }

    async fn reset(&self) {
        if let Some(channel) = self.channel.lock().await.take() {
            let _ = channel.close().await;
        }
    }

    /// Validate `message` for `queue` and publish it persistently.
    ///
    /// Validation happens before any connection is made. Failures after the
    /// connection is up reconnect and retry the whole publish up to
    /// `max_retries` times.
    #[instrument(level = "info", skip_all, fields(%queue))]
    pub async fn publish(&self, queue: &str, message: &Value) -> Result<()> {
        schema::validate(queue, message)?;
        let body = serde_json::to_vec(message)?;

        let attempts = self.config.max_retries.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            let channel = self.channel().await?;
            let outcome = async {
                channel.declare_queue(queue).await?;
                channel.publish(queue, &body).await
            }
            .await;

            match outcome {
                Ok(()) => {
                    debug!(
                        bytes = body.len(),
                        body = %truncate_for_log(&String::from_utf8_lossy(&body), 200),
                        "Published message"
                    );
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt, max = attempts, error = %e, "Publish failed; reconnecting");
                    self.reset().await;
                    last_error = Some(e);
                    if attempt < attempts {
                        sleep(self.config.retry_delay()).await;
                    }
                }
            }
        }
        let reason = last_error.map(|e| e.to_string()).unwrap_or_default();
        Err(PipelineError::publish(queue, reason))
    }

    pub async fn publish_json<T: Serialize>(&self, queue: &str, payload: &T) -> Result<()> {
        let value = serde_json::to_value(payload)?;
        self.publish(queue, &value).await
    }

    pub async fn publish_envelope(&self, envelope: &Envelope) -> Result<()> {
        self.publish(&envelope.queue, &envelope.payload).await
    }

    pub async fn close(&self) {
        self.reset().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::memory::MemoryBroker;
    use crate::messaging::{COLLECTION_STATUS_QUEUE, METADATA_QUEUE};
    use serde_json::json;

    fn config() -> BrokerConfig {
        BrokerConfig {
            max_retries: 3,
            retry_delay_ms: 1,
            ..BrokerConfig::default()
        }
    }

    fn metadata_message() -> Value {
        json!({
            "articles": [],
            "collected_at": "2025-06-10T00:00:00Z",
            "metadata": {
                "method": "SEARCH", "total_collected": 0, "keyword": "rust",
                "is_test": false, "is_api_collection": false
            }
        })
    }

    #[tokio::test]
    async fn test_invalid_message_never_connects() {
        let broker = MemoryBroker::new(true);
        let publisher = Publisher::new(Arc::new(broker.clone()), config());
        let mut msg = metadata_message();
        msg.as_object_mut().unwrap().remove("collected_at");

        let err = publisher.publish(METADATA_QUEUE, &msg).await.unwrap_err();
        assert!(matches!(err, PipelineError::Validation { ref field, .. } if field == "collected_at"));
        assert_eq!(broker.connect_attempts(), 0);
        assert_eq!(broker.depth(METADATA_QUEUE), 0);
    }

    #[tokio::test]
    async fn test_publish_reuses_connection() {
        let broker = MemoryBroker::new(true);
        let publisher = Publisher::new(Arc::new(broker.clone()), config());
        publisher.publish(METADATA_QUEUE, &metadata_message()).await.unwrap();
        publisher.publish(METADATA_QUEUE, &metadata_message()).await.unwrap();
        assert_eq!(broker.connect_attempts(), 1);
        assert_eq!(broker.depth(METADATA_QUEUE), 2);
    }

    #[tokio::test]
    async fn test_connection_retried_then_succeeds() {
        let broker = MemoryBroker::new(true);
        broker.fail_next_connects(2);
        let publisher = Publisher::new(Arc::new(broker.clone()), config());
        let status = json!({"collection_id": "a", "status": "RUNNING", "progress": 0});
        publisher.publish(COLLECTION_STATUS_QUEUE, &status).await.unwrap();
        assert_eq!(broker.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn test_connection_exhaustion_raises() {
        let broker = MemoryBroker::new(true);
        broker.fail_next_connects(10);
        let publisher = Publisher::new(Arc::new(broker.clone()), config());
        let err = publisher
            .publish(METADATA_QUEUE, &metadata_message())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Connection(_)));
        assert_eq!(broker.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn test_mid_flight_failure_reconnects_and_delivers_once() {
        let broker = MemoryBroker::new(true);
        let publisher = Publisher::new(Arc::new(broker.clone()), config());
        broker.fail_next_publishes(1);
        publisher.publish(METADATA_QUEUE, &metadata_message()).await.unwrap();
        assert_eq!(broker.connect_attempts(), 2);
        assert_eq!(broker.depth(METADATA_QUEUE), 1);
    }

    #[tokio::test]
    async fn test_persistent_publish_failure_raises_publish_error() {
        let broker = MemoryBroker::new(true);
        let publisher = Publisher::new(Arc::new(broker.clone()), config());
        broker.fail_next_publishes(5);
        let err = publisher
            .publish(METADATA_QUEUE, &metadata_message())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Publish { .. }));
        assert_eq!(broker.depth(METADATA_QUEUE), 0);
    }
}
