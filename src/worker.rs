//! Collection worker: consumes `collector_requests_queue`, runs the matching
//! collector, publishes its results and reports status back to the
//! orchestrator.
//!
//! Status messages go out in order `RUNNING(0)`, `RUNNING(50)` once the
//! collection has finished, then `COMPLETED(100)` after every result
//! envelope is published. Any failure along the way, including
//! cancellation, is reported as `FAILED` with the error text.
//!
//! The terminal status is retried on its own with `status_retry`. If it
//! still cannot be published the request is acknowledged anyway, so a status
//! queue outage never re-runs a finished collection.

use crate::collectors::CollectorRegistry;
use crate::errors::{PipelineError, Result};
use crate::messaging::{MessageHandler, Publisher, COLLECTION_STATUS_QUEUE, COLLECTOR_REQUESTS_QUEUE};
use crate::models::{CollectorRequestPayload, RequestStatus, StatusPayload};
use crate::retry::{retry_with_backoff, RetryPolicy};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

pub struct CollectionWorker {
    registry: Arc<CollectorRegistry>,
    publisher: Arc<Publisher>,
    running: DashMap<String, CancellationToken>,
    status_retry: RetryPolicy,
}

impl std::fmt::Debug for CollectionWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectionWorker")
            .field("registry", &self.registry)
            .field("running", &self.running.len())
            .finish()
    }
}

impl CollectionWorker {
    pub fn new(registry: Arc<CollectorRegistry>, publisher: Arc<Publisher>) -> Self {
        Self {
            registry,
            publisher,
            running: DashMap::new(),
            status_retry: RetryPolicy::new(3, Duration::from_secs(1)),
        }
    }

    pub fn with_status_retry(mut self, policy: RetryPolicy) -> Self {
        self.status_retry = policy;
        self
    }

    /// Cancel an in-flight request. Returns false if it is not running here.
    pub fn cancel(&self, request_id: &str) -> bool {
        match self.running.get(request_id) {
            Some(token) => {
                info!(%request_id, "Cancelling collection");
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn in_flight(&self) -> Vec<String> {
        self.running.iter().map(|e| e.key().clone()).collect()
    }

    async fn report(
        &self,
        request_id: &str,
        status: RequestStatus,
        progress: u8,
        total_collected: Option<usize>,
        error: Option<String>,
    ) -> Result<()> {
        let payload = StatusPayload {
            collection_id: request_id.to_string(),
            status,
            progress,
            total_collected,
            error,
        };
        self.publisher
            .publish_json(COLLECTION_STATUS_QUEUE, &payload)
            .await
    }

    /// Publish the terminal status, retrying on its own. Never fails the
    /// delivery.
    async fn report_terminal(
        &self,
        request_id: &str,
        status: RequestStatus,
        progress: u8,
        total_collected: Option<usize>,
        error: Option<String>,
    ) {
        let never = CancellationToken::new();
        let res = retry_with_backoff(&self.status_retry, &never, COLLECTION_STATUS_QUEUE, |_| {
            self.report(request_id, status, progress, total_collected, error.clone())
        })
        .await;
        if let Err(e) = res {
            error!(%status, error = %e, "Could not publish terminal status; acknowledging request");
        }
    }

    /// Run the collector and publish its envelopes; returns the total.
    async fn run(&self, request: &CollectorRequestPayload, cancel: &CancellationToken) -> Result<usize> {
        let collector = self.registry.get(request.kind)?;
        let output = collector.collect(&request.params, cancel).await?;
        self.report(&request.request_id, RequestStatus::Running, 50, None, None)
            .await?;

        for envelope in &output.envelopes {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            self.publisher.publish_envelope(envelope).await?;
        }
        Ok(output.total_collected)
    }
}

#[async_trait]
impl MessageHandler for CollectionWorker {
    fn queue(&self) -> &str {
        COLLECTOR_REQUESTS_QUEUE
    }

    #[instrument(level = "info", skip_all, fields(request_id = tracing::field::Empty))]
    async fn handle(&self, message: &Value, cancel: &CancellationToken) -> Result<()> {
        let request: CollectorRequestPayload = serde_json::from_value(message.clone())
            .map_err(|e| PipelineError::Decode(e.to_string()))?;
        let id = request.request_id.clone();
        tracing::Span::current().record("request_id", id.as_str());

        let token = cancel.child_token();
        match self.running.entry(id.clone()) {
            Entry::Occupied(_) => {
                warn!(kind = %request.kind, "Request already running here; ignoring duplicate");
                return Ok(());
            }
            Entry::Vacant(slot) => {
                slot.insert(token.clone());
            }
        }
        info!(kind = %request.kind, "Starting collection");

        let outcome = match self.report(&id, RequestStatus::Running, 0, None, None).await {
            Ok(()) => self.run(&request, &token).await,
            Err(e) => Err(e),
        };
        self.running.remove(&id);

        match outcome {
            Ok(total) => {
                info!(total, "Collection completed");
                self.report_terminal(&id, RequestStatus::Completed, 100, Some(total), None)
                    .await;
            }
            Err(PipelineError::Cancelled) => {
                warn!("Collection cancelled");
                self.report_terminal(&id, RequestStatus::Failed, 0, None, Some("cancelled".into()))
                    .await;
            }
            Err(e) => {
                error!(error = %e, "Collection failed");
                self.report_terminal(&id, RequestStatus::Failed, 0, None, Some(e.to_string()))
                    .await;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::{CollectionOutput, Collector};
    use crate::config::BrokerConfig;
    use crate::messaging::memory::MemoryBroker;
    use crate::messaging::{Envelope, METADATA_QUEUE};
    use crate::models::CollectionType;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Collector that either emits a fixed batch or waits to be cancelled.
    #[derive(Default)]
    struct StubCollector {
        block: bool,
        fail: bool,
        calls: Arc<AtomicUsize>,
        /// Fail this many publishes once RUNNING(50) and the batch are out.
        status_outage: Option<(MemoryBroker, usize)>,
    }

    #[async_trait]
    impl Collector for StubCollector {
        fn kind(&self) -> CollectionType {
            CollectionType::Metadata
        }

        async fn collect(&self, _params: &Value, cancel: &CancellationToken) -> Result<CollectionOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some((broker, n)) = &self.status_outage {
                broker.fail_publishes_after(2, *n);
            }
            if self.block {
                cancel.cancelled().await;
                return Err(PipelineError::Cancelled);
            }
            if self.fail {
                return Err(PipelineError::InvalidRequest("end date is before start date".into()));
            }
            let payload = json!({
                "articles": [{"title": "t", "link": "https://n/1"}],
                "collected_at": Utc::now(),
                "metadata": {
                    "method": "SEARCH", "total_collected": 1, "keyword": "rust",
                    "is_test": true, "is_api_collection": true
                }
            });
            Ok(CollectionOutput {
                envelopes: vec![Envelope::new(METADATA_QUEUE, &payload)?],
                total_collected: 1,
            })
        }
    }

    fn worker(broker: &MemoryBroker, stub: StubCollector) -> Arc<CollectionWorker> {
        let publisher = Arc::new(Publisher::new(
            Arc::new(broker.clone()),
            BrokerConfig {
                retry_delay_ms: 1,
                ..BrokerConfig::default()
            },
        ));
        let registry = CollectorRegistry::new().register(Arc::new(stub));
        Arc::new(
            CollectionWorker::new(Arc::new(registry), publisher)
                .with_status_retry(RetryPolicy::new(2, Duration::from_millis(1))),
        )
    }

    fn request(id: &str) -> Value {
        json!({"request_id": id, "type": "metadata", "params": {}, "queued_at": Utc::now()})
    }

    fn statuses(broker: &MemoryBroker) -> Vec<StatusPayload> {
        broker
            .drain(COLLECTION_STATUS_QUEUE)
            .iter()
            .map(|b| serde_json::from_slice(b).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_successful_run_reports_running_then_completed() {
        let broker = MemoryBroker::new(true);
        let w = worker(&broker, StubCollector { block: false, fail: false, ..Default::default() });
        w.handle(&request("r1"), &CancellationToken::new()).await.unwrap();

        let seen = statuses(&broker);
        let steps: Vec<_> = seen.iter().map(|s| (s.status, s.progress)).collect();
        assert_eq!(
            steps,
            vec![
                (RequestStatus::Running, 0),
                (RequestStatus::Running, 50),
                (RequestStatus::Completed, 100)
            ]
        );
        assert_eq!(seen[2].total_collected, Some(1));
        assert_eq!(broker.depth(METADATA_QUEUE), 1);
        assert!(w.in_flight().is_empty());
    }

    #[tokio::test]
    async fn test_collector_error_reports_failed_and_acks() {
        let broker = MemoryBroker::new(true);
        let w = worker(&broker, StubCollector { block: false, fail: true, ..Default::default() });
        w.handle(&request("r1"), &CancellationToken::new()).await.unwrap();

        let last = statuses(&broker).pop().unwrap();
        assert_eq!(last.status, RequestStatus::Failed);
        assert!(last.error.unwrap().contains("before start date"));
        assert_eq!(broker.depth(METADATA_QUEUE), 0);
    }

    #[tokio::test]
    async fn test_cancel_ends_request_as_failed_cancelled() {
        let broker = MemoryBroker::new(true);
        let w = worker(&broker, StubCollector { block: true, fail: false, ..Default::default() });
        let task = {
            let w = w.clone();
            tokio::spawn(async move { w.handle(&request("r1"), &CancellationToken::new()).await })
        };

        for _ in 0..100 {
            if w.cancel("r1") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        task.await.unwrap().unwrap();

        let last = statuses(&broker).pop().unwrap();
        assert_eq!(last.status, RequestStatus::Failed);
        assert_eq!(last.error.as_deref(), Some("cancelled"));
        assert!(!w.cancel("r1"));
    }

    #[tokio::test]
    async fn test_undecodable_request_is_permanent() {
        let broker = MemoryBroker::new(true);
        let w = worker(&broker, StubCollector { block: false, fail: false, ..Default::default() });
        let err = w
            .handle(&json!({"request_id": 1}), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(broker.depth(COLLECTION_STATUS_QUEUE), 0);
    }

    #[tokio::test]
    async fn test_terminal_status_retried_without_rerunning_collection() {
        let broker = MemoryBroker::new(true);
        let stub = StubCollector {
            status_outage: Some((broker.clone(), 3)),
            ..Default::default()
        };
        let calls = stub.calls.clone();
        let w = worker(&broker, stub);
        w.handle(&request("r1"), &CancellationToken::new()).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(broker.depth(METADATA_QUEUE), 1);
        let last = statuses(&broker).pop().unwrap();
        assert_eq!(last.status, RequestStatus::Completed);
    }

    #[tokio::test]
    async fn test_lost_terminal_status_still_acks() {
        let broker = MemoryBroker::new(true);
        let stub = StubCollector {
            status_outage: Some((broker.clone(), 100)),
            ..Default::default()
        };
        let w = worker(&broker, stub);
        w.handle(&request("r1"), &CancellationToken::new()).await.unwrap();

        assert_eq!(broker.depth(METADATA_QUEUE), 1);
        assert!(statuses(&broker)
            .iter()
            .all(|s| s.status == RequestStatus::Running));
        assert!(w.in_flight().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_delivery_ignored_while_running() {
        let broker = MemoryBroker::new(true);
        let w = worker(&broker, StubCollector { block: true, ..Default::default() });
        let task = {
            let w = w.clone();
            tokio::spawn(async move { w.handle(&request("r1"), &CancellationToken::new()).await })
        };
        for _ in 0..100 {
            if !w.in_flight().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        w.handle(&request("r1"), &CancellationToken::new()).await.unwrap();
        assert_eq!(w.in_flight(), vec!["r1".to_string()]);

        assert!(w.cancel("r1"));
        task.await.unwrap().unwrap();
        let running = statuses(&broker)
            .iter()
            .filter(|s| s.status == RequestStatus::Running && s.progress == 0)
            .count();
        assert_eq!(running, 1);
    }
}
