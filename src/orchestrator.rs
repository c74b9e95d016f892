//! Request intake and status tracking.
//!
//! [`RequestOrchestrator::submit`] records a request as `PENDING`, publishes
//! it to `collector_requests_queue` and returns its id straight away. Workers
//! report progress on `collection_status_queue`; [`StatusListener`] feeds
//! those updates back through [`RequestOrchestrator::apply_update`], which
//! only ever moves a record forward.

use crate::config::OrchestratorConfig;
use crate::errors::{PipelineError, Result};
use crate::messaging::{MessageHandler, Publisher, COLLECTION_STATUS_QUEUE, COLLECTOR_REQUESTS_QUEUE};
use crate::models::{
    CollectionRequest, CollectionType, CollectorRequestPayload, CommentParams, MetadataParams,
    RequestStatus, StatusPayload,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

pub struct RequestOrchestrator {
    store: DashMap<String, CollectionRequest>,
    publisher: Arc<Publisher>,
    retention: chrono::Duration,
    sweep_interval: Duration,
    changed: Notify,
}

impl std::fmt::Debug for RequestOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestOrchestrator")
            .field("requests", &self.store.len())
            .field("retention", &self.retention)
            .finish()
    }
}

impl RequestOrchestrator {
    pub fn new(publisher: Arc<Publisher>, config: &OrchestratorConfig) -> Self {
        Self {
            store: DashMap::new(),
            publisher,
            retention: chrono::Duration::seconds(config.retention_secs as i64),
            sweep_interval: Duration::from_secs(config.sweep_interval_secs.max(1)),
            changed: Notify::new(),
        }
    }

    /// Accept a request and queue it for a worker.
    ///
    /// Parameters are checked against the request type first. If the work
    /// message cannot be published the record is kept as `FAILED` and the
    /// error is returned.
    #[instrument(level = "info", skip(self, params))]
    pub async fn submit(&self, kind: CollectionType, params: Value) -> Result<String> {
        check_params(kind, &params)?;

        let request_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        self.store.insert(
            request_id.clone(),
            CollectionRequest {
                request_id: request_id.clone(),
                kind,
                params: params.clone(),
                status: RequestStatus::Pending,
                progress: 0,
                total_collected: None,
                error: None,
                created_at: now,
                started_at: None,
                completed_at: None,
            },
        );

        let payload = CollectorRequestPayload {
            request_id: request_id.clone(),
            kind,
            params,
            queued_at: now,
        };
        if let Err(e) = self
            .publisher
            .publish_json(COLLECTOR_REQUESTS_QUEUE, &payload)
            .await
        {
            self.apply_update(&StatusPayload {
                collection_id: request_id.clone(),
                status: RequestStatus::Failed,
                progress: 0,
                total_collected: None,
                error: Some(format!("could not queue request: {e}")),
            });
            return Err(e);
        }

        info!(%request_id, "Request queued");
        Ok(request_id)
    }

    pub fn get_status(&self, request_id: &str) -> Option<CollectionRequest> {
        self.store.get(request_id).map(|r| r.clone())
    }

    pub fn list(&self) -> Vec<CollectionRequest> {
        let mut all: Vec<_> = self.store.iter().map(|r| r.clone()).collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all
    }

    /// Apply a worker's status report. Returns whether the record changed.
    ///
    /// Unknown ids and backwards transitions are ignored. A repeated
    /// non-terminal status may only raise progress.
    pub fn apply_update(&self, update: &StatusPayload) -> bool {
        let Some(mut record) = self.store.get_mut(&update.collection_id) else {
            warn!(collection_id = %update.collection_id, "Status for unknown request");
            return false;
        };

        let now = Utc::now();
        let progress = update.progress.min(100);
        if record.status == update.status && !record.status.is_terminal() {
            if progress <= record.progress {
                return false;
            }
            record.progress = progress;
        } else if record.status.can_transition_to(update.status) {
            debug!(
                collection_id = %update.collection_id,
                from = %record.status,
                to = %update.status,
                "Status transition"
            );
            record.status = update.status;
            record.progress = progress.max(record.progress);
            match update.status {
                RequestStatus::Running => record.started_at = Some(now),
                RequestStatus::Completed | RequestStatus::Failed => {
                    record.started_at.get_or_insert(now);
                    record.completed_at = Some(now);
                    record.total_collected = update.total_collected;
                    record.error = update.error.clone();
                }
                RequestStatus::Pending => {}
            }
        } else {
            warn!(
                collection_id = %update.collection_id,
                from = %record.status,
                to = %update.status,
                "Ignoring out-of-order status"
            );
            return false;
        }
        drop(record);
        self.changed.notify_waiters();
        true
    }

    /// Wait until a request reaches a terminal status.
    pub async fn wait_terminal(&self, request_id: &str, cancel: &CancellationToken) -> Result<CollectionRequest> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.get_status(request_id) {
                None => {
                    return Err(PipelineError::InvalidRequest(format!(
                        "unknown request {request_id}"
                    )))
                }
                Some(record) if record.status.is_terminal() => return Ok(record),
                Some(_) => {}
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                _ = &mut notified => {}
            }
        }
    }

    /// Drop terminal records that completed more than the retention ago.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let before = self.store.len();
        self.store.retain(|_, r| {
            !(r.status.is_terminal() && r.completed_at.is_some_and(|t| now - t > self.retention))
        });
        let removed = before.saturating_sub(self.store.len());
        if removed > 0 {
            info!(removed, remaining = self.store.len(), "Swept finished requests");
        }
        removed
    }

    pub fn sweep(&self) -> usize {
        self.sweep_at(Utc::now())
    }

    /// Run [`sweep`](Self::sweep) every sweep interval until `cancel` fires.
    pub fn spawn_sweeper(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.sweep_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Stopped request sweeper");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.sweep();
                    }
                }
            }
        })
    }
}

fn check_params(kind: CollectionType, params: &Value) -> Result<()> {
    let invalid = |e: serde_json::Error| PipelineError::InvalidRequest(format!("{kind} params: {e}"));
    match kind {
        CollectionType::Metadata => {
            let p = MetadataParams::deserialize(params).map_err(invalid)?;
            if p.keyword.trim().is_empty() {
                return Err(PipelineError::InvalidRequest("keyword is required".into()));
            }
            if p.end_date < p.start_date {
                return Err(PipelineError::InvalidRequest(
                    "end_date is before start_date".into(),
                ));
            }
        }
        CollectionType::Comments => {
            let p = CommentParams::deserialize(params).map_err(invalid)?;
            if p.article_urls.is_empty() {
                return Err(PipelineError::InvalidRequest("article_urls is empty".into()));
            }
        }
    }
    Ok(())
}

/// Applies `collection_status_queue` updates to an orchestrator.
pub struct StatusListener {
    orchestrator: Arc<RequestOrchestrator>,
}

impl StatusListener {
    pub fn new(orchestrator: Arc<RequestOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl MessageHandler for StatusListener {
    fn queue(&self) -> &str {
        COLLECTION_STATUS_QUEUE
    }

    async fn handle(&self, message: &Value, _cancel: &CancellationToken) -> Result<()> {
        let update = StatusPayload::deserialize(message).map_err(|e| PipelineError::Decode(e.to_string()))?;
        self.orchestrator.apply_update(&update);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::{CollectorDeps, CollectorRegistry};
    use crate::config::{BrokerConfig, PipelineConfig, SubscriberConfig};
    use crate::messaging::memory::MemoryBroker;
    use crate::messaging::{Subscriber, METADATA_QUEUE};
    use crate::models::MetadataPayload;
    use crate::offload::BlockingPool;
    use crate::testing::{LineParser, ScriptedFetcher};
    use crate::worker::CollectionWorker;
    use chrono::Local;
    use serde_json::json;

    fn broker_config() -> BrokerConfig {
        BrokerConfig {
            retry_delay_ms: 1,
            ..BrokerConfig::default()
        }
    }

    fn orchestrator(broker: &MemoryBroker) -> Arc<RequestOrchestrator> {
        let publisher = Arc::new(Publisher::new(Arc::new(broker.clone()), broker_config()));
        Arc::new(RequestOrchestrator::new(publisher, &OrchestratorConfig::default()))
    }

    fn metadata_params() -> Value {
        json!({"keyword": "rust", "start_date": "2025-06-01", "end_date": "2025-06-02"})
    }

    fn status(id: &str, status: RequestStatus, progress: u8) -> StatusPayload {
        StatusPayload {
            collection_id: id.to_string(),
            status,
            progress,
            total_collected: None,
            error: None,
        }
    }

    #[tokio::test]
    async fn test_submit_queues_pending_request() {
        let broker = MemoryBroker::new(true);
        let orch = orchestrator(&broker);
        let id = orch
            .submit(CollectionType::Metadata, metadata_params())
            .await
            .unwrap();

        assert!(Uuid::parse_str(&id).is_ok());
        let record = orch.get_status(&id).unwrap();
        assert_eq!(record.status, RequestStatus::Pending);
        let queued = broker.drain(COLLECTOR_REQUESTS_QUEUE);
        assert_eq!(queued.len(), 1);
        let payload: CollectorRequestPayload = serde_json::from_slice(&queued[0]).unwrap();
        assert_eq!(payload.request_id, id);
        assert_eq!(payload.kind, CollectionType::Metadata);
        assert!(orch.get_status("missing").is_none());
    }

    #[tokio::test]
    async fn test_invalid_params_rejected_before_queueing() {
        let broker = MemoryBroker::new(true);
        let orch = orchestrator(&broker);
        let err = orch
            .submit(
                CollectionType::Metadata,
                json!({"keyword": "rust", "start_date": "2025-06-02", "end_date": "2025-06-01"}),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidRequest(_)));
        assert_eq!(broker.connect_attempts(), 0);
        assert!(orch.list().is_empty());
    }

    #[tokio::test]
    async fn test_unpublishable_request_is_failed() {
        let broker = MemoryBroker::new(true);
        broker.fail_next_connects(10);
        let orch = orchestrator(&broker);
        let err = orch
            .submit(CollectionType::Comments, json!({"article_urls": ["https://n/1"]}))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Connection(_)));
        let record = orch.list().pop().unwrap();
        assert_eq!(record.status, RequestStatus::Failed);
        assert!(record.error.is_some());
        assert!(record.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_status_never_leaves_terminal_state() {
        let broker = MemoryBroker::new(true);
        let orch = orchestrator(&broker);
        let id = orch
            .submit(CollectionType::Metadata, metadata_params())
            .await
            .unwrap();

        assert!(orch.apply_update(&status(&id, RequestStatus::Running, 0)));
        assert!(orch.apply_update(&status(&id, RequestStatus::Running, 50)));
        assert!(!orch.apply_update(&status(&id, RequestStatus::Running, 10)));
        assert!(orch.apply_update(&StatusPayload {
            total_collected: Some(4),
            ..status(&id, RequestStatus::Completed, 100)
        }));
        for late in [RequestStatus::Running, RequestStatus::Failed, RequestStatus::Pending] {
            assert!(!orch.apply_update(&status(&id, late, 100)));
        }

        let record = orch.get_status(&id).unwrap();
        assert_eq!(record.status, RequestStatus::Completed);
        assert_eq!(record.total_collected, Some(4));
        assert_eq!(record.progress, 100);
        assert!(record.started_at.is_some());
        assert!(!orch.apply_update(&status("unknown", RequestStatus::Running, 0)));
    }

    #[tokio::test]
    async fn test_terminal_status_on_pending_record_sets_started_at() {
        let broker = MemoryBroker::new(true);
        let orch = orchestrator(&broker);
        let id = orch
            .submit(CollectionType::Metadata, metadata_params())
            .await
            .unwrap();

        assert!(orch.apply_update(&status(&id, RequestStatus::Completed, 100)));
        let record = orch.get_status(&id).unwrap();
        assert_eq!(record.status, RequestStatus::Completed);
        assert!(record.started_at.is_some());
        assert_eq!(record.started_at, record.completed_at);
    }

    #[tokio::test]
    async fn test_sweep_removes_only_old_terminal_records() {
        let broker = MemoryBroker::new(true);
        let orch = orchestrator(&broker);
        let done = orch.submit(CollectionType::Metadata, metadata_params()).await.unwrap();
        let open = orch.submit(CollectionType::Metadata, metadata_params()).await.unwrap();
        orch.apply_update(&status(&done, RequestStatus::Failed, 0));

        assert_eq!(orch.sweep(), 0);
        let later = Utc::now() + chrono::Duration::days(2);
        assert_eq!(orch.sweep_at(later), 1);
        assert!(orch.get_status(&done).is_none());
        assert!(orch.get_status(&open).is_some());
    }

    #[tokio::test]
    async fn test_end_to_end_recent_collection_completes() {
        let broker = MemoryBroker::new(true);
        let cancel = CancellationToken::new();

        let mut config = PipelineConfig::default();
        config.executor.concurrency = 2;
        config.scheduler.scroll_pause_ms = 0;
        let fetcher = Arc::new(ScriptedFetcher::daily(3));
        let registry = CollectorRegistry::standard(
            &config,
            CollectorDeps {
                pool: None,
                offload: Arc::new(BlockingPool::new(4)),
                fetcher: fetcher.clone(),
                parser: Arc::new(LineParser),
                news_api: None,
            },
        );

        let publisher = Arc::new(Publisher::new(Arc::new(broker.clone()), broker_config()));
        let orch = Arc::new(RequestOrchestrator::new(publisher.clone(), &config.orchestrator));
        let worker = Arc::new(CollectionWorker::new(Arc::new(registry), publisher));
        let subscriber = Arc::new(
            Subscriber::new(Arc::new(broker.clone()), broker_config(), SubscriberConfig::default())
                .with_handler(worker)
                .with_handler(Arc::new(StatusListener::new(orch.clone()))),
        );
        let consumer = {
            let subscriber = subscriber.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { subscriber.run(cancel).await })
        };

        let today = Local::now().date_naive();
        let params = json!({
            "keyword": "X",
            "start_date": (today - chrono::Duration::days(1)).to_string(),
            "end_date": today.to_string(),
            "max_articles": 5
        });
        let id = orch.submit(CollectionType::Metadata, params).await.unwrap();

        let record = tokio::time::timeout(Duration::from_secs(10), orch.wait_terminal(&id, &cancel))
            .await
            .unwrap()
            .unwrap();
        cancel.cancel();
        consumer.await.unwrap().unwrap();

        assert_eq!(record.status, RequestStatus::Completed);
        assert_eq!(record.progress, 100);
        assert!(fetcher.peak() <= 2);
        let days: std::collections::HashSet<_> = fetcher
            .queries()
            .into_iter()
            .filter(|q| q.page() == 0)
            .collect();
        assert_eq!(days.len(), 2);

        let batches = broker.drain(METADATA_QUEUE);
        assert_eq!(batches.len(), 1);
        let payload: MetadataPayload = serde_json::from_slice(&batches[0]).unwrap();
        assert_eq!(record.total_collected, Some(payload.articles.len()));
        assert!(payload.articles.len() <= 5);
        for pair in payload.articles.windows(2) {
            assert!(pair[0].published_date >= pair[1].published_date);
        }
    }
}
