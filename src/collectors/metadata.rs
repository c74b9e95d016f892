//! Keyword search collection: one `metadata_queue` batch per request.
//!
//! `SEARCH` requests scrape search result pages through the day-sharded
//! scheduler. `API` requests page through the news-search API and fail as
//! invalid when no API client is configured.

use super::api::{collect_from_api, NewsSearchApi};
use super::{decode_params, CollectionOutput, Collector, CollectorDeps};
use crate::config::{ApiConfig, PipelineConfig};
use crate::executor::BoundedExecutor;
use crate::errors::{PipelineError, Result};
use crate::messaging::{Envelope, METADATA_QUEUE};
use crate::models::{CollectionMethod, CollectionType, MetadataParams, MetadataPayload, MetadataSummary};
use crate::retry::RetryPolicy;
use crate::scheduler::ShardScheduler;
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

struct ApiSource {
    client: Arc<dyn NewsSearchApi>,
    config: ApiConfig,
    retry: RetryPolicy,
}

pub struct MetadataCollector {
    scheduler: Arc<ShardScheduler>,
    api: Option<ApiSource>,
    api_collection: bool,
    today: Option<NaiveDate>,
}

impl MetadataCollector {
    pub fn new(scheduler: Arc<ShardScheduler>) -> Self {
        Self {
            scheduler,
            api: None,
            api_collection: false,
            today: None,
        }
    }

    /// Scheduler and optional API source wired from config.
    pub fn standard(config: &PipelineConfig, deps: &CollectorDeps) -> Self {
        let scheduler = ShardScheduler::new(
            config.scheduler.clone(),
            BoundedExecutor::from_config(&config.executor),
            deps.pool.clone(),
            Arc::clone(&deps.offload),
            Arc::clone(&deps.fetcher),
            Arc::clone(&deps.parser),
        );
        let collector = Self::new(Arc::new(scheduler));
        match &deps.news_api {
            Some(api) => collector.with_api(Arc::clone(api), config.api.clone(), config.executor.retry),
            None => collector,
        }
    }

    /// Enable the `API` method.
    pub fn with_api(mut self, client: Arc<dyn NewsSearchApi>, config: ApiConfig, retry: RetryPolicy) -> Self {
        self.api = Some(ApiSource { client, config, retry });
        self
    }

    /// Mark produced articles as collected on behalf of an API request.
    pub fn with_api_collection(mut self, api_collection: bool) -> Self {
        self.api_collection = api_collection;
        self
    }

    /// Pin "today" for the recency cutoff.
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = Some(today);
        self
    }

    /// Collect and build the payload without wrapping it in an envelope.
    #[instrument(level = "info", skip_all, fields(keyword = %params.keyword, method = %params.method))]
    pub async fn collect_payload(
        &self,
        params: &MetadataParams,
        cancel: &CancellationToken,
    ) -> Result<MetadataPayload> {
        if params.max_articles == 0 {
            return Err(PipelineError::InvalidRequest("max_articles must be > 0".into()));
        }
        let mut articles = match params.method {
            CollectionMethod::Search => {
                let today = self.today.unwrap_or_else(|| chrono::Local::now().date_naive());
                self.scheduler
                    .collect_at(
                        &params.keyword,
                        params.start_date,
                        params.end_date,
                        params.max_articles,
                        today,
                        cancel,
                    )
                    .await?
            }
            CollectionMethod::Api => {
                let Some(api) = &self.api else {
                    return Err(PipelineError::InvalidRequest(
                        "API collection requested but no news API credentials are configured".into(),
                    ));
                };
                if params.end_date < params.start_date {
                    return Err(PipelineError::InvalidRequest("end date is before start date".into()));
                }
                collect_from_api(
                    api.client.as_ref(),
                    &api.config,
                    &api.retry,
                    &params.keyword,
                    params.start_date,
                    params.end_date,
                    params.max_articles,
                    cancel,
                )
                .await?
            }
        };

        for article in &mut articles {
            article.is_test = params.is_test;
            article.is_api_collection = self.api_collection;
        }
        info!(collected = articles.len(), "Metadata collected");

        Ok(MetadataPayload {
            metadata: MetadataSummary {
                method: params.method,
                total_collected: articles.len(),
                keyword: params.keyword.clone(),
                is_test: params.is_test,
                is_api_collection: self.api_collection,
            },
            articles,
            collected_at: Utc::now(),
        })
    }
}

#[async_trait]
impl Collector for MetadataCollector {
    fn kind(&self) -> CollectionType {
        CollectionType::Metadata
    }

    async fn collect(&self, params: &Value, cancel: &CancellationToken) -> Result<CollectionOutput> {
        let params: MetadataParams = decode_params(self.kind(), params)?;
        let payload = self.collect_payload(&params, cancel).await?;
        let total_collected = payload.articles.len();
        Ok(CollectionOutput {
            envelopes: vec![Envelope::new(METADATA_QUEUE, &payload)?],
            total_collected,
        })
    }
}
