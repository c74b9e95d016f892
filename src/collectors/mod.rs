//! Collectors turn a request's parameters into result envelopes.
//!
//! Each [`CollectionType`] has one [`Collector`]; the [`CollectorRegistry`]
//! picks it for an incoming request.

pub mod api;
pub mod comments;
pub mod metadata;

use crate::config::PipelineConfig;
use crate::errors::{PipelineError, Result};
use crate::executor::BoundedExecutor;
use crate::fetch::Fetcher;
use crate::messaging::Envelope;
use crate::models::CollectionType;
use crate::offload::BlockingPool;
use crate::parser::Parser;
use crate::pool::ResourcePool;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub use api::{NaverNewsApi, NewsSearchApi};
pub use comments::CommentCollector;
pub use metadata::MetadataCollector;

/// What a collection produced, ready to publish.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectionOutput {
    pub envelopes: Vec<Envelope>,
    pub total_collected: usize,
}

#[async_trait]
pub trait Collector: Send + Sync {
    fn kind(&self) -> CollectionType;

    async fn collect(&self, params: &Value, cancel: &CancellationToken) -> Result<CollectionOutput>;
}

/// Decode request parameters; malformed ones are a permanent error.
pub(crate) fn decode_params<T: DeserializeOwned>(kind: CollectionType, params: &Value) -> Result<T> {
    T::deserialize(params).map_err(|e| PipelineError::InvalidRequest(format!("{kind} params: {e}")))
}

/// Shared collaborators every collector draws from.
#[derive(Clone)]
pub struct CollectorDeps {
    pub pool: Option<Arc<ResourcePool>>,
    pub offload: Arc<BlockingPool>,
    pub fetcher: Arc<dyn Fetcher>,
    pub parser: Arc<dyn Parser>,
    /// Present when news-search API credentials are configured.
    pub news_api: Option<Arc<dyn NewsSearchApi>>,
}

#[derive(Default)]
pub struct CollectorRegistry {
    collectors: HashMap<CollectionType, Arc<dyn Collector>>,
}

impl std::fmt::Debug for CollectorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kinds: Vec<String> = self.collectors.keys().map(ToString::to_string).collect();
        f.debug_struct("CollectorRegistry").field("kinds", &kinds).finish()
    }
}

impl CollectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the metadata and comment collectors wired from config.
    ///
    /// Collections run through here are marked as API-triggered.
    pub fn standard(config: &PipelineConfig, deps: CollectorDeps) -> Self {
        let metadata = MetadataCollector::standard(config, &deps).with_api_collection(true);
        let comments = CommentCollector::new(
            BoundedExecutor::from_config(&config.executor),
            config.scheduler.clone(),
            deps,
        )
        .with_batch_size(config.executor.chunk_size);
        Self::new()
            .register(Arc::new(metadata))
            .register(Arc::new(comments))
    }

    pub fn register(mut self, collector: Arc<dyn Collector>) -> Self {
        self.collectors.insert(collector.kind(), collector);
        self
    }

    pub fn get(&self, kind: CollectionType) -> Result<Arc<dyn Collector>> {
        self.collectors
            .get(&kind)
            .cloned()
            .ok_or_else(|| PipelineError::InvalidRequest(format!("no collector for {kind}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{LineParser, ScriptedFetcher};

    fn deps() -> CollectorDeps {
        CollectorDeps {
            pool: None,
            offload: Arc::new(BlockingPool::new(2)),
            fetcher: Arc::new(ScriptedFetcher::daily(1)),
            parser: Arc::new(LineParser),
            news_api: None,
        }
    }

    #[test]
    fn test_standard_registry_has_both_kinds() {
        let registry = CollectorRegistry::standard(&PipelineConfig::default(), deps());
        assert_eq!(registry.get(CollectionType::Metadata).unwrap().kind(), CollectionType::Metadata);
        assert_eq!(registry.get(CollectionType::Comments).unwrap().kind(), CollectionType::Comments);
    }

    #[test]
    fn test_missing_collector_is_invalid_request() {
        let registry = CollectorRegistry::new();
        assert!(matches!(
            registry.get(CollectionType::Comments),
            Err(PipelineError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_bad_params_are_permanent() {
        let err = decode_params::<crate::models::MetadataParams>(
            CollectionType::Metadata,
            &serde_json::json!({"keyword": 3}),
        )
        .unwrap_err();
        assert!(!err.is_retryable());
    }
}
