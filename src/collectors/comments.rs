//! Comment collection over known article URLs.
//!
//! Every article is one work item. Its comment view is paged until the
//! comment count stops growing, then published as its own
//! `comments_queue` message. Articles that exhaust their retries are
//! skipped; the rest still complete.

use super::{decode_params, CollectionOutput, Collector, CollectorDeps};
use crate::config::SchedulerConfig;
use crate::errors::{PipelineError, Result};
use crate::executor::BoundedExecutor;
use crate::fetch::{fetch_offloaded, PageQuery};
use crate::messaging::{Envelope, COMMENTS_QUEUE};
use crate::models::{CollectionType, CommentParams, CommentRecord, CommentStats, CommentsPayload};
use crate::retry::sleep_or_cancel;
use crate::utils::{extract_domain, parse_datetime};
use async_trait::async_trait;
use chrono::{Local, Utc};
use serde_json::Value;
use std::collections::HashSet;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

pub struct CommentCollector {
    executor: BoundedExecutor,
    batch_size: usize,
    paging: SchedulerConfig,
    deps: CollectorDeps,
}

impl CommentCollector {
    pub fn new(executor: BoundedExecutor, paging: SchedulerConfig, deps: CollectorDeps) -> Self {
        Self {
            executor,
            batch_size: 10,
            paging,
            deps,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    #[instrument(level = "info", skip(self, cancel), fields(domain = %extract_domain(&url)))]
    async fn collect_article(&self, url: String, cancel: &CancellationToken) -> Result<CommentsPayload> {
        let endpoint = match &self.deps.pool {
            None => None,
            Some(pool) => Some(pool.acquire().ok_or(PipelineError::NoEndpoint)?),
        };

        let stable_needed = self.paging.stable_polls.max(1);
        let pause = Duration::from_millis(self.paging.scroll_pause_ms);
        let reference = Local::now().naive_local();
        let query = PageQuery::Url {
            url: url.clone(),
            page: 0,
        };
        let mut comments: Vec<CommentRecord> = Vec::new();
        let mut seen = HashSet::new();
        let mut stable = 0usize;

        for page in 0..self.paging.max_polls.max(1) {
            if page > 0 && !pause.is_zero() {
                sleep_or_cancel(pause, cancel).await?;
            }
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }

            let raw = fetch_offloaded(
                &self.deps.offload,
                &self.deps.fetcher,
                self.deps.pool.as_deref(),
                query.with_page(page),
                endpoint.as_deref(),
            )
            .await?;

            let before = comments.len();
            for mut comment in self.deps.parser.parse_comments(&raw) {
                comment.timestamp = comment.timestamp.map(|ts| {
                    parse_datetime(&ts, Some(reference))
                        .map(|dt| dt.format(TIMESTAMP_FORMAT).to_string())
                        .unwrap_or(ts)
                });
                let key = (
                    comment.username.clone(),
                    comment.content.clone(),
                    comment.timestamp.clone(),
                );
                if seen.insert(key) {
                    comments.push(comment);
                }
            }

            if comments.len() == before {
                stable += 1;
                if stable >= stable_needed {
                    break;
                }
            } else {
                stable = 0;
            }
        }

        let stats = CommentStats::from_comments(&comments);
        debug!(
            total = comments.len(),
            deleted = stats.deleted_count,
            authors = stats.unique_authors,
            "Comments collected"
        );
        Ok(CommentsPayload {
            article_url: url,
            kind: "comments".to_string(),
            total_count: comments.len(),
            comments,
            stats,
            collected_at: Utc::now(),
        })
    }
}

#[async_trait]
impl Collector for CommentCollector {
    fn kind(&self) -> CollectionType {
        CollectionType::Comments
    }

    async fn collect(&self, params: &Value, cancel: &CancellationToken) -> Result<CollectionOutput> {
        let params: CommentParams = decode_params(self.kind(), params)?;
        if params.article_urls.is_empty() {
            return Err(PipelineError::InvalidRequest("article_urls is empty".into()));
        }

        let outcome = self
            .executor
            .execute_batch(params.article_urls, self.batch_size, cancel, |url| {
                self.collect_article(url, cancel)
            })
            .await?;
        if outcome.stats.error > 0 {
            warn!(
                failed = outcome.stats.error,
                total = outcome.stats.total,
                "Some articles yielded no comments after retries"
            );
        }

        let mut output = CollectionOutput::default();
        for payload in outcome.results.into_iter().flatten() {
            output.total_collected += payload.total_count;
            output.envelopes.push(Envelope::new(COMMENTS_QUEUE, &payload)?);
        }
        info!(
            articles = output.envelopes.len(),
            comments = output.total_collected,
            "Comment collection finished"
        );
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::schema;
    use crate::offload::BlockingPool;
    use crate::retry::RetryPolicy;
    use crate::testing::{comment_line, fetch_error, LineParser, ScriptedFetcher};
    use serde_json::json;
    use std::sync::Arc;

    fn collector(fetcher: Arc<ScriptedFetcher>) -> CommentCollector {
        CommentCollector::new(
            BoundedExecutor::new(2, 10, RetryPolicy::new(2, Duration::from_millis(1))),
            SchedulerConfig {
                scroll_pause_ms: 0,
                ..SchedulerConfig::default()
            },
            CollectorDeps {
                pool: None,
                offload: Arc::new(BlockingPool::new(2)),
                fetcher,
                parser: Arc::new(LineParser),
                news_api: None,
            },
        )
    }

    /// Page 0 has two comments, page 1 adds a deleted one, later pages repeat.
    fn paged_comments() -> ScriptedFetcher {
        ScriptedFetcher::new(|q, _| match q {
            PageQuery::Url { url, .. } if url.contains("broken") => Err(fetch_error("timeout")),
            PageQuery::Url { page, .. } => {
                let mut lines = vec![comment_line("kim", "first", false), comment_line("lee", "second", false)];
                if *page >= 1 {
                    lines.push(comment_line("kim", "", true));
                }
                Ok(lines.join("\n"))
            }
            PageQuery::Search { .. } => Ok(String::new()),
        })
    }

    #[tokio::test]
    async fn test_one_envelope_per_article_with_stats() {
        let fetcher = Arc::new(paged_comments());
        let params = json!({"article_urls": ["https://n.test/a/1", "https://n.test/a/2"]});
        let out = collector(fetcher.clone())
            .collect(&params, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(out.envelopes.len(), 2);
        assert_eq!(out.total_collected, 6);
        for envelope in &out.envelopes {
            assert_eq!(envelope.queue, COMMENTS_QUEUE);
            schema::validate(COMMENTS_QUEUE, &envelope.payload).unwrap();
            assert_eq!(envelope.payload["type"], "comments");
            assert_eq!(envelope.payload["stats"]["deleted_count"], 1);
            assert_eq!(envelope.payload["stats"]["unique_authors"], 2);
        }
        assert_eq!(out.envelopes[0].payload["article_url"], "https://n.test/a/1");
        // pages 0 and 1 grow, pages 2 and 3 are stable
        assert_eq!(fetcher.calls(), 8);
    }

    #[tokio::test]
    async fn test_failing_article_is_skipped() {
        let fetcher = Arc::new(paged_comments());
        let params = json!({"article_urls": ["https://n.test/broken", "https://n.test/a/2"]});
        let out = collector(fetcher)
            .collect(&params, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.envelopes.len(), 1);
        assert_eq!(out.envelopes[0].payload["article_url"], "https://n.test/a/2");
    }

    #[tokio::test]
    async fn test_empty_url_list_rejected() {
        let err = collector(Arc::new(paged_comments()))
            .collect(&json!({"article_urls": []}), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidRequest(_)));
    }
}
