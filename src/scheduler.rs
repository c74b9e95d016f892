//! Adaptive time-sharded crawl scheduler.
//!
//! A keyword search over `[start, end]` is collected one of two ways:
//!
//! - **Recent**: the range ends inside the recency window, so listings only
//!   show relative dates and the range is split into one [`WorkItem`] per
//!   calendar day, newest first. Each day is fetched and retried on its own;
//!   a semaphore caps how many days hold an endpoint and a fetch slot at once.
//! - **Historical**: the whole range is older than the cutoff and is fetched
//!   in one incremental-paging pass that stops once the item count stops
//!   growing or the cap is reached.
//!
//! Results are merged, sorted newest first (stable, undated last) and cut to
//! the cap. Duplicates are left for the storage sink to fold.
//!
//! [`WorkItem`]: crate::models::WorkItem

use crate::config::SchedulerConfig;
use crate::errors::{PipelineError, Result};
use crate::executor::BoundedExecutor;
use crate::fetch::{fetch_offloaded, Fetcher, PageQuery};
use crate::models::ArticleRecord;
use crate::offload::BlockingPool;
use crate::parser::Parser;
use crate::pool::ResourcePool;
use crate::retry::{sleep_or_cancel, RetryPolicy};
use crate::utils::days_descending;
use chrono::{Duration as ChronoDuration, Local, NaiveDate};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Recent,
    Historical,
}

/// How a range will be collected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardPlan {
    pub strategy: Strategy,
    /// Day shards, newest first. Empty for [`Strategy::Historical`].
    pub days: Vec<NaiveDate>,
    pub cutoff: NaiveDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shard {
    Day(NaiveDate),
    Range(NaiveDate, NaiveDate),
}

pub struct ShardScheduler {
    config: SchedulerConfig,
    executor: BoundedExecutor,
    pool: Option<Arc<ResourcePool>>,
    offload: Arc<BlockingPool>,
    fetcher: Arc<dyn Fetcher>,
    parser: Arc<dyn Parser>,
    day_permits: Arc<Semaphore>,
}

impl std::fmt::Debug for ShardScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardScheduler")
            .field("config", &self.config)
            .field("executor", &self.executor)
            .field("pooled", &self.pool.is_some())
            .finish()
    }
}

impl ShardScheduler {
    pub fn new(
        config: SchedulerConfig,
        executor: BoundedExecutor,
        pool: Option<Arc<ResourcePool>>,
        offload: Arc<BlockingPool>,
        fetcher: Arc<dyn Fetcher>,
        parser: Arc<dyn Parser>,
    ) -> Self {
        let day_permits = Arc::new(Semaphore::new(config.day_concurrency.max(1)));
        Self {
            config,
            executor,
            pool,
            offload,
            fetcher,
            parser,
            day_permits,
        }
    }

    pub fn recency_cutoff(&self, today: NaiveDate) -> NaiveDate {
        today - ChronoDuration::weeks(self.config.recency_weeks)
    }

    pub fn plan(&self, start: NaiveDate, end: NaiveDate, today: NaiveDate) -> Result<ShardPlan> {
        if end < start {
            return Err(PipelineError::InvalidRequest(format!(
                "end date {end} is before start date {start}"
            )));
        }
        let cutoff = self.recency_cutoff(today);
        let plan = if end >= cutoff {
            ShardPlan {
                strategy: Strategy::Recent,
                days: days_descending(start, end),
                cutoff,
            }
        } else {
            ShardPlan {
                strategy: Strategy::Historical,
                days: Vec::new(),
                cutoff,
            }
        };
        Ok(plan)
    }

    /// Collect up to `cap` articles for `keyword` published in `[start, end]`.
    pub async fn collect(
        &self,
        keyword: &str,
        start: NaiveDate,
        end: NaiveDate,
        cap: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<ArticleRecord>> {
        self.collect_at(keyword, start, end, cap, Local::now().date_naive(), cancel)
            .await
    }

    /// [`collect`](Self::collect) with an explicit "today".
    #[instrument(level = "info", skip(self, cancel), fields(strategy = tracing::field::Empty))]
    pub async fn collect_at(
        &self,
        keyword: &str,
        start: NaiveDate,
        end: NaiveDate,
        cap: usize,
        today: NaiveDate,
        cancel: &CancellationToken,
    ) -> Result<Vec<ArticleRecord>> {
        if keyword.trim().is_empty() {
            return Err(PipelineError::InvalidRequest("keyword is required".into()));
        }
        let plan = self.plan(start, end, today)?;
        tracing::Span::current().record("strategy", tracing::field::debug(plan.strategy));

        let shards: Vec<Shard> = match plan.strategy {
            Strategy::Recent => plan.days.iter().copied().map(Shard::Day).collect(),
            Strategy::Historical => vec![Shard::Range(start, end)],
        };
        info!(
            shards = shards.len(),
            cutoff = %plan.cutoff,
            cap,
            "Planned collection"
        );

        let executor = self.executor.with_retry(RetryPolicy::new(
            self.config.day_retries,
            Duration::from_millis(self.config.day_retry_delay_ms),
        ));
        let results = executor
            .execute_parallel(shards, cancel, |shard| self.run_shard(keyword, shard, cap, cancel))
            .await?;

        let failed = results.iter().filter(|r| r.is_none()).count();
        if failed > 0 {
            warn!(failed, "Some shards produced no results after retries");
        }
        let merged = merge_results(results, cap);
        info!(collected = merged.len(), "Collection finished");
        Ok(merged)
    }

    async fn run_shard(
        &self,
        keyword: &str,
        shard: Shard,
        cap: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<ArticleRecord>> {
        let _permit = tokio::select! {
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
            permit = self.day_permits.acquire() => permit.map_err(|_| PipelineError::Cancelled)?,
        };

        let endpoint = self.acquire_endpoint()?;
        let (query, fallback) = match shard {
            Shard::Day(day) => (
                PageQuery::Search {
                    keyword: keyword.to_string(),
                    start: day,
                    end: day,
                    page: 0,
                },
                Some(day),
            ),
            Shard::Range(start, end) => (
                PageQuery::Search {
                    keyword: keyword.to_string(),
                    start,
                    end,
                    page: 0,
                },
                None,
            ),
        };
        let articles = self
            .scroll(query, fallback, endpoint.as_deref(), cap, cancel)
            .await?;
        debug!(?shard, count = articles.len(), "Shard collected");
        Ok(articles)
    }

    fn acquire_endpoint(&self) -> Result<Option<String>> {
        match &self.pool {
            None => Ok(None),
            Some(pool) => pool.acquire().map(Some).ok_or(PipelineError::NoEndpoint),
        }
    }

    /// Page through `query` until no new items appear for `stable_polls`
    /// consecutive polls, `cap` items are loaded, or `max_polls` is hit.
    async fn scroll(
        &self,
        query: PageQuery,
        fallback: Option<NaiveDate>,
        endpoint: Option<&str>,
        cap: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<ArticleRecord>> {
        let stable_needed = self.config.stable_polls.max(1);
        let pause = Duration::from_millis(self.config.scroll_pause_ms);
        let mut collected: Vec<ArticleRecord> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut stable = 0usize;

        for page in 0..self.config.max_polls.max(1) {
            if collected.len() >= cap {
                debug!(cap, "Cap reached while paging");
                break;
            }
            if page > 0 && !pause.is_zero() {
                sleep_or_cancel(pause, cancel).await?;
            }
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }

            let raw = self.fetch(query.with_page(page), endpoint).await?;
            let before = collected.len();
            for article in self.parser.parse_articles(&raw, fallback) {
                if seen.insert(article.link.clone()) {
                    collected.push(article);
                }
            }

            if collected.len() == before {
                stable += 1;
                if stable >= stable_needed {
                    debug!(page, loaded = collected.len(), "Item count stabilised");
                    break;
                }
            } else {
                stable = 0;
            }
        }
        Ok(collected)
    }

    async fn fetch(&self, query: PageQuery, endpoint: Option<&str>) -> Result<String> {
        fetch_offloaded(&self.offload, &self.fetcher, self.pool.as_deref(), query, endpoint).await
    }
}

/// Flatten per-shard results, sort newest first and truncate to `cap`.
///
/// The sort is stable, so equal dates keep collection order. Undated
/// records sort after dated ones.
pub fn merge_results(results: Vec<Option<Vec<ArticleRecord>>>, cap: usize) -> Vec<ArticleRecord> {
    let mut merged: Vec<ArticleRecord> = results.into_iter().flatten().flatten().collect();
    merged.sort_by(|a, b| match (a.published_date, b.published_date) {
        (Some(x), Some(y)) => y.cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
    merged.truncate(cap);
    merged
}
