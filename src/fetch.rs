//! Page fetching collaborator.
//!
//! A [`Fetcher`] turns a [`PageQuery`] into raw page content. Implementations
//! are allowed to block, so callers always run them through the
//! [`BlockingPool`](crate::offload::BlockingPool).
//!
//! [`HttpFetcher`] is the default: it builds search URLs from a configurable
//! template and fetches them with a blocking `reqwest` client, routed through
//! the egress endpoint (as an HTTP proxy) when one is supplied.

use crate::config::FetchConfig;
use crate::errors::{PipelineError, Result};
use crate::offload::BlockingPool;
use crate::pool::ResourcePool;
use chrono::NaiveDate;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument};
use url::Url;

/// What to fetch. `page` is 0-based; each further page loads more items.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PageQuery {
    /// Keyword search restricted to a publication date range.
    Search {
        keyword: String,
        start: NaiveDate,
        end: NaiveDate,
        page: usize,
    },
    /// A known URL, e.g. an article's comment view.
    Url { url: String, page: usize },
}

impl PageQuery {
    pub fn page(&self) -> usize {
        match self {
            PageQuery::Search { page, .. } | PageQuery::Url { page, .. } => *page,
        }
    }

    /// The same query, one page further.
    pub fn with_page(&self, page: usize) -> Self {
        let mut next = self.clone();
        match &mut next {
            PageQuery::Search { page: p, .. } | PageQuery::Url { page: p, .. } => *p = page,
        }
        next
    }
}

/// Blocking page source.
pub trait Fetcher: Send + Sync {
    fn fetch_page(&self, query: &PageQuery, endpoint: Option<&str>) -> Result<String>;
}

/// Run `fetcher` on the offload pool and report the outcome for `endpoint`
/// to `pool`.
///
/// Only transport errors count against the endpoint. A malformed URL or a
/// bad template says nothing about the egress route and leaves its counters
/// alone.
pub async fn fetch_offloaded(
    offload: &BlockingPool,
    fetcher: &Arc<dyn Fetcher>,
    pool: Option<&ResourcePool>,
    query: PageQuery,
    endpoint: Option<&str>,
) -> Result<String> {
    let fetcher = Arc::clone(fetcher);
    let owned_endpoint = endpoint.map(str::to_string);
    let t0 = Instant::now();
    let result = offload
        .run(move || fetcher.fetch_page(&query, owned_endpoint.as_deref()))
        .await
        .and_then(|r| r);

    if let (Some(pool), Some(address)) = (pool, endpoint) {
        match &result {
            Ok(_) => pool.report_success(address, t0.elapsed()),
            Err(e @ PipelineError::Fetch(_)) => {
                pool.report_failure(address, &e.to_string());
            }
            Err(e) => debug!(%address, error = %e, "Fetch failed before reaching the endpoint"),
        }
    }
    result
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    config: FetchConfig,
}

impl HttpFetcher {
    pub fn new(config: FetchConfig) -> Self {
        Self { config }
    }

    /// Resolve a query to the URL that will be requested.
    pub fn build_url(&self, query: &PageQuery) -> Result<String> {
        match query {
            PageQuery::Search {
                keyword,
                start,
                end,
                page,
            } => {
                let offset = page * self.config.page_size.max(1) + 1;
                let raw = self
                    .config
                    .search_url
                    .replace("{query}", &urlencoding::encode(keyword))
                    .replace("{start}", &start.format("%Y.%m.%d").to_string())
                    .replace("{end}", &end.format("%Y.%m.%d").to_string())
                    .replace("{offset}", &offset.to_string());
                let url = Url::parse(&raw).map_err(|e| PipelineError::Config(e.to_string()))?;
                Ok(url.to_string())
            }
            PageQuery::Url { url, page } => {
                let mut url = Url::parse(url)
                    .map_err(|e| PipelineError::InvalidRequest(format!("bad url {url}: {e}")))?;
                if *page > 0 {
                    url.query_pairs_mut().append_pair("page", &(page + 1).to_string());
                }
                Ok(url.to_string())
            }
        }
    }
}

impl Fetcher for HttpFetcher {
    #[instrument(level = "debug", skip(self))]
    fn fetch_page(&self, query: &PageQuery, endpoint: Option<&str>) -> Result<String> {
        let url = self.build_url(query)?;

        let mut builder = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .user_agent(self.config.user_agent.clone());
        if let Some(endpoint) = endpoint {
            let proxy =
                reqwest::Proxy::all(endpoint).map_err(|e| PipelineError::Config(e.to_string()))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|e| PipelineError::Fetch(e.to_string()))?;

        let resp = client
            .get(&url)
            .send()
            .map_err(|e| PipelineError::Fetch(format!("{url}: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(PipelineError::Fetch(format!("{url}: HTTP {status}")));
        }
        let body = resp
            .text()
            .map_err(|e| PipelineError::Fetch(format!("{url}: {e}")))?;
        debug!(%url, bytes = body.len(), "Fetched page");
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::Probe;
    use crate::testing::{fetch_error, ScriptedFetcher};
    use async_trait::async_trait;

    struct DownProbe;

    #[async_trait]
    impl Probe for DownProbe {
        async fn probe(&self, _address: &str) -> Result<Duration> {
            Err(PipelineError::Fetch("down".into()))
        }
    }

    fn one_proxy_pool() -> ResourcePool {
        ResourcePool::new(["http://p1:8080"], 3, Duration::from_secs(60), Arc::new(DownProbe))
    }

    fn fetcher() -> HttpFetcher {
        HttpFetcher::new(FetchConfig {
            search_url: "https://search.example.com/news?q={query}&ds={start}&de={end}&start={offset}"
                .to_string(),
            page_size: 10,
            ..FetchConfig::default()
        })
    }

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_search_url_substitution() {
        let q = PageQuery::Search {
            keyword: "electric cars".to_string(),
            start: day("2025-05-01"),
            end: day("2025-05-03"),
            page: 2,
        };
        let url = fetcher().build_url(&q).unwrap();
        assert_eq!(
            url,
            "https://search.example.com/news?q=electric%20cars&ds=2025.05.01&de=2025.05.03&start=21"
        );
    }

    #[test]
    fn test_url_query_pagination() {
        let q = PageQuery::Url {
            url: "https://news.example.com/article/1?view=comments".to_string(),
            page: 0,
        };
        assert_eq!(
            fetcher().build_url(&q).unwrap(),
            "https://news.example.com/article/1?view=comments"
        );
        let url = fetcher().build_url(&q.with_page(1)).unwrap();
        assert!(url.ends_with("view=comments&page=2"));
    }

    #[test]
    fn test_bad_url_is_invalid_request() {
        let q = PageQuery::Url {
            url: "not a url".to_string(),
            page: 0,
        };
        assert!(matches!(
            fetcher().build_url(&q),
            Err(PipelineError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_bad_urls_leave_proxy_active() {
        let pool = one_proxy_pool();
        let offload = BlockingPool::new(1);
        let fetcher: Arc<dyn Fetcher> = Arc::new(fetcher());
        for _ in 0..3 {
            let q = PageQuery::Url {
                url: "not a url".to_string(),
                page: 0,
            };
            let res = fetch_offloaded(&offload, &fetcher, Some(&pool), q, Some("http://p1:8080")).await;
            assert!(matches!(res, Err(PipelineError::InvalidRequest(_))));
        }

        assert_eq!(pool.acquire().as_deref(), Some("http://p1:8080"));
        let stats = pool.stats();
        assert_eq!(stats.endpoints[0].failures, 0);
    }

    #[tokio::test]
    async fn test_transport_errors_deactivate_proxy() {
        let pool = one_proxy_pool();
        let offload = BlockingPool::new(1);
        let fetcher: Arc<dyn Fetcher> = Arc::new(ScriptedFetcher::new(|_, _| Err(fetch_error("reset"))));
        for page in 0..3 {
            let q = PageQuery::Url {
                url: "https://n.test/a".to_string(),
                page,
            };
            let res = fetch_offloaded(&offload, &fetcher, Some(&pool), q, Some("http://p1:8080")).await;
            assert!(res.is_err());
        }
        assert_eq!(pool.acquire(), None);
    }
}
