//! JSON news-search API, the `API` metadata collection method.
//!
//! The API pages by `start` offset in steps of `display` items, newest
//! first, and caps `start` at `max_start`. Titles and descriptions come back
//! with inline markup (`<b>` around matches, HTML entities), which is
//! stripped before the records leave this module.

use crate::config::ApiConfig;
use crate::errors::{PipelineError, Result};
use crate::models::ArticleRecord;
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::utils::extract_domain;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate};
use scraper::Html;
use serde::Deserialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// One page of search results.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ApiPage {
    #[serde(default)]
    pub total: usize,
    #[serde(default)]
    pub items: Vec<ApiItem>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ApiItem {
    pub title: String,
    #[serde(rename = "originallink", default)]
    pub original_link: String,
    pub link: String,
    #[serde(default)]
    pub description: String,
    /// RFC 2822, e.g. `Mon, 02 Jun 2025 10:00:00 +0900`.
    #[serde(rename = "pubDate", default)]
    pub pub_date: String,
}

#[async_trait]
pub trait NewsSearchApi: Send + Sync {
    /// Fetch `display` items starting at the 1-based offset `start`.
    async fn search(&self, keyword: &str, display: usize, start: usize) -> Result<ApiPage>;
}

/// Client for the Naver news-search endpoint.
#[derive(Debug, Clone)]
pub struct NaverNewsApi {
    client: reqwest::Client,
    base_url: String,
    client_id: String,
    client_secret: String,
}

impl NaverNewsApi {
    /// Returns `None` when the credentials are not configured.
    pub fn from_config(config: &ApiConfig) -> Result<Option<Self>> {
        let Some((id, secret)) = config.credentials() else {
            return Ok(None);
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PipelineError::Config(e.to_string()))?;
        Ok(Some(Self {
            client,
            base_url: config.base_url.clone(),
            client_id: id.to_string(),
            client_secret: secret.to_string(),
        }))
    }
}

#[async_trait]
impl NewsSearchApi for NaverNewsApi {
    #[instrument(level = "debug", skip(self))]
    async fn search(&self, keyword: &str, display_count: usize, start: usize) -> Result<ApiPage> {
        let resp = self
            .client
            .get(&self.base_url)
            .query(&[
                ("query", keyword.to_string()),
                ("display", display_count.to_string()),
                ("start", start.to_string()),
                ("sort", "date".to_string()),
            ])
            .header("X-Naver-Client-Id", &self.client_id)
            .header("X-Naver-Client-Secret", &self.client_secret)
            .send()
            .await
            .map_err(|e| PipelineError::Fetch(e.to_string()))?;
        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(PipelineError::Config(format!("news API rejected credentials: HTTP {status}")));
        }
        if !status.is_success() {
            return Err(PipelineError::Fetch(format!("news API: HTTP {status}")));
        }
        let body = resp
            .text()
            .await
            .map_err(|e| PipelineError::Fetch(e.to_string()))?;
        serde_json::from_str(&body).map_err(|e| PipelineError::Decode(format!("news API page: {e}")))
    }
}

/// Text content of an HTML fragment, entities decoded.
fn strip_markup(s: &str) -> String {
    let fragment = Html::parse_fragment(s);
    let text: String = fragment.root_element().text().collect();
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn publication_day(pub_date: &str) -> Option<NaiveDate> {
    DateTime::parse_from_rfc2822(pub_date.trim())
        .ok()
        .map(|dt| dt.date_naive())
}

impl ApiItem {
    pub fn into_record(self) -> ArticleRecord {
        let original = (!self.original_link.is_empty()).then_some(self.original_link);
        let publisher = original
            .as_deref()
            .map(extract_domain)
            .map(|d| d.trim_start_matches("www.").to_string())
            .filter(|d| !d.is_empty());
        ArticleRecord {
            title: strip_markup(&self.title),
            link: self.link,
            original_link: original,
            publisher,
            description: Some(strip_markup(&self.description)).filter(|d| !d.is_empty()),
            published_date: publication_day(&self.pub_date),
            is_test: false,
            is_api_collection: false,
        }
    }
}

/// Page through `api` until `max_articles` records within `[start, end]`
/// are gathered, a short page ends the results, or `max_start` is reached.
///
/// Results are newest first, so paging stops once a page ends before
/// `start`. Records without a publication date are kept.
#[instrument(level = "info", skip(api, config, retry, cancel))]
pub async fn collect_from_api(
    api: &dyn NewsSearchApi,
    config: &ApiConfig,
    retry: &RetryPolicy,
    keyword: &str,
    start: NaiveDate,
    end: NaiveDate,
    max_articles: usize,
    cancel: &CancellationToken,
) -> Result<Vec<ArticleRecord>> {
    let display = config.display.max(1);
    let mut articles = Vec::new();
    let mut offset = 1;

    while offset <= config.max_start {
        let page = retry_with_backoff(retry, cancel, "news-api", |_| api.search(keyword, display, offset)).await?;
        let fetched = page.items.len();
        debug!(offset, fetched, total = page.total, "News API page");

        let mut past_range = false;
        for item in page.items {
            let record = item.into_record();
            match record.published_date {
                Some(day) if day > end => continue,
                Some(day) if day < start => {
                    past_range = true;
                    continue;
                }
                _ => articles.push(record),
            }
            if articles.len() >= max_articles {
                info!(collected = articles.len(), "News API cap reached");
                return Ok(articles);
            }
        }

        if fetched < display || past_range {
            break;
        }
        offset += display;
    }

    if offset > config.max_start {
        warn!(max_start = config.max_start, "News API offset limit reached");
    }
    info!(collected = articles.len(), "News API collection finished");
    Ok(articles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Serves `total` items, one per hour going back from 2025-06-10 23:00.
    struct CannedApi {
        total: usize,
        calls: Mutex<Vec<(usize, usize)>>,
        fail_first: Mutex<usize>,
    }

    impl CannedApi {
        fn new(total: usize) -> Self {
            Self {
                total,
                calls: Mutex::new(Vec::new()),
                fail_first: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl NewsSearchApi for CannedApi {
        async fn search(&self, _keyword: &str, display: usize, start: usize) -> Result<ApiPage> {
            self.calls.lock().unwrap().push((display, start));
            {
                let mut fail = self.fail_first.lock().unwrap();
                if *fail > 0 {
                    *fail -= 1;
                    return Err(PipelineError::Fetch("HTTP 500".into()));
                }
            }
            let base = DateTime::parse_from_rfc3339("2025-06-10T23:00:00+09:00").unwrap();
            let items = (start - 1..(start - 1 + display).min(self.total))
                .map(|i| {
                    let at = base - chrono::Duration::hours(i as i64);
                    ApiItem {
                        title: format!("<b>Rust</b> &amp; news {i}"),
                        original_link: format!("https://www.press.test/a/{i}"),
                        link: format!("https://n.news.naver.com/a/{i}"),
                        description: "about <b>Rust</b>".to_string(),
                        pub_date: at.to_rfc2822(),
                    }
                })
                .collect();
            Ok(ApiPage {
                total: self.total,
                items,
            })
        }
    }

    fn config(display: usize) -> ApiConfig {
        ApiConfig {
            display,
            ..ApiConfig::default()
        }
    }

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn retry() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1))
    }

    #[test]
    fn test_item_markup_stripped() {
        let item = ApiItem {
            title: "<b>Rust</b> &quot;2025&quot;".to_string(),
            original_link: String::new(),
            link: "https://n.news.naver.com/a/1".to_string(),
            description: String::new(),
            pub_date: "Tue, 10 Jun 2025 09:30:00 +0900".to_string(),
        };
        let record = item.into_record();
        assert_eq!(record.title, "Rust \"2025\"");
        assert_eq!(record.original_link, None);
        assert_eq!(record.description, None);
        assert_eq!(record.published_date, Some(day("2025-06-10")));
    }

    #[tokio::test]
    async fn test_pages_until_cap() {
        let api = CannedApi::new(500);
        let out = collect_from_api(
            &api,
            &config(10),
            &retry(),
            "rust",
            day("2025-06-01"),
            day("2025-06-10"),
            25,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(out.len(), 25);
        assert_eq!(*api.calls.lock().unwrap(), vec![(10, 1), (10, 11), (10, 21)]);
        assert_eq!(out[0].publisher.as_deref(), Some("press.test"));
        assert_eq!(out[0].title, "Rust & news 0");
    }

    #[tokio::test]
    async fn test_short_page_ends_collection() {
        let api = CannedApi::new(15);
        let out = collect_from_api(
            &api,
            &config(10),
            &retry(),
            "rust",
            day("2025-06-01"),
            day("2025-06-10"),
            100,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(out.len(), 15);
        assert_eq!(api.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_stops_once_results_predate_range() {
        // 24 items per day: offsets past 24 are before 2025-06-10
        let api = CannedApi::new(500);
        let out = collect_from_api(
            &api,
            &config(10),
            &retry(),
            "rust",
            day("2025-06-10"),
            day("2025-06-10"),
            100,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(out.len(), 24);
        assert!(out.iter().all(|a| a.published_date == Some(day("2025-06-10"))));
        assert_eq!(api.calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_transient_page_error_retried() {
        let api = CannedApi::new(5);
        *api.fail_first.lock().unwrap() = 1;
        let out = collect_from_api(
            &api,
            &config(10),
            &retry(),
            "rust",
            day("2025-06-01"),
            day("2025-06-10"),
            100,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(out.len(), 5);
        assert_eq!(api.calls.lock().unwrap().len(), 2);
    }
}
