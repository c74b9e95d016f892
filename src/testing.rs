//! Test doubles shared by module tests.

use crate::errors::{PipelineError, Result};
use crate::fetch::{Fetcher, PageQuery};
use crate::models::{ArticleRecord, CommentRecord};
use crate::parser::Parser;
use chrono::NaiveDate;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

type Script = Box<dyn Fn(&PageQuery, Option<&str>) -> Result<String> + Send + Sync>;

/// Fetcher driven by a closure; records calls and peak parallelism.
pub struct ScriptedFetcher {
    script: Script,
    delay: Duration,
    pub calls: AtomicUsize,
    in_flight: AtomicUsize,
    pub peak: AtomicUsize,
    pub seen: Mutex<Vec<(PageQuery, Option<String>)>>,
}

impl ScriptedFetcher {
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(&PageQuery, Option<&str>) -> Result<String> + Send + Sync + 'static,
    {
        Self {
            script: Box::new(script),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Every search page returns `per_day` articles dated on the query's
    /// end day; later pages repeat the first so the scroll stabilises.
    pub fn daily(per_day: usize) -> Self {
        Self::new(move |query, _| match query {
            PageQuery::Search { keyword, end, .. } => Ok((0..per_day)
                .map(|i| article_line(&format!("{keyword} {end} #{i}"), &format!("https://news.test/{end}/{i}"), Some(*end)))
                .collect::<Vec<_>>()
                .join("\n")),
            PageQuery::Url { .. } => Ok(String::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn queries(&self) -> Vec<PageQuery> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .map(|(q, _)| q.clone())
            .collect()
    }
}

impl Fetcher for ScriptedFetcher {
    fn fetch_page(&self, query: &PageQuery, endpoint: Option<&str>) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen
            .lock()
            .unwrap()
            .push((query.clone(), endpoint.map(str::to_string)));
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        let out = (self.script)(query, endpoint);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        out
    }
}

pub fn article_line(title: &str, link: &str, date: Option<NaiveDate>) -> String {
    let date = date.map(|d| d.to_string()).unwrap_or_default();
    format!("{title}|{link}|{date}")
}

pub fn comment_line(user: &str, content: &str, deleted: bool) -> String {
    format!("{user}|{content}|{deleted}")
}

/// Parses `title|link|YYYY-MM-DD` article lines and `user|content|deleted`
/// comment lines.
pub struct LineParser;

impl Parser for LineParser {
    fn parse_articles(&self, raw: &str, fallback_date: Option<NaiveDate>) -> Vec<ArticleRecord> {
        raw.lines()
            .filter_map(|line| {
                let mut parts = line.split('|');
                let title = parts.next()?.to_string();
                let link = parts.next()?.to_string();
                let date = parts
                    .next()
                    .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
                    .or(fallback_date);
                Some(ArticleRecord {
                    title,
                    link: link.clone(),
                    original_link: Some(link),
                    publisher: None,
                    description: None,
                    published_date: date,
                    is_test: false,
                    is_api_collection: false,
                })
            })
            .collect()
    }

    fn parse_comments(&self, raw: &str) -> Vec<CommentRecord> {
        raw.lines()
            .filter_map(|line| {
                let mut parts = line.split('|');
                Some(CommentRecord {
                    username: parts.next()?.to_string(),
                    content: parts.next()?.to_string(),
                    timestamp: None,
                    likes: 0,
                    dislikes: 0,
                    is_deleted: parts.next() == Some("true"),
                })
            })
            .collect()
    }
}

pub fn fetch_error(msg: &str) -> PipelineError {
    PipelineError::Fetch(msg.to_string())
}
