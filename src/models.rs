//! Data models shared across the collection and storage sides.
//!
//! This module defines the records that move through the pipeline:
//! - [`ArticleRecord`] / [`CommentRecord`]: parsed output of a fetched page
//! - [`WorkItem`]: one independently retryable unit of collection work
//! - [`CollectionRequest`]: a caller's request and its lifecycle status
//! - Queue payloads: [`MetadataPayload`], [`CommentsPayload`],
//!   [`CollectorRequestPayload`], [`StatusPayload`]
//!
//! Field names match the JSON bodies carried on the durable queues, so the
//! payload structs serialise straight into broker messages.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A single article as extracted from a search listing page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArticleRecord {
    pub title: String,
    /// Canonical link; the storage sink uses it as the natural key.
    pub link: String,
    #[serde(default)]
    pub original_link: Option<String>,
    #[serde(default)]
    pub publisher: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Publication day. Day-sharded collection falls back to the shard date.
    #[serde(default)]
    pub published_date: Option<NaiveDate>,
    #[serde(default)]
    pub is_test: bool,
    #[serde(default)]
    pub is_api_collection: bool,
}

/// A single reader comment attached to an article.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommentRecord {
    pub username: String,
    pub content: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub likes: u32,
    #[serde(default)]
    pub dislikes: u32,
    #[serde(default)]
    pub is_deleted: bool,
}

/// Aggregate figures reported alongside a batch of comments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommentStats {
    pub current_count: usize,
    pub deleted_count: usize,
    pub unique_authors: usize,
}

impl CommentStats {
    pub fn from_comments(comments: &[CommentRecord]) -> Self {
        use itertools::Itertools;
        let deleted_count = comments.iter().filter(|c| c.is_deleted).count();
        Self {
            current_count: comments.len() - deleted_count,
            deleted_count,
            unique_authors: comments.iter().map(|c| &c.username).unique().count(),
        }
    }
}

/// One schedulable, independently retryable unit of work.
///
/// Created by the scheduler when it partitions a request; only the executor
/// mutates `attempts` and `last_error`.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem<K> {
    pub key: K,
    pub attempts: usize,
    pub max_attempts: usize,
    pub last_error: Option<String>,
}

impl<K> WorkItem<K> {
    pub fn new(key: K, max_attempts: usize) -> Self {
        Self {
            key,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            last_error: None,
        }
    }

    pub fn exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

/// Which collector a request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionType {
    Metadata,
    Comments,
}

impl fmt::Display for CollectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectionType::Metadata => write!(f, "metadata"),
            CollectionType::Comments => write!(f, "comments"),
        }
    }
}

/// Lifecycle of a [`CollectionRequest`].
///
/// Transitions are monotonic: `PENDING -> RUNNING -> {COMPLETED, FAILED}`.
/// A terminal status may also arrive straight on a `PENDING` record, when the
/// `RUNNING` report was lost or the request never reached a worker; the
/// orchestrator then stamps `started_at` with the terminal time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RequestStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RequestStatus::Completed | RequestStatus::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            RequestStatus::Pending => 0,
            RequestStatus::Running => 1,
            RequestStatus::Completed | RequestStatus::Failed => 2,
        }
    }

    /// Whether moving from `self` to `next` respects the state machine.
    pub fn can_transition_to(self, next: RequestStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RequestStatus::Pending => "PENDING",
            RequestStatus::Running => "RUNNING",
            RequestStatus::Completed => "COMPLETED",
            RequestStatus::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Where article metadata comes from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CollectionMethod {
    /// Scrape search result pages, sharded by day.
    #[default]
    Search,
    /// Page through a JSON news-search API.
    Api,
}

impl fmt::Display for CollectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectionMethod::Search => f.write_str("SEARCH"),
            CollectionMethod::Api => f.write_str("API"),
        }
    }
}

/// Parameters of a metadata (article listing) collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataParams {
    pub keyword: String,
    #[serde(default)]
    pub method: CollectionMethod,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    #[serde(default = "default_max_articles")]
    pub max_articles: usize,
    #[serde(default)]
    pub is_test: bool,
}

fn default_max_articles() -> usize {
    100
}

/// Parameters of a comment collection over known article URLs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommentParams {
    pub article_urls: Vec<String>,
    #[serde(default)]
    pub is_test: bool,
}

/// Request-scoped status record owned by the orchestrator's store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionRequest {
    pub request_id: String,
    #[serde(rename = "type")]
    pub kind: CollectionType,
    pub params: serde_json::Value,
    pub status: RequestStatus,
    pub progress: u8,
    pub total_collected: Option<usize>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Summary block of a `metadata_queue` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataSummary {
    pub method: CollectionMethod,
    pub total_collected: usize,
    pub keyword: String,
    pub is_test: bool,
    pub is_api_collection: bool,
}

/// Body of a `metadata_queue` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataPayload {
    pub articles: Vec<ArticleRecord>,
    pub collected_at: DateTime<Utc>,
    pub metadata: MetadataSummary,
}

/// Body of a `comments_queue` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommentsPayload {
    pub article_url: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub comments: Vec<CommentRecord>,
    pub stats: CommentStats,
    pub total_count: usize,
    pub collected_at: DateTime<Utc>,
}

/// Body of a `collector_requests_queue` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectorRequestPayload {
    pub request_id: String,
    #[serde(rename = "type")]
    pub kind: CollectionType,
    pub params: serde_json::Value,
    pub queued_at: DateTime<Utc>,
}

/// Body of a `collection_status_queue` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusPayload {
    pub collection_id: String,
    pub status: RequestStatus,
    pub progress: u8,
    #[serde(default)]
    pub total_collected: Option<usize>,
    #[serde(default)]
    pub error: Option<String>,
}
