//! Storage side of the pipeline.
//!
//! A [`StorageSink`] persists articles and comments idempotently: articles
//! are keyed by link, comments by (author, content, timestamp) within an
//! article. The sink, not the pipeline, folds duplicates.
//!
//! [`JsonFileSink`] keeps everything under one directory:
//!
//! ```text
//! output_dir/
//! ├── articles.json        link -> stored article (with numeric id)
//! └── comments/
//!     ├── 1.json           comments for article 1
//!     └── 2.json
//! ```
//!
//! [`MetadataStoreHandler`] and [`CommentsStoreHandler`] consume the result
//! queues and write through a sink. Their retries come from the subscriber.

use crate::errors::{PipelineError, Result};
use crate::messaging::{MessageHandler, COMMENTS_QUEUE, METADATA_QUEUE};
use crate::models::{ArticleRecord, CommentRecord, CommentsPayload, MetadataPayload};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

#[async_trait]
pub trait StorageSink: Send + Sync {
    /// Insert or update an article by link; returns its id.
    async fn upsert_article(&self, article: &ArticleRecord) -> Result<u64>;

    /// Upsert a whole batch in one write; ids come back in input order.
    async fn upsert_articles(&self, articles: &[ArticleRecord]) -> Result<Vec<u64>>;

    async fn find_article(&self, link: &str) -> Result<Option<u64>>;

    /// Merge comments into an article's set; returns how many were new.
    async fn upsert_comments(&self, article_id: u64, comments: &[CommentRecord]) -> Result<usize>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredArticle {
    pub id: u64,
    #[serde(flatten)]
    pub article: ArticleRecord,
    pub first_seen: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ArticleIndex {
    next_id: u64,
    articles: BTreeMap<String, StoredArticle>,
}

impl ArticleIndex {
    fn upsert(&mut self, article: &ArticleRecord) -> u64 {
        let now = Utc::now();
        if let Some(existing) = self.articles.get_mut(&article.link) {
            // Keep an earlier stub's id but take the fuller record.
            existing.article = merge_article(&existing.article, article);
            existing.updated_at = now;
            return existing.id;
        }
        self.next_id += 1;
        let id = self.next_id;
        self.articles.insert(
            article.link.clone(),
            StoredArticle {
                id,
                article: article.clone(),
                first_seen: now,
                updated_at: now,
            },
        );
        id
    }
}

fn merge_article(old: &ArticleRecord, new: &ArticleRecord) -> ArticleRecord {
    ArticleRecord {
        title: if new.title.is_empty() {
            old.title.clone()
        } else {
            new.title.clone()
        },
        link: new.link.clone(),
        original_link: new.original_link.clone().or_else(|| old.original_link.clone()),
        publisher: new.publisher.clone().or_else(|| old.publisher.clone()),
        description: new.description.clone().or_else(|| old.description.clone()),
        published_date: new.published_date.or(old.published_date),
        is_test: new.is_test,
        is_api_collection: new.is_api_collection,
    }
}

type CommentKey = (String, String, Option<String>);

fn comment_key(c: &CommentRecord) -> CommentKey {
    (c.username.clone(), c.content.clone(), c.timestamp.clone())
}

/// Merge `incoming` into `existing` in place; returns the number added.
fn merge_comments(existing: &mut Vec<CommentRecord>, incoming: &[CommentRecord]) -> usize {
    let mut seen: HashSet<CommentKey> = existing.iter().map(comment_key).collect();
    let mut added = 0;
    for comment in incoming {
        if seen.insert(comment_key(comment)) {
            existing.push(comment.clone());
            added += 1;
        }
    }
    added
}

/// Directory-backed sink writing JSON documents.
#[derive(Debug)]
pub struct JsonFileSink {
    root: PathBuf,
    lock: Mutex<()>,
    index_writes: AtomicUsize,
}

impl JsonFileSink {
    /// Open (creating if needed) a sink rooted at `dir`.
    #[instrument(level = "info")]
    pub async fn open(dir: &str) -> Result<Self> {
        let root = PathBuf::from(dir);
        fs::create_dir_all(root.join("comments")).await?;
        info!(path = %root.display(), "Opened JSON storage");
        Ok(Self {
            root,
            lock: Mutex::new(()),
            index_writes: AtomicUsize::new(0),
        })
    }

    /// Times `articles.json` has been rewritten since opening.
    pub fn index_writes(&self) -> usize {
        self.index_writes.load(Ordering::Relaxed)
    }

    async fn write_index(&self, index: &ArticleIndex) -> Result<()> {
        Self::write_json(&self.index_path(), index).await?;
        let writes = self.index_writes.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(writes, articles = index.articles.len(), "Wrote article index");
        Ok(())
    }

    fn index_path(&self) -> PathBuf {
        self.root.join("articles.json")
    }

    fn comments_path(&self, article_id: u64) -> PathBuf {
        self.root.join("comments").join(format!("{article_id}.json"))
    }

    async fn read_json<T: for<'de> Deserialize<'de> + Default>(path: &Path) -> Result<T> {
        match fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| PipelineError::Storage(format!("{}: {e}", path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Write via a temporary file and rename so readers never see a torn file.
    async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
        let json = serde_json::to_vec_pretty(value)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }

    pub async fn articles(&self) -> Result<Vec<StoredArticle>> {
        let _guard = self.lock.lock().await;
        let index: ArticleIndex = Self::read_json(&self.index_path()).await?;
        Ok(index.articles.into_values().collect())
    }

    pub async fn comments(&self, article_id: u64) -> Result<Vec<CommentRecord>> {
        let _guard = self.lock.lock().await;
        Self::read_json(&self.comments_path(article_id)).await
    }
}

#[async_trait]
impl StorageSink for JsonFileSink {
    async fn upsert_article(&self, article: &ArticleRecord) -> Result<u64> {
        let _guard = self.lock.lock().await;
        let mut index: ArticleIndex = Self::read_json(&self.index_path()).await?;
        let id = index.upsert(article);
        self.write_index(&index).await?;
        debug!(id, link = %article.link, "Upserted article");
        Ok(id)
    }

    async fn upsert_articles(&self, articles: &[ArticleRecord]) -> Result<Vec<u64>> {
        if articles.is_empty() {
            return Ok(Vec::new());
        }
        let _guard = self.lock.lock().await;
        let mut index: ArticleIndex = Self::read_json(&self.index_path()).await?;
        let ids: Vec<u64> = articles.iter().map(|a| index.upsert(a)).collect();
        self.write_index(&index).await?;
        debug!(count = ids.len(), "Upserted article batch");
        Ok(ids)
    }

    async fn find_article(&self, link: &str) -> Result<Option<u64>> {
        let _guard = self.lock.lock().await;
        let index: ArticleIndex = Self::read_json(&self.index_path()).await?;
        Ok(index.articles.get(link).map(|a| a.id))
    }

    async fn upsert_comments(&self, article_id: u64, comments: &[CommentRecord]) -> Result<usize> {
        let _guard = self.lock.lock().await;
        let path = self.comments_path(article_id);
        let mut stored: Vec<CommentRecord> = Self::read_json(&path).await?;
        let added = merge_comments(&mut stored, comments);
        Self::write_json(&path, &stored).await?;
        debug!(article_id, added, total = stored.len(), "Upserted comments");
        Ok(added)
    }
}

/// In-process sink.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MemorySink {
    state: Mutex<MemoryState>,
}

#[cfg(test)]
#[derive(Debug, Default)]
struct MemoryState {
    index: ArticleIndex,
    comments: BTreeMap<u64, Vec<CommentRecord>>,
    failing_writes: usize,
}

#[cfg(test)]
impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` writes fail with a storage error.
    pub async fn fail_next_writes(&self, n: usize) {
        self.state.lock().await.failing_writes = n;
    }

    pub async fn article_count(&self) -> usize {
        self.state.lock().await.index.articles.len()
    }

    pub async fn article(&self, link: &str) -> Option<StoredArticle> {
        self.state.lock().await.index.articles.get(link).cloned()
    }

    pub async fn comments(&self, article_id: u64) -> Vec<CommentRecord> {
        self.state
            .lock()
            .await
            .comments
            .get(&article_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
impl MemoryState {
    fn check_write(&mut self) -> Result<()> {
        if self.failing_writes > 0 {
            self.failing_writes -= 1;
            return Err(PipelineError::Storage("injected write failure".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
#[async_trait]
impl StorageSink for MemorySink {
    async fn upsert_article(&self, article: &ArticleRecord) -> Result<u64> {
        let mut state = self.state.lock().await;
        state.check_write()?;
        Ok(state.index.upsert(article))
    }

    async fn upsert_articles(&self, articles: &[ArticleRecord]) -> Result<Vec<u64>> {
        let mut state = self.state.lock().await;
        state.check_write()?;
        Ok(articles.iter().map(|a| state.index.upsert(a)).collect())
    }

    async fn find_article(&self, link: &str) -> Result<Option<u64>> {
        Ok(self.state.lock().await.index.articles.get(link).map(|a| a.id))
    }

    async fn upsert_comments(&self, article_id: u64, comments: &[CommentRecord]) -> Result<usize> {
        let mut state = self.state.lock().await;
        state.check_write()?;
        let stored = state.comments.entry(article_id).or_default();
        Ok(merge_comments(stored, comments))
    }
}

fn decode<T: for<'de> Deserialize<'de>>(message: &Value) -> Result<T> {
    T::deserialize(message).map_err(|e| PipelineError::Decode(e.to_string()))
}

/// Writes `metadata_queue` batches into a sink.
pub struct MetadataStoreHandler {
    sink: Arc<dyn StorageSink>,
}

impl MetadataStoreHandler {
    pub fn new(sink: Arc<dyn StorageSink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl MessageHandler for MetadataStoreHandler {
    fn queue(&self) -> &str {
        METADATA_QUEUE
    }

    #[instrument(level = "info", skip_all)]
    async fn handle(&self, message: &Value, _cancel: &CancellationToken) -> Result<()> {
        let payload: MetadataPayload = decode(message)?;
        let articles: Vec<ArticleRecord> = payload
            .articles
            .iter()
            .cloned()
            .map(|mut article| {
                article.is_test |= payload.metadata.is_test;
                article.is_api_collection |= payload.metadata.is_api_collection;
                article
            })
            .collect();
        self.sink.upsert_articles(&articles).await?;
        info!(
            keyword = %payload.metadata.keyword,
            method = %payload.metadata.method,
            stored = payload.articles.len(),
            "Stored article batch"
        );
        Ok(())
    }
}

/// Writes `comments_queue` batches into a sink, creating a stub article when
/// the comments arrive before the article itself.
pub struct CommentsStoreHandler {
    sink: Arc<dyn StorageSink>,
}

impl CommentsStoreHandler {
    pub fn new(sink: Arc<dyn StorageSink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl MessageHandler for CommentsStoreHandler {
    fn queue(&self) -> &str {
        COMMENTS_QUEUE
    }

    #[instrument(level = "info", skip_all)]
    async fn handle(&self, message: &Value, _cancel: &CancellationToken) -> Result<()> {
        let payload: CommentsPayload = decode(message)?;
        let article_id = match self.sink.find_article(&payload.article_url).await? {
            Some(id) => id,
            None => {
                let stub = ArticleRecord {
                    title: String::new(),
                    link: payload.article_url.clone(),
                    original_link: None,
                    publisher: None,
                    description: None,
                    published_date: None,
                    is_test: false,
                    is_api_collection: false,
                };
                self.sink.upsert_article(&stub).await?
            }
        };
        let added = self.sink.upsert_comments(article_id, &payload.comments).await?;
        info!(
            article_url = %payload.article_url,
            article_id,
            received = payload.comments.len(),
            added,
            deleted = payload.stats.deleted_count,
            "Stored comments"
        );
        Ok(())
    }
}
