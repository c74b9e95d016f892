//! Page parsing collaborator.
//!
//! Turns raw listing and comment pages into records. Parsing is pure: no I/O,
//! no clock. Selectors come from [`ParserConfig`] so the markup of a target
//! site is configuration, not code.

use crate::config::ParserConfig;
use crate::errors::{PipelineError, Result};
use crate::models::{ArticleRecord, CommentRecord};
use crate::utils::extract_absolute_date;
use chrono::NaiveDate;
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, instrument};

pub trait Parser: Send + Sync {
    /// Extract articles from a listing page. `fallback_date` is used for
    /// items that carry no absolute date (recent items show relative ones).
    fn parse_articles(&self, raw: &str, fallback_date: Option<NaiveDate>) -> Vec<ArticleRecord>;

    fn parse_comments(&self, raw: &str) -> Vec<CommentRecord>;
}

#[derive(Debug, Clone)]
pub struct SelectorParser {
    article_item: Selector,
    article_title: Selector,
    article_portal_link: Selector,
    article_publisher: Selector,
    article_description: Selector,
    article_info: Selector,
    comment_item: Selector,
    comment_author: Selector,
    comment_content: Selector,
    comment_date: Selector,
    comment_likes: Selector,
    comment_dislikes: Selector,
    comment_deleted_class: String,
}

fn compile(raw: &str) -> Result<Selector> {
    Selector::parse(raw).map_err(|e| PipelineError::Config(format!("invalid selector {raw:?}: {e}")))
}

fn text_of(el: ElementRef<'_>) -> String {
    el.text()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn first_text(el: ElementRef<'_>, sel: &Selector) -> Option<String> {
    el.select(sel).next().map(text_of).filter(|s| !s.is_empty())
}

fn count_in(el: ElementRef<'_>, sel: &Selector) -> u32 {
    first_text(el, sel)
        .map(|s| s.chars().filter(char::is_ascii_digit).collect::<String>())
        .and_then(|digits| digits.parse().ok())
        .unwrap_or(0)
}

impl SelectorParser {
    pub fn new(config: &ParserConfig) -> Result<Self> {
        Ok(Self {
            article_item: compile(&config.article_item)?,
            article_title: compile(&config.article_title)?,
            article_portal_link: compile(&config.article_portal_link)?,
            article_publisher: compile(&config.article_publisher)?,
            article_description: compile(&config.article_description)?,
            article_info: compile(&config.article_info)?,
            comment_item: compile(&config.comment_item)?,
            comment_author: compile(&config.comment_author)?,
            comment_content: compile(&config.comment_content)?,
            comment_date: compile(&config.comment_date)?,
            comment_likes: compile(&config.comment_likes)?,
            comment_dislikes: compile(&config.comment_dislikes)?,
            comment_deleted_class: config.comment_deleted_class.clone(),
        })
    }

    fn article(&self, item: ElementRef<'_>, fallback_date: Option<NaiveDate>) -> Option<ArticleRecord> {
        let title_el = item.select(&self.article_title).next()?;
        let title = text_of(title_el);
        let original_link = title_el.value().attr("href")?.to_string();
        if title.is_empty() {
            return None;
        }

        let link = item
            .select(&self.article_portal_link)
            .next()
            .and_then(|a| a.value().attr("href"))
            .map(str::to_string)
            .unwrap_or_else(|| original_link.clone());

        let published_date = item
            .select(&self.article_info)
            .map(text_of)
            .find_map(|t| extract_absolute_date(&t))
            .or(fallback_date);

        Some(ArticleRecord {
            title,
            link,
            original_link: Some(original_link),
            publisher: first_text(item, &self.article_publisher),
            description: first_text(item, &self.article_description),
            published_date,
            is_test: false,
            is_api_collection: false,
        })
    }
}

impl Parser for SelectorParser {
    #[instrument(level = "debug", skip_all, fields(bytes = raw.len()))]
    fn parse_articles(&self, raw: &str, fallback_date: Option<NaiveDate>) -> Vec<ArticleRecord> {
        let doc = Html::parse_document(raw);
        let articles: Vec<ArticleRecord> = doc
            .select(&self.article_item)
            .filter_map(|item| self.article(item, fallback_date))
            .collect();
        debug!(count = articles.len(), "Parsed articles");
        articles
    }

    #[instrument(level = "debug", skip_all, fields(bytes = raw.len()))]
    fn parse_comments(&self, raw: &str) -> Vec<CommentRecord> {
        let doc = Html::parse_document(raw);
        let comments: Vec<CommentRecord> = doc
            .select(&self.comment_item)
            .map(|item| {
                let is_deleted = item
                    .value()
                    .classes()
                    .any(|c| c == self.comment_deleted_class);
                CommentRecord {
                    username: first_text(item, &self.comment_author).unwrap_or_default(),
                    content: first_text(item, &self.comment_content).unwrap_or_default(),
                    timestamp: first_text(item, &self.comment_date),
                    likes: count_in(item, &self.comment_likes),
                    dislikes: count_in(item, &self.comment_dislikes),
                    is_deleted,
                }
            })
            .collect();
        debug!(count = comments.len(), "Parsed comments");
        comments
    }
}
