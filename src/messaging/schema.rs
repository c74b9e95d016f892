//! Required-field rules for each queue.
//!
//! Fields are dotted paths into the JSON body (`metadata.keyword`). A field
//! is present when its key exists; `null` values count as present. Some
//! fields also carry a shape check (list or object).

use crate::errors::{PipelineError, Result};
use serde_json::Value;
use tracing::debug;

pub const METADATA_QUEUE: &str = "metadata_queue";
pub const COMMENTS_QUEUE: &str = "comments_queue";
pub const COLLECTOR_REQUESTS_QUEUE: &str = "collector_requests_queue";
pub const COLLECTION_STATUS_QUEUE: &str = "collection_status_queue";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    Any,
    List,
    Object,
}

const METADATA_FIELDS: &[(&str, Shape)] = &[
    ("articles", Shape::List),
    ("collected_at", Shape::Any),
    ("metadata", Shape::Object),
    ("metadata.method", Shape::Any),
    ("metadata.total_collected", Shape::Any),
    ("metadata.keyword", Shape::Any),
    ("metadata.is_test", Shape::Any),
    ("metadata.is_api_collection", Shape::Any),
];

const COMMENTS_FIELDS: &[(&str, Shape)] = &[
    ("article_url", Shape::Any),
    ("type", Shape::Any),
    ("comments", Shape::List),
    ("stats", Shape::Any),
    ("total_count", Shape::Any),
    ("collected_at", Shape::Any),
];

const REQUEST_FIELDS: &[(&str, Shape)] = &[
    ("request_id", Shape::Any),
    ("type", Shape::Any),
    ("params", Shape::Any),
    ("queued_at", Shape::Any),
];

const STATUS_FIELDS: &[(&str, Shape)] = &[
    ("collection_id", Shape::Any),
    ("status", Shape::Any),
    ("progress", Shape::Any),
];

fn rules(queue: &str) -> Option<&'static [(&'static str, Shape)]> {
    match queue {
        METADATA_QUEUE => Some(METADATA_FIELDS),
        COMMENTS_QUEUE => Some(COMMENTS_FIELDS),
        COLLECTOR_REQUESTS_QUEUE => Some(REQUEST_FIELDS),
        COLLECTION_STATUS_QUEUE => Some(STATUS_FIELDS),
        _ => None,
    }
}

/// Required field paths for `queue`, or `None` for unregistered queues.
pub fn required_fields(queue: &str) -> Option<Vec<&'static str>> {
    rules(queue).map(|r| r.iter().map(|(f, _)| *f).collect())
}

fn lookup<'a>(message: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(message, |node, key| node.as_object()?.get(key))
}

/// Check `message` against the rules registered for `queue`.
///
/// Returns the first missing or mis-shaped field as
/// [`PipelineError::Validation`]. Unregistered queues always pass.
pub fn validate(queue: &str, message: &Value) -> Result<()> {
    let Some(rules) = rules(queue) else {
        debug!(%queue, "No schema registered; skipping validation");
        return Ok(());
    };
    if !message.is_object() {
        return Err(PipelineError::validation(queue, "<root>"));
    }
    for (field, shape) in rules {
        let value = lookup(message, field).ok_or_else(|| PipelineError::validation(queue, field))?;
        let ok = match shape {
            Shape::Any => true,
            Shape::List => value.is_array(),
            Shape::Object => value.is_object(),
        };
        if !ok {
            return Err(PipelineError::validation(queue, field));
        }
    }
    Ok(())
}
