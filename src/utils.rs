//! Small helpers for dates, URLs and log output.
//!
//! - Date parsing for the formats listing and comment pages show
//! - Absolute-date extraction from free text (`YYYY.MM.DD`)
//! - Publisher domain extraction
//! - String truncation for logging

use chrono::{Duration, NaiveDate, NaiveDateTime};
use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

static ABSOLUTE_DATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{4})\.(\d{1,2})\.(\d{1,2})").expect("valid date regex"));

static RELATIVE_TIME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d+)\s*(분|시간|일|주|minutes?|hours?|days?|weeks?)\s*(전|ago)")
        .expect("valid relative time regex")
});

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y.%m.%d %H:%M:%S",
    "%Y.%m.%d %H:%M",
    "%Y.%m.%d. %H:%M",
    "%Y/%m/%d %H:%M:%S",
    "%Y/%m/%d %H:%M",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y.%m.%d", "%Y.%m.%d.", "%Y/%m/%d"];

/// Truncate a string for logging purposes.
///
/// Long strings are cut to at most `max` bytes (on a character boundary)
/// with `"…(+N bytes)"` appended.
///
/// # Examples
///
/// ```ignore
/// assert_eq!(truncate_for_log("short", 100), "short");
/// assert_eq!(truncate_for_log(&"a".repeat(500), 10), "aaaaaaaaaa…(+490 bytes)");
/// ```
pub fn truncate_for_log(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut cut = max;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…(+{} bytes)", &s[..cut], s.len() - cut)
}

/// Parse an ISO `YYYY-MM-DD` request date.
pub fn parse_request_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok()
}

/// Pull the first `YYYY.MM.DD` date out of free text.
///
/// Single-digit months and days are accepted (`2024.3.7`). Returns `None`
/// when nothing matches or the match is not a real calendar date.
pub fn extract_absolute_date(text: &str) -> Option<NaiveDate> {
    let caps = ABSOLUTE_DATE.captures(text)?;
    let year = caps[1].parse().ok()?;
    let month = caps[2].parse().ok()?;
    let day = caps[3].parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Parse a timestamp as shown on listing or comment pages.
///
/// Absolute forms (`2024-03-21 14:30`, `2024.03.21.`, `2024/03/21`) are
/// tried first. Relative forms (`3시간 전`, `2 days ago`) are resolved
/// against `reference` when one is given.
pub fn parse_datetime(s: &str, reference: Option<NaiveDateTime>) -> Option<NaiveDateTime> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt);
        }
    }
    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return d.and_hms_opt(0, 0, 0);
        }
    }

    let reference = reference?;
    let caps = RELATIVE_TIME.captures(s)?;
    let n: i64 = caps[1].parse().ok()?;
    let delta = match &caps[2] {
        "분" | "minute" | "minutes" => Duration::minutes(n),
        "시간" | "hour" | "hours" => Duration::hours(n),
        "일" | "day" | "days" => Duration::days(n),
        "주" | "week" | "weeks" => Duration::weeks(n),
        _ => return None,
    };
    Some(reference - delta)
}

/// Host part of a URL, or an empty string when it does not parse.
pub fn extract_domain(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_default()
}

/// Inclusive list of days from `end` back to `start`, newest first.
pub fn days_descending(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    let mut days = Vec::new();
    let mut current = end;
    while current >= start {
        days.push(current);
        match current.pred_opt() {
            Some(prev) => current = prev,
            None => break,
        }
    }
    days
}
