use crate::model::LogEntry;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Half-open time interval: `start` is included, `end` is excluded.
/// Keeping the end exclusive means adjacent ranges never double-count
/// an entry sitting exactly on the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Range covering the last `duration` up to now.
    pub fn last(duration: Duration) -> Self {
        let now = Utc::now();
        Self {
            start: now - duration,
            end: now,
        }
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        t >= self.start && t < self.end
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

/// A log search request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchQuery {
    pub query: String,
    pub time_range: TimeRange,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub filters: HashMap<String, serde_json::Value>,
    pub limit: usize,
    pub offset: usize,
    #[serde(default = "default_sort_by")]
    pub sort_by: String,
    #[serde(default = "default_sort_order")]
    pub sort_order: SortOrder,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<String>,
}

fn default_sort_by() -> String {
    "timestamp".to_string()
}

fn default_sort_order() -> SortOrder {
    SortOrder::Desc
}

impl SearchQuery {
    /// New query over the last 24 hours with default paging and sorting.
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            time_range: TimeRange::last(Duration::hours(24)),
            filters: HashMap::new(),
            limit: 100,
            offset: 0,
            sort_by: default_sort_by(),
            sort_order: default_sort_order(),
            fields: Vec::new(),
        }
    }
}

/// The outcome of a search query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub hits: Vec<LogEntry>,
    pub total: u64,
    pub took_ms: i64,
    pub timed_out: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregations: Option<serde_json::Value>,
}

impl SearchResult {
    pub fn empty() -> Self {
        Self {
            hits: Vec::new(),
            total: 0,
            took_ms: 0,
            timed_out: false,
            aggregations: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_contains_is_half_open() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let range = TimeRange::new(start, end);

        assert!(range.contains(start));
        assert!(range.contains(end - Duration::nanoseconds(1)));
        assert!(!range.contains(end));
        assert!(!range.contains(start - Duration::seconds(1)));
    }

    #[test]
    fn test_query_defaults() {
        let q = SearchQuery::new("error");
        assert_eq!(q.limit, 100);
        assert_eq!(q.offset, 0);
        assert_eq!(q.sort_by, "timestamp");
        assert_eq!(q.sort_order, SortOrder::Desc);
        assert_eq!(q.time_range.duration(), Duration::hours(24));
    }

    #[test]
    fn test_sort_order_wire_format() {
        assert_eq!(serde_json::to_string(&SortOrder::Asc).unwrap(), "\"asc\"");
        let back: SortOrder = serde_json::from_str("\"desc\"").unwrap();
        assert_eq!(back, SortOrder::Desc);
    }
}
