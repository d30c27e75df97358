use crate::model::{LogEntry, SearchQuery, SearchResult, SortOrder};
use crate::server::store::{FileStore, StoreError, StoreStats};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

const MAX_LIMIT: usize = 10_000;
const DEFAULT_LIMIT: usize = 100;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("unsupported aggregation type: {0}")]
    UnsupportedAggregation(String),

    #[error("unsupported histogram interval: {0}")]
    UnsupportedInterval(String),
}

#[derive(Debug, Clone)]
pub struct QueryConfig {
    pub cache_size: usize,
    pub cache_ttl: Duration,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            cache_size: 1000,
            cache_ttl: Duration::from_secs(300),
        }
    }
}

struct CacheSlot {
    result: Arc<SearchResult>,
    cached_at: Instant,
}

/// Wraps the store with validation, stable sorting, pagination and a
/// TTL result cache. Eviction is wholesale: when the cache reaches
/// capacity it is cleared, results being cheap to recompute.
pub struct QueryEngine {
    store: Arc<FileStore>,
    config: QueryConfig,
    cache: Mutex<HashMap<String, CacheSlot>>,
}

impl QueryEngine {
    pub fn new(store: Arc<FileStore>, config: QueryConfig) -> Self {
        Self {
            store,
            config,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn query(&self, query: &SearchQuery) -> Result<Arc<SearchResult>, QueryError> {
        let query = validate(query.clone());
        let key = cache_key(&query);

        if let Some(result) = self.cache_get(&key) {
            debug!(key = %key, "query cache hit");
            return Ok(result);
        }

        // Fetch enough rows to cover the requested page.
        let mut fetch = query.clone();
        fetch.limit = query.offset.saturating_add(query.limit).min(MAX_LIMIT).max(1);
        let mut result = self.store.query(&fetch)?;

        sort_hits(&mut result.hits, query.sort_order);
        result.total = result.hits.len() as u64;
        paginate(&mut result.hits, query.offset, query.limit);

        let result = Arc::new(result);
        self.cache_set(key, Arc::clone(&result));
        Ok(result)
    }

    pub fn get(&self, id: &str) -> Result<LogEntry, QueryError> {
        Ok(self.store.get(id)?)
    }

    /// Runs an aggregation over the matching entries. Supported types:
    /// `count`, `terms` (over level/source/host/service or any
    /// structured field) and `date_histogram` (minute/hour/day).
    pub fn aggregate(
        &self,
        query: &SearchQuery,
        agg_type: &str,
        field: &str,
    ) -> Result<serde_json::Value, QueryError> {
        let mut fetch = validate(query.clone());
        fetch.limit = MAX_LIMIT;
        let result = self.store.query(&fetch)?;

        match agg_type {
            "count" => Ok(serde_json::json!({ "count": result.total })),
            "terms" => Ok(terms_aggregation(&result.hits, field)),
            "date_histogram" => date_histogram(&result.hits, field),
            other => Err(QueryError::UnsupportedAggregation(other.to_string())),
        }
    }

    pub fn clear_cache(&self) {
        self.cache.lock().unwrap().clear();
    }

    pub fn stats(&self) -> QueryEngineStats {
        QueryEngineStats {
            cache_entries: self.cache.lock().unwrap().len(),
            store: self.store.stats(),
        }
    }

    fn cache_get(&self, key: &str) -> Option<Arc<SearchResult>> {
        let cache = self.cache.lock().unwrap();
        let slot = cache.get(key)?;
        if slot.cached_at.elapsed() > self.config.cache_ttl {
            return None;
        }
        Some(Arc::clone(&slot.result))
    }

    fn cache_set(&self, key: String, result: Arc<SearchResult>) {
        let mut cache = self.cache.lock().unwrap();
        if cache.len() >= self.config.cache_size {
            cache.clear();
        }
        cache.insert(
            key,
            CacheSlot {
                result,
                cached_at: Instant::now(),
            },
        );
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct QueryEngineStats {
    pub cache_entries: usize,
    pub store: StoreStats,
}

fn validate(mut query: SearchQuery) -> SearchQuery {
    if query.limit == 0 {
        query.limit = DEFAULT_LIMIT;
    }
    query.limit = query.limit.min(MAX_LIMIT);
    if query.sort_by.is_empty() {
        query.sort_by = "timestamp".to_string();
    }
    query
}

fn cache_key(query: &SearchQuery) -> String {
    format!(
        "{}:{}:{}:{}:{}",
        query.query,
        query.time_range.start.timestamp(),
        query.time_range.end.timestamp(),
        query.sort_by,
        match query.sort_order {
            SortOrder::Asc => "asc",
            SortOrder::Desc => "desc",
        },
    )
}

/// Stable sort by timestamp; entries with equal timestamps keep their
/// scan order.
fn sort_hits(hits: &mut [LogEntry], order: SortOrder) {
    match order {
        SortOrder::Asc => hits.sort_by(|a, b| a.timestamp.cmp(&b.timestamp)),
        SortOrder::Desc => hits.sort_by(|a, b| b.timestamp.cmp(&a.timestamp)),
    }
}

fn paginate(hits: &mut Vec<LogEntry>, offset: usize, limit: usize) {
    if offset >= hits.len() {
        hits.clear();
        return;
    }
    if offset > 0 {
        hits.drain(..offset);
    }
    hits.truncate(limit);
}

fn terms_aggregation(hits: &[LogEntry], field: &str) -> serde_json::Value {
    let mut counts: HashMap<String, u64> = HashMap::new();
    for entry in hits {
        let value = match field {
            "level" => Some(entry.level.to_string()),
            "source" => Some(entry.source.clone()),
            "host" => Some(entry.host.clone()),
            "service" => Some(entry.service.clone()),
            _ => entry.get_field(field).map(|v| match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            }),
        };
        if let Some(value) = value {
            if !value.is_empty() {
                *counts.entry(value).or_default() += 1;
            }
        }
    }

    let mut buckets: Vec<(String, u64)> = counts.into_iter().collect();
    buckets.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    let buckets: Vec<serde_json::Value> = buckets
        .into_iter()
        .map(|(key, count)| serde_json::json!({"key": key, "count": count}))
        .collect();
    serde_json::json!({ "buckets": buckets })
}

fn date_histogram(hits: &[LogEntry], interval: &str) -> Result<serde_json::Value, QueryError> {
    let seconds: i64 = match interval {
        "minute" => 60,
        "hour" => 3600,
        "day" => 86400,
        other => return Err(QueryError::UnsupportedInterval(other.to_string())),
    };

    let mut counts: HashMap<i64, u64> = HashMap::new();
    for entry in hits {
        let bucket = entry.timestamp.timestamp().div_euclid(seconds) * seconds;
        *counts.entry(bucket).or_default() += 1;
    }

    let mut buckets: Vec<(i64, u64)> = counts.into_iter().collect();
    buckets.sort_by_key(|(bucket, _)| *bucket);
    let buckets: Vec<serde_json::Value> = buckets
        .into_iter()
        .filter_map(|(bucket, count)| {
            chrono::TimeZone::timestamp_opt(&chrono::Utc, bucket, 0)
                .single()
                .map(|ts| serde_json::json!({"key": ts.to_rfc3339(), "count": count}))
        })
        .collect();
    Ok(serde_json::json!({ "buckets": buckets }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LogLevel, TimeRange};
    use crate::server::store::StoreConfig;
    use chrono::{DateTime, TimeZone, Utc};
    use tempfile::TempDir;

    fn engine(dir: &TempDir, config: QueryConfig) -> QueryEngine {
        let store = Arc::new(
            FileStore::open(StoreConfig {
                path: dir.path().to_path_buf(),
                partition_interval: Duration::from_secs(24 * 3600),
            })
            .unwrap(),
        );
        QueryEngine::new(store, config)
    }

    fn seed(engine: &QueryEngine, base: DateTime<Utc>) {
        // 10 entries over an hour: 3 ERROR, 7 INFO.
        for i in 0..10i64 {
            let mut entry = LogEntry::new();
            entry.id = format!("id-{}", i);
            entry.timestamp = base + chrono::Duration::minutes(i * 6);
            entry.level = if i < 3 { LogLevel::Error } else { LogLevel::Info };
            entry.message = format!("message {}", i);
            entry.source = "seed".to_string();
            engine.store.write(&entry).unwrap();
        }
    }

    fn hour_query(base: DateTime<Utc>) -> SearchQuery {
        let mut query = SearchQuery::new("");
        query.time_range = TimeRange::new(base, base + chrono::Duration::hours(1));
        query
    }

    #[test]
    fn test_query_returns_all_hits_sorted_desc() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, QueryConfig::default());
        let base = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        seed(&engine, base);

        let result = engine.query(&hour_query(base)).unwrap();
        assert_eq!(result.total, 10);
        assert_eq!(result.hits.len(), 10);
        for pair in result.hits.windows(2) {
            assert!(pair[0].timestamp >= pair[1].timestamp);
        }
    }

    #[test]
    fn test_sort_asc_and_pagination() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, QueryConfig::default());
        let base = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        seed(&engine, base);

        let mut query = hour_query(base);
        query.sort_order = SortOrder::Asc;
        query.offset = 2;
        query.limit = 3;

        let result = engine.query(&query).unwrap();
        assert_eq!(result.hits.len(), 3);
        assert_eq!(result.hits[0].id, "id-2");
        assert_eq!(result.hits[2].id, "id-4");
    }

    #[test]
    fn test_limit_clamping() {
        let query = validate(SearchQuery {
            limit: 0,
            ..SearchQuery::new("x")
        });
        assert_eq!(query.limit, DEFAULT_LIMIT);

        let query = validate(SearchQuery {
            limit: 999_999,
            ..SearchQuery::new("x")
        });
        assert_eq!(query.limit, MAX_LIMIT);
    }

    #[test]
    fn test_cache_hit_returns_same_result() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, QueryConfig::default());
        let base = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        seed(&engine, base);

        let first = engine.query(&hour_query(base)).unwrap();
        let second = engine.query(&hour_query(base)).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(engine.stats().cache_entries, 1);
    }

    #[test]
    fn test_cache_expires_after_ttl() {
        let dir = TempDir::new().unwrap();
        let engine = engine(
            &dir,
            QueryConfig {
                cache_size: 10,
                cache_ttl: Duration::from_millis(20),
            },
        );
        let base = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        seed(&engine, base);

        let first = engine.query(&hour_query(base)).unwrap();
        std::thread::sleep(Duration::from_millis(40));
        let second = engine.query(&hour_query(base)).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_cache_wholesale_eviction() {
        let dir = TempDir::new().unwrap();
        let engine = engine(
            &dir,
            QueryConfig {
                cache_size: 2,
                cache_ttl: Duration::from_secs(300),
            },
        );
        let base = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        seed(&engine, base);

        for text in ["a", "b", "c"] {
            let mut query = hour_query(base);
            query.query = text.to_string();
            engine.query(&query).unwrap();
        }
        // Third insert found the cache full and cleared it first.
        assert_eq!(engine.stats().cache_entries, 1);
    }

    #[test]
    fn test_terms_aggregation_by_level() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, QueryConfig::default());
        let base = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        seed(&engine, base);

        let aggs = engine.aggregate(&hour_query(base), "terms", "level").unwrap();
        let buckets = aggs["buckets"].as_array().unwrap();
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0]["key"], "INFO");
        assert_eq!(buckets[0]["count"], 7);
        assert_eq!(buckets[1]["key"], "ERROR");
        assert_eq!(buckets[1]["count"], 3);
    }

    #[test]
    fn test_count_and_histogram_aggregations() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, QueryConfig::default());
        let base = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        seed(&engine, base);

        let count = engine.aggregate(&hour_query(base), "count", "").unwrap();
        assert_eq!(count["count"], 10);

        let histogram = engine
            .aggregate(&hour_query(base), "date_histogram", "hour")
            .unwrap();
        let buckets = histogram["buckets"].as_array().unwrap();
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0]["count"], 10);
        assert!(buckets[0]["key"].as_str().unwrap().starts_with("2024-05-01T12:00:00"));

        let err = engine
            .aggregate(&hour_query(base), "date_histogram", "week")
            .unwrap_err();
        assert!(matches!(err, QueryError::UnsupportedInterval(_)));

        let err = engine.aggregate(&hour_query(base), "median", "").unwrap_err();
        assert!(matches!(err, QueryError::UnsupportedAggregation(_)));
    }
}
