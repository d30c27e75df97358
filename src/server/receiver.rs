use crate::model::{Batch, LogEntry, SearchQuery, TimeRange};
use crate::server::query::{QueryEngine, QueryError};
use crate::server::store::StoreError;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use serde::Deserialize;
use std::collections::HashMap;
use std::io::Read;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Accepted bearer tokens; empty disables authentication.
    pub api_keys: Vec<String>,
    /// Sustained requests per second per agent.
    pub rate_limit: u32,
    /// Largest accepted batch, in entries.
    pub max_batch_size: usize,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            api_keys: Vec::new(),
            rate_limit: 1000,
            max_batch_size: 10_000,
        }
    }
}

#[derive(Debug, Default)]
pub struct ReceiverCounters {
    requests: AtomicU64,
    logs: AtomicU64,
    bytes: AtomicU64,
    errors: AtomicU64,
    last_received: Mutex<Option<DateTime<Utc>>>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ReceiverStats {
    pub requests_received: u64,
    pub logs_received: u64,
    pub bytes_received: u64,
    pub errors: u64,
    pub last_received: Option<DateTime<Utc>>,
}

/// Token bucket: starts full at `capacity` and refills at `rate` tokens
/// per second, so an agent can burst `capacity` requests and sustain
/// `rate` per second after that.
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: u32) -> Self {
        Self {
            tokens: capacity as f64,
            capacity: capacity as f64,
            rate: capacity as f64,
            last_refill: Instant::now(),
        }
    }

    fn allow(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Server-side ingress: authenticates, rate-limits and decodes agent
/// batches, handing entries to the pipeline's inbound channel. Also
/// mounts the in-process query surface.
pub struct Receiver {
    config: ReceiverConfig,
    inbound: mpsc::Sender<LogEntry>,
    counters: Arc<ReceiverCounters>,
    limiters: Mutex<HashMap<String, Arc<Mutex<TokenBucket>>>>,
    engine: Arc<QueryEngine>,
}

impl Receiver {
    pub fn new(
        config: ReceiverConfig,
        inbound: mpsc::Sender<LogEntry>,
        engine: Arc<QueryEngine>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            inbound,
            counters: Arc::new(ReceiverCounters::default()),
            limiters: Mutex::new(HashMap::new()),
            engine,
        })
    }

    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/api/v1/logs/ingest", post(handle_ingest))
            .route("/api/v1/health", get(handle_health))
            .route("/api/v1/stats", get(handle_stats))
            .route("/api/v1/logs/search", get(handle_search))
            .route("/api/v1/logs/aggregate", get(handle_aggregate))
            .route("/api/v1/logs/:id", get(handle_get))
            .with_state(Arc::clone(self))
    }

    pub fn stats(&self) -> ReceiverStats {
        ReceiverStats {
            requests_received: self.counters.requests.load(Ordering::Relaxed),
            logs_received: self.counters.logs.load(Ordering::Relaxed),
            bytes_received: self.counters.bytes.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            last_received: *self.counters.last_received.lock().unwrap(),
        }
    }

    fn record_error(&self) {
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// One bucket per agent id; the table mutex is held only for the
    /// lookup, token accounting happens under the bucket's own lock.
    fn check_rate_limit(&self, agent_id: &str) -> bool {
        let bucket = {
            let mut limiters = self.limiters.lock().unwrap();
            Arc::clone(limiters.entry(agent_id.to_string()).or_insert_with(|| {
                Arc::new(Mutex::new(TokenBucket::new(self.config.rate_limit)))
            }))
        };
        let mut bucket = bucket.lock().unwrap();
        bucket.allow()
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        if self.config.api_keys.is_empty() {
            return true;
        }
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(|token| self.config.api_keys.iter().any(|k| k == token))
            .unwrap_or(false)
    }
}

enum ApiError {
    Unauthorized,
    RateLimited,
    BadRequest(String),
    PayloadTooLarge,
    Overloaded,
    NotFound,
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized".to_string()),
            ApiError::RateLimited => (StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded".to_string()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::PayloadTooLarge => (StatusCode::PAYLOAD_TOO_LARGE, "batch too large".to_string()),
            ApiError::Overloaded => (StatusCode::SERVICE_UNAVAILABLE, "inbound queue full".to_string()),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "not found".to_string()),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<QueryError> for ApiError {
    fn from(e: QueryError) -> Self {
        match e {
            QueryError::Store(StoreError::NotFound) => ApiError::NotFound,
            QueryError::UnsupportedAggregation(_) | QueryError::UnsupportedInterval(_) => {
                ApiError::BadRequest(e.to_string())
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

async fn handle_ingest(
    State(receiver): State<Arc<Receiver>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    receiver.counters.requests.fetch_add(1, Ordering::Relaxed);

    if !receiver.authorized(&headers) {
        receiver.record_error();
        return Err(ApiError::Unauthorized);
    }

    let agent_id = headers
        .get("x-agent-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| peer.to_string());

    if !receiver.check_rate_limit(&agent_id) {
        receiver.record_error();
        return Err(ApiError::RateLimited);
    }

    receiver
        .counters
        .bytes
        .fetch_add(body.len() as u64, Ordering::Relaxed);

    let gzipped = headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("gzip"))
        .unwrap_or(false);

    let payload = if gzipped {
        let mut decoder = GzDecoder::new(&body[..]);
        let mut decompressed = Vec::new();
        if decoder.read_to_end(&mut decompressed).is_err() {
            receiver.record_error();
            return Err(ApiError::BadRequest("failed to decompress".to_string()));
        }
        decompressed
    } else {
        body.to_vec()
    };

    let batch: Batch = match serde_json::from_slice(&payload) {
        Ok(batch) => batch,
        Err(e) => {
            receiver.record_error();
            return Err(ApiError::BadRequest(format!("invalid JSON: {}", e)));
        }
    };

    if batch.len() > receiver.config.max_batch_size {
        receiver.record_error();
        return Err(ApiError::PayloadTooLarge);
    }

    debug!(agent = %agent_id, entries = batch.len(), "batch received");

    let mut received = 0usize;
    for entry in batch.entries {
        match receiver.inbound.try_send(entry) {
            Ok(()) => {
                received += 1;
                receiver.counters.logs.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Full(_))
            | Err(mpsc::error::TrySendError::Closed(_)) => {
                // The agent retries the whole batch; shed the remainder.
                receiver.record_error();
                warn!(agent = %agent_id, received, "inbound channel full, aborting batch");
                return Err(ApiError::Overloaded);
            }
        }
    }

    *receiver.counters.last_received.lock().unwrap() = Some(Utc::now());
    Ok(Json(serde_json::json!({
        "status": "ok",
        "received": received,
    })))
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "time": Utc::now(),
    }))
}

async fn handle_stats(State(receiver): State<Arc<Receiver>>) -> Json<serde_json::Value> {
    let stats = receiver.stats();
    Json(serde_json::json!({
        "requests_received": stats.requests_received,
        "logs_received": stats.logs_received,
        "bytes_received": stats.bytes_received,
        "errors": stats.errors,
        "last_received": stats.last_received,
        "query": receiver.engine.stats(),
    }))
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    #[serde(default)]
    q: String,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    limit: Option<usize>,
    offset: Option<usize>,
    sort_order: Option<crate::model::SortOrder>,
    #[serde(rename = "type")]
    agg_type: Option<String>,
    field: Option<String>,
}

impl SearchParams {
    fn to_query(&self) -> SearchQuery {
        let mut query = SearchQuery::new(self.q.clone());
        if let (Some(start), Some(end)) = (self.start, self.end) {
            query.time_range = TimeRange::new(start, end);
        }
        if let Some(limit) = self.limit {
            query.limit = limit;
        }
        if let Some(offset) = self.offset {
            query.offset = offset;
        }
        if let Some(order) = self.sort_order {
            query.sort_order = order;
        }
        query
    }
}

async fn handle_search(
    State(receiver): State<Arc<Receiver>>,
    Query(params): Query<SearchParams>,
) -> Result<Response, ApiError> {
    let result = receiver.engine.query(&params.to_query())?;
    Ok(Json(&*result).into_response())
}

async fn handle_aggregate(
    State(receiver): State<Arc<Receiver>>,
    Query(params): Query<SearchParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let agg_type = params.agg_type.clone().unwrap_or_else(|| "count".to_string());
    let field = params.field.clone().unwrap_or_default();
    let aggregations = receiver
        .engine
        .aggregate(&params.to_query(), &agg_type, &field)?;
    Ok(Json(aggregations))
}

async fn handle_get(
    State(receiver): State<Arc<Receiver>>,
    Path(id): Path<String>,
) -> Result<Json<LogEntry>, ApiError> {
    Ok(Json(receiver.engine.get(&id)?))
}
