use super::{generate_entry_id, Collector, CollectorCore, CollectorError, CollectorStats};
use crate::model::{LogEntry, LogLevel};
use async_trait::async_trait;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::info;

#[derive(Debug, Clone)]
pub struct HttpCollectorConfig {
    pub listen_address: String,
    pub auth_token: Option<String>,
    pub source: String,
    pub host: String,
}

/// Accepts log entries pushed over HTTP: JSON (single entry or array)
/// or plain text on `POST /ingest`.
pub struct HttpCollector {
    core: Arc<CollectorCore>,
    config: HttpCollectorConfig,
    output_rx: Option<mpsc::Receiver<LogEntry>>,
    stop_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
    local_addr: Option<std::net::SocketAddr>,
}

#[derive(Clone)]
struct IngestState {
    core: Arc<CollectorCore>,
    auth_token: Option<String>,
    source: String,
    host: String,
}

/// Lenient wire shape for pushed entries; anything missing is filled in
/// server-side.
#[derive(Debug, Deserialize)]
struct PushedEntry {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    level: Option<LogLevel>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    host: Option<String>,
    #[serde(default)]
    service: Option<String>,
    #[serde(default)]
    fields: HashMap<String, serde_json::Value>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    raw: Option<String>,
}

impl HttpCollector {
    pub fn new(name: String, config: HttpCollectorConfig) -> Self {
        let (core, output_rx) = CollectorCore::new(name, "http", 1000);
        let (stop_tx, _) = watch::channel(false);
        Self {
            core,
            config,
            output_rx: Some(output_rx),
            stop_tx,
            task: None,
            local_addr: None,
        }
    }

    /// Address the listener is actually bound to; useful when the
    /// configured port is 0.
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.local_addr
    }
}

#[async_trait]
impl Collector for HttpCollector {
    async fn start(&mut self, shutdown: watch::Receiver<bool>) -> Result<(), CollectorError> {
        if self.task.is_some() {
            return Err(CollectorError::AlreadyStarted);
        }

        let state = IngestState {
            core: Arc::clone(&self.core),
            auth_token: self.config.auth_token.clone(),
            source: self.config.source.clone(),
            host: self.config.host.clone(),
        };

        let app = Router::new()
            .route("/ingest", post(handle_ingest))
            .route("/health", get(handle_health))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind(&self.config.listen_address).await?;
        self.local_addr = listener.local_addr().ok();
        info!(addr = %self.config.listen_address, "http collector listening");

        let mut stop_rx = self.stop_tx.subscribe();
        let mut shutdown = shutdown;
        self.task = Some(tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    tokio::select! {
                        _ = stop_rx.changed() => {}
                        _ = shutdown.changed() => {}
                    }
                })
                .await;
        }));

        Ok(())
    }

    async fn stop(&mut self) -> Result<(), CollectorError> {
        let _ = self.stop_tx.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        Ok(())
    }

    fn take_output(&mut self) -> Option<mpsc::Receiver<LogEntry>> {
        self.output_rx.take()
    }

    fn name(&self) -> &str {
        &self.config.source
    }

    fn kind(&self) -> &'static str {
        "http"
    }

    fn stats(&self) -> CollectorStats {
        self.core.stats()
    }
}

async fn handle_ingest(
    State(state): State<IngestState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> impl IntoResponse {
    if let Some(expected) = &state.auth_token {
        let authorized = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(|token| token == expected)
            .unwrap_or(false);
        if !authorized {
            return (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({"error": "unauthorized"})),
            );
        }
    }

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_string();

    match content_type.as_str() {
        "application/json" => {
            let pushed: Vec<PushedEntry> =
                match serde_json::from_slice::<Vec<PushedEntry>>(&body) {
                    Ok(entries) => entries,
                    Err(_) => match serde_json::from_slice::<PushedEntry>(&body) {
                        Ok(entry) => vec![entry],
                        Err(_) => {
                            state.core.record_error("invalid JSON payload");
                            return (
                                StatusCode::BAD_REQUEST,
                                Json(serde_json::json!({"error": "invalid JSON"})),
                            );
                        }
                    },
                };

            let received = pushed.len();
            for p in pushed {
                state.core.emit(materialize(p, &state));
            }
            (
                StatusCode::OK,
                Json(serde_json::json!({"status": "ok", "received": received})),
            )
        }
        "text/plain" | "" => {
            let message = String::from_utf8_lossy(&body).to_string();
            let mut entry = LogEntry::new();
            entry.id = generate_entry_id(&state.source, &message);
            entry.raw = message.clone();
            entry.message = message;
            entry.source = state.source.clone();
            entry.host = state.host.clone();
            entry.level = LogLevel::Info;
            state.core.emit(entry);
            (
                StatusCode::OK,
                Json(serde_json::json!({"status": "ok", "received": 1})),
            )
        }
        _ => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "unsupported content type"})),
        ),
    }
}

async fn handle_health(State(state): State<IngestState>) -> impl IntoResponse {
    let stats = state.core.stats();
    Json(serde_json::json!({
        "status": "healthy",
        "collector": {
            "name": stats.name,
            "type": stats.kind,
            "logs_collected": stats.logs_collected,
        }
    }))
}

fn materialize(pushed: PushedEntry, state: &IngestState) -> LogEntry {
    let raw = pushed.raw.or_else(|| pushed.message.clone()).unwrap_or_default();
    let mut entry = LogEntry::new();
    entry.id = pushed
        .id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| generate_entry_id(&state.source, &raw));
    entry.timestamp = pushed.timestamp.unwrap_or_else(Utc::now);
    entry.level = pushed.level.unwrap_or(LogLevel::Info);
    entry.message = pushed.message.unwrap_or_default();
    entry.source = pushed
        .source
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| state.source.clone());
    entry.host = pushed
        .host
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| state.host.clone());
    entry.service = pushed.service.unwrap_or_default();
    entry.fields = pushed.fields;
    entry.tags = pushed.tags;
    entry.raw = raw;
    entry
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn started_collector(
        auth_token: Option<String>,
    ) -> (HttpCollector, mpsc::Receiver<LogEntry>, String) {
        let mut collector = HttpCollector::new(
            "api".to_string(),
            HttpCollectorConfig {
                listen_address: "127.0.0.1:0".to_string(),
                auth_token,
                source: "api".to_string(),
                host: "host-1".to_string(),
            },
        );
        let output = collector.take_output().unwrap();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        collector.start(shutdown_rx).await.unwrap();
        let base = format!("http://{}", collector.local_addr().unwrap());
        (collector, output, base)
    }

    #[tokio::test]
    async fn test_json_single_entry_fills_missing_fields() {
        let (mut collector, mut output, base) = started_collector(None).await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{}/ingest", base))
            .header("Content-Type", "application/json")
            .body(r#"{"message":"pushed"}"#)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        let entry = output.recv().await.unwrap();
        assert_eq!(entry.message, "pushed");
        assert_eq!(entry.source, "api");
        assert_eq!(entry.host, "host-1");
        assert!(!entry.id.is_empty());

        collector.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_json_array_and_text_plain() {
        let (mut collector, mut output, base) = started_collector(None).await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{}/ingest", base))
            .header("Content-Type", "application/json")
            .body(r#"[{"message":"one"},{"message":"two"}]"#)
            .send()
            .await
            .unwrap();
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["received"], 2);

        assert_eq!(output.recv().await.unwrap().message, "one");
        assert_eq!(output.recv().await.unwrap().message, "two");

        let resp = client
            .post(format!("{}/ingest", base))
            .header("Content-Type", "text/plain")
            .body("raw text line")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let entry = output.recv().await.unwrap();
        assert_eq!(entry.raw, "raw text line");
        assert_eq!(entry.level, LogLevel::Info);

        collector.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_bearer_token_is_enforced() {
        let (mut collector, mut output, base) =
            started_collector(Some("sekrit".to_string())).await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{}/ingest", base))
            .header("Content-Type", "application/json")
            .body(r#"{"message":"nope"}"#)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 401);

        let resp = client
            .post(format!("{}/ingest", base))
            .header("Content-Type", "application/json")
            .bearer_auth("sekrit")
            .body(r#"{"message":"yep"}"#)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(output.recv().await.unwrap().message, "yep");

        collector.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_json_is_rejected() {
        let (mut collector, _output, base) = started_collector(None).await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{}/ingest", base))
            .header("Content-Type", "application/json")
            .body("{broken")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        assert_eq!(collector.stats().error_count, 1);

        collector.stop().await.unwrap();
    }
}
