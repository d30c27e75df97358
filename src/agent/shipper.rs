use crate::model::{Batch, LogEntry};
use flate2::write::GzEncoder;
use flate2::Compression;
use rand::Rng;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum ShipError {
    #[error("shipper queue is full")]
    QueueFull,

    #[error("shipper is closed")]
    Closed,

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("compression failed: {0}")]
    Compression(#[from] std::io::Error),

    #[error("server returned status {status}: {message}")]
    Server { status: u16, message: String },

    #[error("no eligible endpoints")]
    NoEndpoints,

    #[error("gave up after {0} attempts")]
    RetriesExhausted(u32),
}

#[derive(Debug, Clone)]
pub struct ShipperConfig {
    pub endpoints: Vec<String>,
    pub compression: String,
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub timeout: Duration,
    pub api_key: Option<String>,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_timeout: Duration,
}

impl Default for ShipperConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["http://localhost:8080".to_string()],
            compression: "gzip".to_string(),
            batch_size: 1000,
            batch_timeout: Duration::from_secs(5),
            max_retries: 3,
            retry_backoff: Duration::from_secs(1),
            timeout: Duration::from_secs(30),
            api_key: None,
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_secs(30),
        }
    }
}

/// Circuit breaker state of one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct Breaker {
    state: CircuitState,
    consecutive_failures: u32,
    successes: u32,
    last_failure: Option<Instant>,
}

/// A server endpoint guarded by its own breaker mutex, so recording an
/// outcome on one endpoint never contends with the others.
pub struct Endpoint {
    url: String,
    breaker: Mutex<Breaker>,
}

impl Endpoint {
    fn new(url: String) -> Self {
        Self {
            url,
            breaker: Mutex::new(Breaker {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                successes: 0,
                last_failure: None,
            }),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> CircuitState {
        self.breaker.lock().unwrap().state
    }

    /// Checks eligibility, promoting Open to HalfOpen once the open
    /// timeout has elapsed since the last failure.
    fn is_eligible(&self, open_timeout: Duration) -> bool {
        let mut breaker = self.breaker.lock().unwrap();
        match breaker.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = breaker
                    .last_failure
                    .map(|t| t.elapsed() >= open_timeout)
                    .unwrap_or(true);
                if elapsed {
                    breaker.state = CircuitState::HalfOpen;
                    breaker.successes = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn record_success(&self, success_threshold: u32) {
        let mut breaker = self.breaker.lock().unwrap();
        breaker.consecutive_failures = 0;
        breaker.successes += 1;

        if breaker.state == CircuitState::HalfOpen && breaker.successes >= success_threshold {
            breaker.state = CircuitState::Closed;
            breaker.successes = 0;
        }
    }

    fn record_failure(&self, failure_threshold: u32) {
        let mut breaker = self.breaker.lock().unwrap();
        breaker.consecutive_failures += 1;
        breaker.successes = 0;
        breaker.last_failure = Some(Instant::now());

        if breaker.state == CircuitState::HalfOpen
            || breaker.consecutive_failures >= failure_threshold
        {
            breaker.state = CircuitState::Open;
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ShipperStats {
    pub endpoints: Vec<EndpointStats>,
    pub queue_depth: usize,
    pub batches_dropped: u64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct EndpointStats {
    pub url: String,
    pub state: String,
    pub consecutive_failures: u32,
}

/// Accumulates entries into batches and transmits them with compression,
/// per-endpoint circuit breaking and retry with exponential backoff.
/// Under a sustained outage batches are shed rather than held forever.
pub struct Shipper {
    config: ShipperConfig,
    agent_id: String,
    client: reqwest::Client,
    input_tx: mpsc::Sender<LogEntry>,
    endpoints: RwLock<Vec<Arc<Endpoint>>>,
    batches_dropped: AtomicU64,
    task: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Shipper {
    pub fn new(config: ShipperConfig, agent_id: impl Into<String>) -> Result<Arc<Self>, ShipError> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;

        let endpoints = config
            .endpoints
            .iter()
            .map(|url| Arc::new(Endpoint::new(url.trim_end_matches('/').to_string())))
            .collect();

        let (input_tx, input_rx) = mpsc::channel(config.batch_size.max(1) * 2);
        let (shutdown_tx, _) = watch::channel(false);

        let shipper = Arc::new(Self {
            config,
            agent_id: agent_id.into(),
            client,
            input_tx,
            endpoints: RwLock::new(endpoints),
            batches_dropped: AtomicU64::new(0),
            task: Mutex::new(None),
            shutdown_tx,
        });

        let worker = Arc::clone(&shipper);
        let task = tokio::spawn(async move {
            worker.process_batches(input_rx).await;
        });
        *shipper.task.lock().unwrap() = Some(task);

        Ok(shipper)
    }

    /// Non-blocking enqueue; fails fast when the internal queue is
    /// saturated so the producer can keep the entry buffered.
    pub fn ship(&self, entry: LogEntry) -> Result<(), ShipError> {
        match self.input_tx.try_send(entry) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(ShipError::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(ShipError::Closed),
        }
    }

    pub fn ship_batch(&self, entries: Vec<LogEntry>) -> Result<(), ShipError> {
        for entry in entries {
            self.ship(entry)?;
        }
        Ok(())
    }

    pub fn stats(&self) -> ShipperStats {
        let endpoints = self
            .endpoints
            .read()
            .unwrap()
            .iter()
            .map(|ep| {
                let breaker = ep.breaker.lock().unwrap();
                EndpointStats {
                    url: ep.url.clone(),
                    state: match breaker.state {
                        CircuitState::Closed => "closed".to_string(),
                        CircuitState::Open => "open".to_string(),
                        CircuitState::HalfOpen => "half_open".to_string(),
                    },
                    consecutive_failures: breaker.consecutive_failures,
                }
            })
            .collect();

        ShipperStats {
            endpoints,
            queue_depth: self.input_tx.max_capacity() - self.input_tx.capacity(),
            batches_dropped: self.batches_dropped.load(Ordering::Relaxed),
        }
    }

    pub fn endpoint_states(&self) -> Vec<CircuitState> {
        self.endpoints
            .read()
            .unwrap()
            .iter()
            .map(|ep| ep.state())
            .collect()
    }

    /// Flushes the residual batch and stops the transmit task.
    pub async fn close(&self) {
        let _ = self.shutdown_tx.send(true);
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    async fn process_batches(&self, mut input_rx: mpsc::Receiver<LogEntry>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut ticker =
            tokio::time::interval(self.config.batch_timeout.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut batch = Batch::new(self.agent_id.clone());

        loop {
            tokio::select! {
                entry = input_rx.recv() => {
                    match entry {
                        Some(entry) => {
                            batch.add(entry);
                            if batch.len() >= self.config.batch_size {
                                self.dispatch(std::mem::replace(
                                    &mut batch,
                                    Batch::new(self.agent_id.clone()),
                                ))
                                .await;
                                ticker.reset();
                            }
                        }
                        None => break,
                    }
                }
                _ = ticker.tick() => {
                    if !batch.is_empty() {
                        self.dispatch(std::mem::replace(
                            &mut batch,
                            Batch::new(self.agent_id.clone()),
                        ))
                        .await;
                    }
                }
                _ = shutdown_rx.changed() => break,
            }
        }

        // Drain whatever was queued before the shutdown and flush the
        // residual batch.
        while let Ok(entry) = input_rx.try_recv() {
            batch.add(entry);
        }
        if !batch.is_empty() {
            info!(entries = batch.len(), "flushing residual batch on shutdown");
            self.dispatch(batch).await;
        }
    }

    async fn dispatch(&self, batch: Batch) {
        let entries = batch.len();
        if let Err(e) = self.send_with_retry(batch).await {
            self.batches_dropped.fetch_add(1, Ordering::Relaxed);
            error!(entries, error = %e, "dropping batch after failed delivery");
        }
    }

    async fn send_with_retry(&self, mut batch: Batch) -> Result<(), ShipError> {
        let gzip = self.config.compression == "gzip";
        batch.compressed = gzip;
        batch.compression_type = gzip.then(|| "gzip".to_string());
        let json = serde_json::to_vec(&batch)?;
        let body = if gzip { gzip_compress(&json)? } else { json };

        let max_attempts = self.config.max_retries.max(1);
        let mut last_err = ShipError::NoEndpoints;

        for attempt in 0..max_attempts {
            if attempt > 0 {
                let backoff = self.config.retry_backoff * 2u32.saturating_pow(attempt - 1);
                tokio::time::sleep(backoff).await;
            }

            let Some(endpoint) = self.select_endpoint() else {
                last_err = ShipError::NoEndpoints;
                continue;
            };

            match self.send(&endpoint, &batch, body.clone()).await {
                Ok(()) => {
                    endpoint.record_success(self.config.success_threshold);
                    debug!(endpoint = %endpoint.url, entries = batch.len(), "batch delivered");
                    return Ok(());
                }
                Err(e) => {
                    endpoint.record_failure(self.config.failure_threshold);
                    warn!(
                        endpoint = %endpoint.url,
                        attempt = attempt + 1,
                        error = %e,
                        "batch send failed"
                    );
                    last_err = e;
                }
            }
        }

        match last_err {
            ShipError::NoEndpoints => Err(ShipError::NoEndpoints),
            _ => Err(ShipError::RetriesExhausted(max_attempts)),
        }
    }

    async fn send(&self, endpoint: &Endpoint, batch: &Batch, body: Vec<u8>) -> Result<(), ShipError> {
        let url = format!("{}/api/v1/logs/ingest", endpoint.url);
        let mut request = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("X-Agent-ID", &self.agent_id);

        if batch.compressed {
            request = request.header("Content-Encoding", "gzip");
        }
        if let Some(api_key) = &self.config.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.body(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ShipError::Server {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }

    /// Uniform random pick among breaker-eligible endpoints; spreads
    /// load without a shared cursor.
    fn select_endpoint(&self) -> Option<Arc<Endpoint>> {
        let endpoints = self.endpoints.read().unwrap();
        let eligible: Vec<&Arc<Endpoint>> = endpoints
            .iter()
            .filter(|ep| ep.is_eligible(self.config.open_timeout))
            .collect();

        if eligible.is_empty() {
            return None;
        }
        let index = rand::thread_rng().gen_range(0..eligible.len());
        Some(Arc::clone(eligible[index]))
    }
}

fn gzip_compress(data: &[u8]) -> Result<Vec<u8>, std::io::Error> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    const FAILURES: u32 = 5;
    const SUCCESSES: u32 = 2;

    #[test]
    fn test_breaker_opens_after_consecutive_failures() {
        let ep = Endpoint::new("http://a".to_string());
        for _ in 0..FAILURES - 1 {
            ep.record_failure(FAILURES);
        }
        assert_eq!(ep.state(), CircuitState::Closed);

        ep.record_failure(FAILURES);
        assert_eq!(ep.state(), CircuitState::Open);
        assert!(!ep.is_eligible(Duration::from_secs(60)));
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let ep = Endpoint::new("http://a".to_string());
        for _ in 0..FAILURES - 1 {
            ep.record_failure(FAILURES);
        }
        ep.record_success(SUCCESSES);
        for _ in 0..FAILURES - 1 {
            ep.record_failure(FAILURES);
        }
        assert_eq!(ep.state(), CircuitState::Closed);
    }

    #[test]
    fn test_open_transitions_to_half_open_after_timeout() {
        let ep = Endpoint::new("http://a".to_string());
        for _ in 0..FAILURES {
            ep.record_failure(FAILURES);
        }
        assert_eq!(ep.state(), CircuitState::Open);

        // Not yet.
        assert!(!ep.is_eligible(Duration::from_secs(60)));
        // Zero timeout: eligible immediately, now probing.
        assert!(ep.is_eligible(Duration::ZERO));
        assert_eq!(ep.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_closes_after_success_threshold() {
        let ep = Endpoint::new("http://a".to_string());
        for _ in 0..FAILURES {
            ep.record_failure(FAILURES);
        }
        assert!(ep.is_eligible(Duration::ZERO));

        ep.record_success(SUCCESSES);
        assert_eq!(ep.state(), CircuitState::HalfOpen);
        ep.record_success(SUCCESSES);
        assert_eq!(ep.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_reopens_on_single_failure() {
        let ep = Endpoint::new("http://a".to_string());
        for _ in 0..FAILURES {
            ep.record_failure(FAILURES);
        }
        assert!(ep.is_eligible(Duration::ZERO));
        assert_eq!(ep.state(), CircuitState::HalfOpen);

        ep.record_failure(FAILURES);
        assert_eq!(ep.state(), CircuitState::Open);
    }

    #[test]
    fn test_gzip_round_trip() {
        use flate2::read::GzDecoder;
        use std::io::Read;

        let payload = br#"{"entries":[]}"#;
        let compressed = gzip_compress(payload).unwrap();
        assert_ne!(compressed, payload.to_vec());

        let mut decoder = GzDecoder::new(&compressed[..]);
        let mut decompressed = Vec::new();
        decoder.read_to_end(&mut decompressed).unwrap();
        assert_eq!(decompressed, payload);
    }

    #[tokio::test]
    async fn test_ship_reports_queue_full() {
        let config = ShipperConfig {
            endpoints: vec!["http://127.0.0.1:1".to_string()],
            batch_size: 1,
            // Long timeout so the batch task never drains during the test.
            batch_timeout: Duration::from_secs(3600),
            retry_backoff: Duration::from_secs(3600),
            ..Default::default()
        };
        let shipper = Shipper::new(config, "agent-test").unwrap();

        // Queue capacity is batch_size * 2 = 2; the worker may take a
        // couple off the queue before blocking on the dead endpoint.
        let mut saw_full = false;
        for i in 0..64 {
            let mut entry = LogEntry::new();
            entry.id = format!("e{}", i);
            if matches!(shipper.ship(entry), Err(ShipError::QueueFull)) {
                saw_full = true;
                break;
            }
        }
        assert!(saw_full, "expected QueueFull once saturated");
    }
}
