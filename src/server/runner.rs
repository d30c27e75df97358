use crate::config::types::{PipelineConfig, ServerConfig};
use crate::model::LogEntry;
use crate::server::pipeline::{Pipeline, PipelineError};
use crate::server::query::{QueryConfig, QueryEngine};
use crate::server::receiver::{Receiver, ReceiverConfig};
use crate::server::store::{FileStore, StoreConfig, StoreError};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

const CHANNEL_CAPACITY: usize = 10_000;
const HTTP_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Wires receiver, pipelines, store and query engine together:
/// receiver → inbound channel → pipeline workers → outbound channel →
/// store writer, with the query engine reading the store.
pub struct ServerRunner {
    config: ServerConfig,
}

impl ServerRunner {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    pub async fn run(self) -> Result<(), ServerError> {
        let store = Arc::new(FileStore::open(StoreConfig {
            path: self.config.storage.path.clone(),
            partition_interval: self.config.storage.compaction_interval,
        })?);
        info!(path = %self.config.storage.path.display(), "storage initialized");

        let engine = Arc::new(QueryEngine::new(Arc::clone(&store), QueryConfig::default()));

        let (inbound_tx, inbound_rx) = mpsc::channel::<LogEntry>(CHANNEL_CAPACITY);
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<LogEntry>(CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let receiver = Receiver::new(
            ReceiverConfig {
                api_keys: self.config.server.api_keys.clone(),
                rate_limit: self.config.server.rate_limit,
                max_batch_size: self.config.server.max_batch_size,
            },
            inbound_tx,
            Arc::clone(&engine),
        );

        // All pipelines share the single inbound channel.
        let shared_inbound = Arc::new(tokio::sync::Mutex::new(inbound_rx));
        let pipeline_configs = if self.config.pipelines.is_empty() {
            vec![PipelineConfig {
                name: "default".to_string(),
                filter: None,
                parser: None,
                processors: Vec::new(),
                workers: 4,
            }]
        } else {
            self.config.pipelines.clone()
        };

        let mut pipelines = Vec::new();
        for pipeline_config in &pipeline_configs {
            let pipeline = Pipeline::from_config(pipeline_config)?;
            pipeline.start(
                pipeline_config.workers,
                Arc::clone(&shared_inbound),
                outbound_tx.clone(),
                shutdown_rx.clone(),
            );
            info!(pipeline = %pipeline.name(), "pipeline initialized");
            pipelines.push(pipeline);
        }
        drop(outbound_tx);

        let writer_task = {
            let store = Arc::clone(&store);
            let mut shutdown = shutdown_rx.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        entry = outbound_rx.recv() => {
                            match entry {
                                Some(entry) => {
                                    if let Err(e) = store.write(&entry) {
                                        error!(error = %e, "failed to write entry");
                                    }
                                }
                                None => break,
                            }
                        }
                        _ = shutdown.changed() => {
                            // Drain what the pipelines already emitted.
                            while let Ok(entry) = outbound_rx.try_recv() {
                                if let Err(e) = store.write(&entry) {
                                    error!(error = %e, "failed to write entry");
                                }
                            }
                            break;
                        }
                    }
                }
            })
        };

        let retention_task = {
            let store = Arc::clone(&store);
            let retention = self.config.storage.retention;
            let mut shutdown = shutdown_rx.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(3600));
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let cutoff = chrono::Utc::now()
                                - chrono::Duration::from_std(retention)
                                    .unwrap_or_else(|_| chrono::Duration::days(30));
                            if let Err(e) = store.delete(cutoff) {
                                error!(error = %e, "retention sweep failed");
                            }
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            })
        };

        let addr: SocketAddr = ([0, 0, 0, 0], self.config.server.http_port).into();
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(addr = %addr, "HTTP receiver listening");

        let server_task = {
            let router = receiver.router();
            let mut shutdown = shutdown_rx.clone();
            tokio::spawn(async move {
                axum::serve(
                    listener,
                    router.into_make_service_with_connect_info::<SocketAddr>(),
                )
                .with_graceful_shutdown(async move {
                    let _ = shutdown.changed().await;
                })
                .await
            })
        };

        info!(
            http_port = self.config.server.http_port,
            pipelines = pipelines.len(),
            "server started"
        );

        wait_for_signal().await;
        info!("shutdown signal received, stopping server");
        let _ = shutdown_tx.send(true);

        match tokio::time::timeout(HTTP_SHUTDOWN_GRACE, server_task).await {
            Ok(Ok(Ok(()))) => info!("HTTP server stopped"),
            Ok(Ok(Err(e))) => error!(error = %e, "HTTP server error"),
            Ok(Err(e)) => error!(error = %e, "HTTP server join error"),
            Err(_) => warn!("HTTP server shutdown timed out"),
        }

        for pipeline in &pipelines {
            pipeline.stop().await;
        }
        let _ = writer_task.await;
        let _ = retention_task.await;
        store.close();

        let stats = engine.stats();
        info!(
            total_entries = stats.store.total_entries,
            cache_entries = stats.cache_entries,
            "server stopped"
        );
        Ok(())
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
