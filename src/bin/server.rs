use clap::Parser;
use logpipe::config::load_server_config;
use logpipe::server::ServerRunner;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "logpipe-server")]
#[command(about = "Log ingestion and query server", long_about = None)]
struct Cli {
    /// Path to the server configuration file.
    #[arg(short, long, default_value = "configs/server.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match load_server_config(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load config {}: {}", cli.config.display(), e);
            std::process::exit(1);
        }
    };

    let default_filter = config
        .server
        .log_level
        .clone()
        .map(|level| format!("logpipe={}", level))
        .unwrap_or_else(|| "logpipe=info".to_string());
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = ServerRunner::new(config).run().await {
        eprintln!("server error: {}", e);
        std::process::exit(1);
    }
}
