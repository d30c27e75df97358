use clap::Parser;
use logpipe::agent::AgentRunner;
use logpipe::config::load_agent_config;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "logpipe-agent")]
#[command(about = "Host-resident log collection agent", long_about = None)]
struct Cli {
    /// Path to the agent configuration file.
    #[arg(short, long, default_value = "configs/agent.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match load_agent_config(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load config {}: {}", cli.config.display(), e);
            std::process::exit(1);
        }
    };

    let default_filter = config
        .agent
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

    let runner = match AgentRunner::new(config) {
        Ok(runner) => runner,
        Err(e) => {
            eprintln!("failed to start agent: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runner.run().await {
        eprintln!("agent error: {}", e);
        std::process::exit(1);
    }
}
