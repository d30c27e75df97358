pub mod parse;
pub mod types;

pub use parse::{load_agent_config, load_server_config, ConfigError};
pub use types::{AgentConfig, ServerConfig};
