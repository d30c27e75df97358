use super::types::*;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("validation failed:\n{}", .0.join("\n"))]
    ValidationList(Vec<String>),

    #[error("validation failed: {0}")]
    Validation(String),
}

/// Loads and validates the agent configuration.
pub fn load_agent_config(path: &Path) -> Result<AgentConfig, ConfigError> {
    let yaml = read_config_file(path)?;
    let config: AgentConfig = serde_yaml::from_str(&yaml)?;
    validate_agent_config(&config)?;
    Ok(config)
}

/// Loads and validates the server configuration.
pub fn load_server_config(path: &Path) -> Result<ServerConfig, ConfigError> {
    let yaml = read_config_file(path)?;
    let config: ServerConfig = serde_yaml::from_str(&yaml)?;
    validate_server_config(&config)?;
    Ok(config)
}

fn read_config_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to read config file '{}': {}", path.display(), e),
        ))
    })
}

fn validate_agent_config(config: &AgentConfig) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    if config.agent.id.trim().is_empty() {
        errors.push("agent.id must not be empty".to_string());
    }

    if !config.inputs.iter().any(|i| i.enabled) {
        errors.push("at least one enabled input is required".to_string());
    }

    for input in &config.inputs {
        if !input.enabled {
            continue;
        }
        match input.input_type {
            InputType::File => {
                if input.paths.is_empty() {
                    errors.push(format!("input '{}': file input requires paths", input.name));
                }
            }
            InputType::Syslog => {
                if input.address.is_none() {
                    errors.push(format!(
                        "input '{}': syslog input requires an address",
                        input.name
                    ));
                }
            }
            InputType::Http => {
                if input.listen_address.is_none() {
                    errors.push(format!(
                        "input '{}': http input requires a listen_address",
                        input.name
                    ));
                }
            }
        }
    }

    if config.output.hosts.is_empty() {
        errors.push("output.hosts must list at least one endpoint".to_string());
    }
    match config.output.compression.as_str() {
        "none" | "gzip" => {}
        other => errors.push(format!("output.compression '{}' is not supported", other)),
    }
    if config.output.batch_size == 0 {
        errors.push("output.batch_size must be positive".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationList(errors))
    }
}

fn validate_server_config(config: &ServerConfig) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    if config.storage.path.as_os_str().is_empty() {
        errors.push("storage.path must not be empty".to_string());
    }
    if config.server.http_port == 0 {
        errors.push("server.http_port must not be zero".to_string());
    }

    for pipeline in &config.pipelines {
        if pipeline.name.trim().is_empty() {
            errors.push("pipelines[].name must not be empty".to_string());
        }
        if pipeline.workers == 0 {
            errors.push(format!(
                "pipeline '{}': workers must be positive",
                pipeline.name
            ));
        }
        if let Some(spec) = &pipeline.parser {
            let parser_config = spec.to_parser_config();
            if let Err(e) = crate::parser::new_parser(&parser_config) {
                errors.push(format!("pipeline '{}': {}", pipeline.name, e));
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationList(errors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    fn write_config(yaml: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_load_agent_config_with_defaults() {
        let file = write_config(
            r#"
agent:
  id: web-01
inputs:
  - type: file
    name: system
    paths: ["/var/log/*.log"]
    exclude: ["*.gz"]
output:
  hosts: ["http://localhost:8080"]
"#,
        );

        let config = load_agent_config(file.path()).unwrap();
        assert_eq!(config.agent.id, "web-01");
        assert_eq!(config.agent.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.output.batch_size, 1000);
        assert_eq!(config.output.batch_timeout, Duration::from_secs(5));
        assert_eq!(config.output.max_retries, 3);
        assert_eq!(config.output.compression, "gzip");
        assert_eq!(config.buffer.buffer_type, BufferType::Memory);
    }

    #[test]
    fn test_load_agent_config_full() {
        let file = write_config(
            r#"
agent:
  id: edge-7
  name: edge
  tags: [prod, eu]
  heartbeat_interval: 10s
inputs:
  - type: syslog
    name: net
    address: "0.0.0.0:5514"
    protocol: udp
  - type: http
    name: api
    listen_address: "127.0.0.1:8081"
  - type: file
    name: nginx
    enabled: false
    paths: []
output:
  type: http
  hosts: ["http://a:8080", "http://b:8080"]
  compression: none
  batch_size: 500
  batch_timeout: 2s
  max_retries: 5
  api_key: secret
buffer:
  type: disk
  size: 104857600
  path: /tmp/agent-buffer
  flush_interval: 1s
"#,
        );

        let config = load_agent_config(file.path()).unwrap();
        assert_eq!(config.inputs.len(), 3);
        assert_eq!(config.inputs[0].protocol, Some(SyslogProtocol::Udp));
        assert!(!config.inputs[2].enabled);
        assert_eq!(config.output.hosts.len(), 2);
        assert_eq!(config.output.api_key.as_deref(), Some("secret"));
        assert_eq!(config.buffer.buffer_type, BufferType::Disk);
        assert_eq!(config.buffer.flush_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_agent_validation_failures() {
        let file = write_config(
            r#"
agent:
  id: ""
inputs:
  - type: file
    name: empty
    paths: []
output:
  hosts: []
  compression: snappy
"#,
        );

        let err = load_agent_config(file.path()).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("agent.id"));
        assert!(message.contains("requires paths"));
        assert!(message.contains("output.hosts"));
        assert!(message.contains("snappy"));
    }

    #[test]
    fn test_load_server_config() {
        let file = write_config(
            r#"
server:
  http_port: 9000
  api_keys: [k1, k2]
  rate_limit: 50
storage:
  path: /tmp/logpipe-data
  retention: 7d
  compaction_interval: 1h
pipelines:
  - name: default
    parser: json
  - name: access
    parser:
      type: regex
      pattern: "^(?P<level>\\w+) (?P<message>.+)$"
    processors:
      - type: add_fields
        fields:
          env: prod
    workers: 2
"#,
        );

        let config = load_server_config(file.path()).unwrap();
        assert_eq!(config.server.http_port, 9000);
        assert_eq!(config.server.grpc_port, 9090);
        assert_eq!(config.server.rate_limit, 50);
        assert_eq!(config.storage.retention, Duration::from_secs(7 * 86400));
        assert_eq!(config.storage.compaction_interval, Duration::from_secs(3600));
        assert_eq!(config.pipelines.len(), 2);
        assert_eq!(config.pipelines[1].workers, 2);

        let parser = config.pipelines[1].parser.as_ref().unwrap().to_parser_config();
        assert_eq!(parser.parser_type, "regex");
        assert!(parser.pattern.is_some());
    }

    #[test]
    fn test_server_validation_rejects_bad_parser() {
        let file = write_config(
            r#"
server: {}
storage:
  path: /tmp/data
pipelines:
  - name: broken
    parser: grok
"#,
        );

        let err = load_server_config(file.path()).unwrap_err();
        assert!(err.to_string().contains("unsupported parser type"));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = load_agent_config(Path::new("/nonexistent/agent.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
