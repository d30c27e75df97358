use crate::model::{LogEntry, LogLevel};
use crate::parser::{ParseError, Parser};
use chrono::{DateTime, Utc};
use regex::Regex;

const COMBINED_PATTERN: &str =
    r#"^(\S+) \S+ (\S+) \[([^\]]+)\] "(\S+) (\S+) (\S+)" (\d+) (\d+) "([^"]*)" "([^"]*)""#;

const FIELD_NAMES: [&str; 10] = [
    "remote_addr",
    "remote_user",
    "time_local",
    "request_method",
    "request_path",
    "request_protocol",
    "status",
    "body_bytes_sent",
    "http_referer",
    "http_user_agent",
];

/// Parses the nginx combined access-log format. Severity is derived
/// from the response status: 5xx maps to ERROR, 4xx to WARN, the rest
/// to INFO.
pub struct NginxParser {
    pattern: Regex,
}

impl NginxParser {
    pub fn new() -> Self {
        Self {
            // The pattern is a fixed literal, so compilation cannot fail.
            pattern: Regex::new(COMBINED_PATTERN).unwrap(),
        }
    }
}

impl Default for NginxParser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser for NginxParser {
    fn parse(&self, entry: &mut LogEntry) -> Result<(), ParseError> {
        let captures = self
            .pattern
            .captures(&entry.raw)
            .ok_or(ParseError::PatternMismatch)?;

        let mut values: [String; 10] = Default::default();
        for (i, value) in values.iter_mut().enumerate() {
            *value = captures
                .get(i + 1)
                .map(|m| m.as_str())
                .unwrap_or("")
                .to_string();
        }
        drop(captures);

        for (name, value) in FIELD_NAMES.iter().zip(values.iter()) {
            entry.add_field(*name, value.as_str());
        }

        // method path protocol - status
        entry.message = format!("{} {} {} - {}", values[3], values[4], values[5], values[6]);

        if let Ok(ts) = DateTime::parse_from_str(&values[2], "%d/%b/%Y:%H:%M:%S %z") {
            entry.timestamp = ts.with_timezone(&Utc);
        }

        let status: u16 = values[6].parse().unwrap_or(0);
        entry.level = if status >= 500 {
            LogLevel::Error
        } else if status >= 400 {
            LogLevel::Warn
        } else {
            LogLevel::Info
        };

        Ok(())
    }

    fn name(&self) -> &str {
        "nginx"
    }
}
