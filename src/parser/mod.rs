pub mod json;
pub mod nginx;
pub mod regex;

pub use json::JsonParser;
pub use nginx::NginxParser;
pub use regex::RegexParser;

use crate::model::LogEntry;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("pattern did not match")]
    PatternMismatch,

    #[error("invalid pattern: {0}")]
    InvalidPattern(#[from] ::regex::Error),

    #[error("missing pattern for regex parser")]
    MissingPattern,

    #[error("unsupported parser type: {0}")]
    UnsupportedType(String),
}

/// A parser enriches a log entry in place from its raw line.
pub trait Parser: Send + Sync {
    fn parse(&self, entry: &mut LogEntry) -> Result<(), ParseError>;

    fn name(&self) -> &str;
}

/// Parser configuration, dispatched on the `type` tag.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParserConfig {
    #[serde(rename = "type")]
    pub parser_type: String,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub time_field: Option<String>,
    #[serde(default)]
    pub time_format: Option<String>,
}

impl ParserConfig {
    pub fn of_type(parser_type: impl Into<String>) -> Self {
        Self {
            parser_type: parser_type.into(),
            ..Default::default()
        }
    }
}

/// Builds a parser from its configuration tag.
pub fn new_parser(config: &ParserConfig) -> Result<Box<dyn Parser>, ParseError> {
    match config.parser_type.as_str() {
        "json" => Ok(Box::new(JsonParser::new(config))),
        "regex" => Ok(Box::new(RegexParser::new(config)?)),
        "nginx" => Ok(Box::new(NginxParser::new())),
        other => Err(ParseError::UnsupportedType(other.to_string())),
    }
}

/// Parses a timestamp string using the configured chrono format when
/// present, otherwise a sequence of common formats.
pub(crate) fn parse_timestamp(value: &str, format: Option<&str>) -> Option<DateTime<Utc>> {
    if let Some(fmt) = format {
        if let Ok(dt) = DateTime::parse_from_str(value, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }

    const NAIVE_FORMATS: &[&str] = &[
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y/%m/%d %H:%M:%S",
    ];
    for fmt in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_factory_dispatch() {
        assert_eq!(
            new_parser(&ParserConfig::of_type("json")).unwrap().name(),
            "json"
        );
        assert_eq!(
            new_parser(&ParserConfig::of_type("nginx")).unwrap().name(),
            "nginx"
        );
        assert!(matches!(
            new_parser(&ParserConfig::of_type("grok")),
            Err(ParseError::UnsupportedType(_))
        ));
    }

    #[test]
    fn test_regex_factory_requires_pattern() {
        assert!(matches!(
            new_parser(&ParserConfig::of_type("regex")),
            Err(ParseError::MissingPattern)
        ));
    }

    #[test]
    fn test_parse_timestamp_common_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        assert_eq!(
            parse_timestamp("2024-01-01T12:00:00Z", None).unwrap(),
            expected
        );
        assert_eq!(
            parse_timestamp("2024-01-01 12:00:00", None).unwrap(),
            expected
        );
        assert_eq!(
            parse_timestamp("2024/01/01 12:00:00", None).unwrap(),
            expected
        );
        assert!(parse_timestamp("not a time", None).is_none());
    }

    #[test]
    fn test_parse_timestamp_configured_format() {
        let expected = Utc.with_ymd_and_hms(2024, 6, 30, 23, 59, 1).unwrap();
        assert_eq!(
            parse_timestamp("30.06.2024 23:59:01", Some("%d.%m.%Y %H:%M:%S")).unwrap(),
            expected
        );
    }
}
