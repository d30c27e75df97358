use crate::model::{LogEntry, LogLevel};
use crate::parser::{parse_timestamp, ParseError, Parser, ParserConfig};
use regex::Regex;

/// Parses the raw line with a named-capture-group pattern. Every named
/// group becomes a structured field; the `message`, `level` and
/// `timestamp` groups additionally lift into their dedicated slots.
pub struct RegexParser {
    pattern: Regex,
    time_format: Option<String>,
}

impl RegexParser {
    pub fn new(config: &ParserConfig) -> Result<Self, ParseError> {
        let pattern = config.pattern.as_deref().ok_or(ParseError::MissingPattern)?;
        Ok(Self {
            pattern: Regex::new(pattern)?,
            time_format: config.time_format.clone(),
        })
    }
}

impl Parser for RegexParser {
    fn parse(&self, entry: &mut LogEntry) -> Result<(), ParseError> {
        let captures = self
            .pattern
            .captures(&entry.raw)
            .ok_or(ParseError::PatternMismatch)?;

        let mut lifted: Vec<(String, String)> = Vec::new();
        for name in self.pattern.capture_names().flatten() {
            if let Some(m) = captures.name(name) {
                lifted.push((name.to_string(), m.as_str().to_string()));
            }
        }

        for (name, value) in lifted {
            match name.as_str() {
                "message" => entry.message = value.clone(),
                "level" => entry.level = LogLevel::from_str_lossy(&value),
                "timestamp" => {
                    if let Some(ts) = parse_timestamp(&value, self.time_format.as_deref()) {
                        entry.timestamp = ts;
                    }
                }
                _ => {}
            }
            entry.add_field(name, value);
        }

        Ok(())
    }

    fn name(&self) -> &str {
        "regex"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn parser(pattern: &str) -> RegexParser {
        let mut config = ParserConfig::of_type("regex");
        config.pattern = Some(pattern.to_string());
        RegexParser::new(&config).unwrap()
    }

    #[test]
    fn test_named_groups_lift_into_slots() {
        let parser = parser(r"^(?P<timestamp>\S+) (?P<level>\w+) (?P<message>.+)$");

        let mut entry = LogEntry::new();
        entry.raw = "2024-01-01T12:00:00Z ERROR something went wrong".to_string();
        parser.parse(&mut entry).unwrap();

        assert_eq!(entry.message, "something went wrong");
        assert_eq!(entry.level, LogLevel::Error);
        assert_eq!(
            entry.timestamp,
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
        );
        assert_eq!(
            entry.get_field("level").unwrap(),
            &serde_json::json!("ERROR")
        );
    }

    #[test]
    fn test_custom_groups_become_fields() {
        let parser = parser(r"^user=(?P<user>\w+) action=(?P<action>\w+)$");

        let mut entry = LogEntry::new();
        entry.raw = "user=alice action=login".to_string();
        parser.parse(&mut entry).unwrap();

        assert_eq!(entry.get_field("user").unwrap(), &serde_json::json!("alice"));
        assert_eq!(
            entry.get_field("action").unwrap(),
            &serde_json::json!("login")
        );
    }

    #[test]
    fn test_mismatch_is_an_error() {
        let parser = parser(r"^(?P<level>\w+):");
        let mut entry = LogEntry::new();
        entry.raw = "no colon here".to_string();
        assert!(matches!(
            parser.parse(&mut entry),
            Err(ParseError::PatternMismatch)
        ));
    }

    #[test]
    fn test_invalid_pattern_rejected_at_construction() {
        let mut config = ParserConfig::of_type("regex");
        config.pattern = Some("(unclosed".to_string());
        assert!(matches!(
            RegexParser::new(&config),
            Err(ParseError::InvalidPattern(_))
        ));
    }
}
