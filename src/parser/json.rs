use crate::model::{LogEntry, LogLevel};
use crate::parser::{parse_timestamp, ParseError, Parser, ParserConfig};
use chrono::{DateTime, TimeZone, Utc};

/// Parses the raw line as a JSON object, merging its keys into the
/// entry's structured fields and lifting the well-known message, level
/// and timestamp keys into their dedicated slots.
pub struct JsonParser {
    time_field: String,
    time_format: Option<String>,
}

impl JsonParser {
    pub fn new(config: &ParserConfig) -> Self {
        Self {
            time_field: config
                .time_field
                .clone()
                .unwrap_or_else(|| "timestamp".to_string()),
            time_format: config.time_format.clone(),
        }
    }

    fn lift_timestamp(&self, value: &serde_json::Value) -> Option<DateTime<Utc>> {
        match value {
            serde_json::Value::String(s) => parse_timestamp(s, self.time_format.as_deref()),
            serde_json::Value::Number(n) => {
                // Numeric timestamps are Unix seconds.
                n.as_f64()
                    .and_then(|secs| Utc.timestamp_opt(secs as i64, 0).single())
            }
            _ => None,
        }
    }
}

impl Parser for JsonParser {
    fn parse(&self, entry: &mut LogEntry) -> Result<(), ParseError> {
        let data: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&entry.raw)?;

        for (key, value) in &data {
            entry.add_field(key.clone(), value.clone());
        }

        if let Some(msg) = data.get("message").and_then(|v| v.as_str()) {
            entry.message = msg.to_string();
        } else if let Some(msg) = data.get("msg").and_then(|v| v.as_str()) {
            entry.message = msg.to_string();
        }

        if let Some(level) = data.get("level").and_then(|v| v.as_str()) {
            entry.level = LogLevel::from_str_lossy(level);
        }

        if let Some(ts) = data.get(&self.time_field) {
            if let Some(timestamp) = self.lift_timestamp(ts) {
                entry.timestamp = timestamp;
            }
        }

        Ok(())
    }

    fn name(&self) -> &str {
        "json"
    }
}
