use crate::model::LogEntry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Envelope for a group of log entries in flight from an agent to a
/// server. The batch is the atomic unit of retry: it is either accepted
/// as a whole or retried as a whole.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: Uuid,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub compressed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression_type: Option<String>,
    pub entries: Vec<LogEntry>,
}

impl Batch {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: source.into(),
            timestamp: Utc::now(),
            compressed: false,
            compression_type: None,
            entries: Vec::new(),
        }
    }

    pub fn add(&mut self, entry: LogEntry) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_accumulates_in_order() {
        let mut batch = Batch::new("agent-1");
        for i in 0..5 {
            let mut entry = LogEntry::new();
            entry.id = format!("e{}", i);
            batch.add(entry);
        }
        assert_eq!(batch.len(), 5);
        let ids: Vec<&str> = batch.entries.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["e0", "e1", "e2", "e3", "e4"]);
    }

    #[test]
    fn test_wire_shape() {
        let mut batch = Batch::new("agent-1");
        let mut entry = LogEntry::new();
        entry.id = "x".into();
        batch.add(entry);

        let value: serde_json::Value = serde_json::to_value(&batch).unwrap();
        assert!(value.get("id").is_some());
        assert_eq!(value["source"], "agent-1");
        assert_eq!(value["compressed"], false);
        assert!(value.get("compression_type").is_none());
        assert_eq!(value["entries"].as_array().unwrap().len(), 1);
    }
}
