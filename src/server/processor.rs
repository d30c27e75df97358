use crate::config::types::ProcessorConfig;
use crate::model::LogEntry;
use regex::Regex;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProcessError {
    /// The processor decided to drop the entry. Counted, not logged;
    /// this is a routine outcome rather than a fault.
    #[error("entry filtered out")]
    Filtered,

    #[error("unsupported processor type: {0}")]
    UnsupportedType(String),

    #[error("invalid processor config: {0}")]
    InvalidConfig(String),
}

impl std::fmt::Debug for dyn Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dyn Processor")
    }
}

/// A processor mutates a log entry in place, or signals that the entry
/// should be dropped.
pub trait Processor: Send + Sync {
    fn process(&self, entry: &mut LogEntry) -> Result<(), ProcessError>;

    fn name(&self) -> &str;
}

/// Builds a processor from configuration, keyed on the `type` tag.
pub fn new_processor(config: &ProcessorConfig) -> Result<Box<dyn Processor>, ProcessError> {
    match config.processor_type.as_str() {
        "add_fields" => Ok(Box::new(AddFields {
            fields: config.fields.clone(),
        })),
        "rename_fields" => {
            let mapping = config
                .fields
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect();
            Ok(Box::new(RenameFields { mapping }))
        }
        "drop_fields" => Ok(Box::new(DropFields {
            fields: field_list(config)?,
        })),
        "lowercase" => Ok(Box::new(Lowercase {
            fields: field_list(config)?,
        })),
        "trim" => Ok(Box::new(Trim {
            fields: field_list(config)?,
        })),
        "filter" => {
            let field = config
                .fields
                .get("field")
                .and_then(|v| v.as_str())
                .ok_or_else(|| ProcessError::InvalidConfig("filter requires 'field'".into()))?
                .to_string();
            let pattern = config
                .fields
                .get("pattern")
                .and_then(|v| v.as_str())
                .ok_or_else(|| ProcessError::InvalidConfig("filter requires 'pattern'".into()))?;
            let pattern = Regex::new(pattern)
                .map_err(|e| ProcessError::InvalidConfig(e.to_string()))?;
            let drop_if_match = config
                .fields
                .get("drop_if_match")
                .and_then(|v| v.as_bool())
                .unwrap_or(true);
            Ok(Box::new(Filter {
                field,
                pattern,
                drop_if_match,
            }))
        }
        other => Err(ProcessError::UnsupportedType(other.to_string())),
    }
}

fn field_list(config: &ProcessorConfig) -> Result<Vec<String>, ProcessError> {
    let list = config
        .fields
        .get("fields")
        .and_then(|v| v.as_array())
        .ok_or_else(|| ProcessError::InvalidConfig("expected a 'fields' list".into()))?;
    Ok(list
        .iter()
        .filter_map(|v| v.as_str().map(|s| s.to_string()))
        .collect())
}

struct AddFields {
    fields: HashMap<String, serde_json::Value>,
}

impl Processor for AddFields {
    fn process(&self, entry: &mut LogEntry) -> Result<(), ProcessError> {
        for (key, value) in &self.fields {
            entry.add_field(key.clone(), value.clone());
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "add_fields"
    }
}

struct RenameFields {
    mapping: HashMap<String, String>,
}

impl Processor for RenameFields {
    fn process(&self, entry: &mut LogEntry) -> Result<(), ProcessError> {
        for (old, new) in &self.mapping {
            if let Some(value) = entry.fields.remove(old) {
                entry.add_field(new.clone(), value);
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "rename_fields"
    }
}

struct DropFields {
    fields: Vec<String>,
}

impl Processor for DropFields {
    fn process(&self, entry: &mut LogEntry) -> Result<(), ProcessError> {
        for field in &self.fields {
            entry.fields.remove(field);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "drop_fields"
    }
}

struct Lowercase {
    fields: Vec<String>,
}

impl Processor for Lowercase {
    fn process(&self, entry: &mut LogEntry) -> Result<(), ProcessError> {
        for field in &self.fields {
            if let Some(serde_json::Value::String(s)) = entry.fields.get_mut(field) {
                *s = s.to_lowercase();
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "lowercase"
    }
}

struct Trim {
    fields: Vec<String>,
}

impl Processor for Trim {
    fn process(&self, entry: &mut LogEntry) -> Result<(), ProcessError> {
        for field in &self.fields {
            if let Some(serde_json::Value::String(s)) = entry.fields.get_mut(field) {
                *s = s.trim().to_string();
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "trim"
    }
}

struct Filter {
    field: String,
    pattern: Regex,
    drop_if_match: bool,
}

impl Processor for Filter {
    fn process(&self, entry: &mut LogEntry) -> Result<(), ProcessError> {
        let value = match entry.get_field(&self.field).and_then(|v| v.as_str()) {
            Some(value) => value,
            None => return Ok(()),
        };
        let matches = self.pattern.is_match(value);
        if matches == self.drop_if_match {
            return Err(ProcessError::Filtered);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "filter"
    }
}
