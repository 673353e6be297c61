//! Core record and batch types for the ingestion pipeline

use catalog_common::types::RowIndex;
use serde::{Deserialize, Serialize};

/// Raw record produced by upstream parsing
///
/// Columns keep their source order. Consumed exactly once by the validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    /// 1-based position in the source file
    pub row_index: RowIndex,
    pub fields: Vec<(String, String)>,
}

impl RawRecord {
    pub fn new(row_index: RowIndex, fields: Vec<(String, String)>) -> Self {
        Self { row_index, fields }
    }

    /// Build a record from header names and one row of values
    ///
    /// Missing trailing values become empty strings; extra values are dropped.
    pub fn from_columns(row_index: RowIndex, headers: &[String], values: &[String]) -> Self {
        let fields = headers
            .iter()
            .enumerate()
            .map(|(i, header)| (header.clone(), values.get(i).cloned().unwrap_or_default()))
            .collect();
        Self { row_index, fields }
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value.as_str())
    }

    /// Replace a column value, appending the column if absent
    pub fn set(&mut self, column: &str, value: impl Into<String>) {
        let value = value.into();
        match self.fields.iter_mut().find(|(name, _)| name == column) {
            Some((_, existing)) => *existing = value,
            None => self.fields.push((column.to_string(), value)),
        }
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(name, _)| name.as_str())
    }
}

/// A raw record that passed schema validation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatedRow {
    pub row_index: RowIndex,
    fields: Vec<(String, String)>,
}

impl ValidatedRow {
    pub fn new(row_index: RowIndex, fields: Vec<(String, String)>) -> Self {
        Self { row_index, fields }
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value.as_str())
    }

    /// Non-empty value for a column
    pub fn value(&self, column: &str) -> Option<&str> {
        self.get(column).map(str::trim).filter(|v| !v.is_empty())
    }

    pub fn fields(&self) -> &[(String, String)] {
        &self.fields
    }

    /// Render the row as a JSON object keyed by column name
    pub fn to_json(&self) -> serde_json::Value {
        let map = self
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect::<serde_json::Map<_, _>>();
        serde_json::Value::Object(map)
    }
}

impl From<RawRecord> for ValidatedRow {
    fn from(record: RawRecord) -> Self {
        Self {
            row_index: record.row_index,
            fields: record.fields,
        }
    }
}

/// Severity of a validation issue
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Warning,
    Error,
    Critical,
}

impl IssueSeverity {
    pub fn as_str(&self) -> &str {
        match self {
            IssueSeverity::Warning => "warning",
            IssueSeverity::Error => "error",
            IssueSeverity::Critical => "critical",
        }
    }

    /// Whether an issue of this severity keeps the row out of its batch
    pub fn rejects_row(&self) -> bool {
        matches!(self, IssueSeverity::Error | IssueSeverity::Critical)
    }
}

/// One finding produced while sanitizing or validating a row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub rule_id: String,
    pub rule_name: String,
    pub severity: IssueSeverity,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl ValidationIssue {
    pub fn new(
        rule_id: impl Into<String>,
        rule_name: impl Into<String>,
        severity: IssueSeverity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            rule_id: rule_id.into(),
            rule_name: rule_name.into(),
            severity,
            message: message.into(),
            field: None,
            suggestion: None,
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

/// All issues recorded for one source row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowIssues {
    pub row_index: RowIndex,
    pub issues: Vec<ValidationIssue>,
    /// Whether the row was kept out of `Batch::rows`
    pub rejected: bool,
}

/// Timing and memory recorded while a batch was assembled
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchMetadata {
    pub processing_time_ms: u64,
    pub memory_used_mb: f64,
}

/// Bounded, ordered group of validated rows plus every issue seen while building it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub batch_index: u64,
    pub start_row_index: RowIndex,
    pub end_row_index: RowIndex,
    pub rows: Vec<ValidatedRow>,
    pub issues: Vec<RowIssues>,
    pub metadata: BatchMetadata,
}

impl Batch {
    /// Rows consumed from the source, valid or not
    pub fn consumed_rows(&self) -> u64 {
        if self.end_row_index < self.start_row_index {
            return 0;
        }
        self.end_row_index - self.start_row_index + 1
    }

    pub fn rejected_rows(&self) -> usize {
        self.issues.iter().filter(|r| r.rejected).count()
    }
}
