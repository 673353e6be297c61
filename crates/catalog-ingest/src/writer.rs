//! Domain writers
//!
//! The [`DomainWriter`] persists one validated row. Errors are row-level and
//! only ever seen by the recovery manager.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::WriteError;
use crate::types::ValidatedRow;

/// Result of persisting one row
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteResult {
    /// Identifier of the created or updated entity
    pub entity_id: Option<String>,
    /// `false` when an existing entity was updated
    pub created: bool,
}

impl WriteResult {
    pub fn created(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: Some(entity_id.into()),
            created: true,
        }
    }
}

#[async_trait]
pub trait DomainWriter: Send + Sync {
    async fn write(&self, row: &ValidatedRow) -> Result<WriteResult, WriteError>;
}

/// Accepts every row without side effects
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunWriter;

#[async_trait]
impl DomainWriter for DryRunWriter {
    async fn write(&self, row: &ValidatedRow) -> Result<WriteResult, WriteError> {
        Ok(WriteResult {
            entity_id: Some(format!("row-{}", row.row_index)),
            created: false,
        })
    }
}

/// Appends each row as one JSON object per line
pub struct JsonLinesWriter {
    path: PathBuf,
    key_field: Option<String>,
    file: Mutex<Option<tokio::fs::File>>,
}

impl JsonLinesWriter {
    pub fn new(path: impl Into<PathBuf>, key_field: Option<String>) -> Self {
        Self {
            path: path.into(),
            key_field,
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DomainWriter for JsonLinesWriter {
    async fn write(&self, row: &ValidatedRow) -> Result<WriteResult, WriteError> {
        let mut line = serde_json::to_vec(&serde_json::json!({
            "row_index": row.row_index,
            "fields": row.to_json(),
        }))
        .map_err(|e| WriteError::new(format!("Failed to encode row: {}", e)))?;
        line.push(b'\n');

        let mut guard = self.file.lock().await;
        if guard.is_none() {
            if let Some(parent) = self.path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| WriteError::new(format!("Failed to create output directory: {}", e)))?;
            }
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await
                .map_err(|e| WriteError::new(format!("Failed to open {}: {}", self.path.display(), e)))?;
            *guard = Some(file);
        }
        if let Some(file) = guard.as_mut() {
            file.write_all(&line)
                .await
                .map_err(|e| WriteError::new(format!("Failed to append row: {}", e)))?;
            file.flush()
                .await
                .map_err(|e| WriteError::new(format!("Failed to flush row: {}", e)))?;
        }

        let entity_id = self
            .key_field
            .as_deref()
            .and_then(|k| row.value(k))
            .map(str::to_string)
            .unwrap_or_else(|| format!("row-{}", row.row_index));
        Ok(WriteResult::created(entity_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(index: u64, sku: &str) -> ValidatedRow {
        ValidatedRow::new(index, vec![("sku".to_string(), sku.to_string())])
    }

    #[tokio::test]
    async fn test_json_lines_writer_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("rows.jsonl");
        let writer = JsonLinesWriter::new(&path, Some("sku".to_string()));

        let first = writer.write(&row(1, "A-1")).await.unwrap();
        writer.write(&row(2, "A-2")).await.unwrap();
        assert_eq!(first, WriteResult::created("A-1"));

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["fields"]["sku"], "A-2");
        assert_eq!(lines[1]["row_index"], 2);
    }

    #[tokio::test]
    async fn test_dry_run_writer_accepts_everything() {
        let result = DryRunWriter.write(&row(5, "X")).await.unwrap();
        assert!(!result.created);
    }
}
