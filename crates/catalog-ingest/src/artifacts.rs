//! Job report publication
//!
//! Reports are addressed by job and kind. Summaries are published whole as
//! JSON documents. Row reports grow while the job runs: records are appended
//! batch by batch and the report is sealed once the job ends. The returned
//! string is a URL the caller can hand out for retrieval.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::{ImportError, Result};

pub const VALIDATION_SUMMARY: &str = "validation_summary";
pub const ERROR_ROWS: &str = "error_rows";
pub const RESULT_ROWS: &str = "result_rows";
pub const DEAD_LETTER: &str = "dead_letter";

#[async_trait]
pub trait ArtifactSink: Send + Sync {
    async fn publish(&self, job_id: Uuid, kind: &str, payload: &serde_json::Value) -> Result<String>;

    /// Add records to the end of a row report, creating it on first use
    async fn append(&self, job_id: Uuid, kind: &str, records: &[serde_json::Value]) -> Result<()>;

    /// Finish a row report and return its URL; a report with no records is empty
    async fn seal(&self, job_id: Uuid, kind: &str) -> Result<String>;
}

fn artifact_error(kind: &str, message: impl std::fmt::Display) -> ImportError {
    ImportError::Artifact {
        kind: kind.to_string(),
        message: message.to_string(),
    }
}

fn check_kind(kind: &str) -> Result<()> {
    if kind.is_empty() || kind.contains(['/', '\\', '.']) {
        return Err(artifact_error(kind, "invalid artifact kind"));
    }
    Ok(())
}

/// Writes `<root>/<job_id>/<kind>.json` for documents and
/// `<root>/<job_id>/<kind>.jsonl` for row reports, returning `file://` URLs
#[derive(Debug, Clone)]
pub struct FileArtifactSink {
    root: PathBuf,
}

impl FileArtifactSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn build_path(&self, job_id: Uuid, kind: &str) -> PathBuf {
        self.root.join(job_id.to_string()).join(format!("{}.json", kind))
    }

    /// One JSON record per line
    pub fn build_rows_path(&self, job_id: Uuid, kind: &str) -> PathBuf {
        self.root.join(job_id.to_string()).join(format!("{}.jsonl", kind))
    }

    async fn create_parent(path: &Path, kind: &str) -> Result<()> {
        let dir = path
            .parent()
            .ok_or_else(|| artifact_error(kind, "artifact path has no parent"))?;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| artifact_error(kind, e))
    }

    async fn open_rows(&self, job_id: Uuid, kind: &str) -> Result<(PathBuf, tokio::fs::File)> {
        check_kind(kind)?;
        let path = self.build_rows_path(job_id, kind);
        Self::create_parent(&path, kind).await?;
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| artifact_error(kind, e))?;
        Ok((path, file))
    }

    async fn file_url(path: &Path, kind: &str) -> Result<String> {
        let absolute = tokio::fs::canonicalize(path)
            .await
            .map_err(|e| artifact_error(kind, e))?;
        Ok(format!("file://{}", absolute.display()))
    }
}

#[async_trait]
impl ArtifactSink for FileArtifactSink {
    #[instrument(skip(self, payload))]
    async fn publish(&self, job_id: Uuid, kind: &str, payload: &serde_json::Value) -> Result<String> {
        check_kind(kind)?;
        let path = self.build_path(job_id, kind);
        Self::create_parent(&path, kind).await?;

        let bytes = serde_json::to_vec_pretty(payload).map_err(|e| artifact_error(kind, e))?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| artifact_error(kind, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| artifact_error(kind, e))?;

        let url = Self::file_url(&path, kind).await?;
        debug!(url = %url, size = bytes.len(), "Artifact published");
        Ok(url)
    }

    #[instrument(skip(self, records), fields(records = records.len()))]
    async fn append(&self, job_id: Uuid, kind: &str, records: &[serde_json::Value]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut lines = Vec::new();
        for record in records {
            serde_json::to_writer(&mut lines, record).map_err(|e| artifact_error(kind, e))?;
            lines.push(b'\n');
        }
        let (_, mut file) = self.open_rows(job_id, kind).await?;
        file.write_all(&lines)
            .await
            .map_err(|e| artifact_error(kind, e))?;
        file.flush().await.map_err(|e| artifact_error(kind, e))
    }

    #[instrument(skip(self))]
    async fn seal(&self, job_id: Uuid, kind: &str) -> Result<String> {
        let (path, file) = self.open_rows(job_id, kind).await?;
        file.sync_all().await.map_err(|e| artifact_error(kind, e))?;
        let url = Self::file_url(&path, kind).await?;
        debug!(url = %url, "Row report sealed");
        Ok(url)
    }
}

/// Keeps published payloads in memory, keyed by `(job_id, kind)`
///
/// Row reports are held as JSON arrays.
#[derive(Debug, Default)]
pub struct InMemoryArtifactSink {
    published: Mutex<BTreeMap<(Uuid, String), serde_json::Value>>,
}

impl InMemoryArtifactSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, job_id: Uuid, kind: &str) -> Option<serde_json::Value> {
        self.published
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&(job_id, kind.to_string()))
            .cloned()
    }

    pub fn kinds(&self, job_id: Uuid) -> Vec<String> {
        self.published
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .filter(|(id, _)| *id == job_id)
            .map(|(_, kind)| kind.clone())
            .collect()
    }
}

#[async_trait]
impl ArtifactSink for InMemoryArtifactSink {
    async fn publish(&self, job_id: Uuid, kind: &str, payload: &serde_json::Value) -> Result<String> {
        self.published
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert((job_id, kind.to_string()), payload.clone());
        Ok(format!("memory://{}/{}", job_id, kind))
    }

    async fn append(&self, job_id: Uuid, kind: &str, records: &[serde_json::Value]) -> Result<()> {
        let mut published = self.published.lock().unwrap_or_else(|p| p.into_inner());
        let report = published
            .entry((job_id, kind.to_string()))
            .or_insert_with(|| serde_json::Value::Array(Vec::new()));
        match report {
            serde_json::Value::Array(rows) => {
                rows.extend(records.iter().cloned());
                Ok(())
            }
            _ => Err(artifact_error(kind, "artifact is a document, not a row report")),
        }
    }

    async fn seal(&self, job_id: Uuid, kind: &str) -> Result<String> {
        self.append(job_id, kind, &[]).await?;
        Ok(format!("memory://{}/{}", job_id, kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_file_sink_writes_json_and_returns_url() {
        let dir = TempDir::new().unwrap();
        let sink = FileArtifactSink::new(dir.path());
        let job_id = Uuid::new_v4();

        let url = sink
            .publish(job_id, ERROR_ROWS, &json!([{"row_index": 4}]))
            .await
            .unwrap();

        assert!(url.starts_with("file://"));
        assert!(url.ends_with(&format!("{}/error_rows.json", job_id)));
        let written = std::fs::read_to_string(sink.build_path(job_id, ERROR_ROWS)).unwrap();
        let value: serde_json::Value = serde_json::from_str(&written).unwrap();
        assert_eq!(value[0]["row_index"], 4);
    }

    #[tokio::test]
    async fn test_file_sink_rejects_path_like_kind() {
        let dir = TempDir::new().unwrap();
        let sink = FileArtifactSink::new(dir.path());
        let err = sink
            .publish(Uuid::new_v4(), "../escape", &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::Artifact { .. }));
    }

    #[tokio::test]
    async fn test_file_sink_appends_row_reports_as_json_lines() {
        let dir = TempDir::new().unwrap();
        let sink = FileArtifactSink::new(dir.path());
        let job_id = Uuid::new_v4();

        sink.append(job_id, RESULT_ROWS, &[json!({"row_index": 1}), json!({"row_index": 2})])
            .await
            .unwrap();
        sink.append(job_id, RESULT_ROWS, &[]).await.unwrap();
        sink.append(job_id, RESULT_ROWS, &[json!({"row_index": 3})])
            .await
            .unwrap();
        let url = sink.seal(job_id, RESULT_ROWS).await.unwrap();

        assert!(url.ends_with(&format!("{}/result_rows.jsonl", job_id)));
        let written = std::fs::read_to_string(sink.build_rows_path(job_id, RESULT_ROWS)).unwrap();
        let rows: Vec<serde_json::Value> = written
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2]["row_index"], 3);
    }

    #[tokio::test]
    async fn test_sealing_untouched_report_creates_empty_file() {
        let dir = TempDir::new().unwrap();
        let sink = FileArtifactSink::new(dir.path());
        let job_id = Uuid::new_v4();

        sink.seal(job_id, ERROR_ROWS).await.unwrap();

        let written = std::fs::read_to_string(sink.build_rows_path(job_id, ERROR_ROWS)).unwrap();
        assert!(written.is_empty());
        assert!(sink.seal(job_id, "a.b").await.is_err());
    }

    #[tokio::test]
    async fn test_in_memory_sink() {
        let sink = InMemoryArtifactSink::new();
        let job_id = Uuid::new_v4();
        sink.publish(job_id, DEAD_LETTER, &json!([])).await.unwrap();
        sink.publish(job_id, RESULT_ROWS, &json!([1])).await.unwrap();

        assert_eq!(sink.kinds(job_id), vec![DEAD_LETTER, RESULT_ROWS]);
        assert_eq!(sink.get(job_id, RESULT_ROWS), Some(json!([1])));
        assert!(sink.get(Uuid::new_v4(), RESULT_ROWS).is_none());
    }

    #[tokio::test]
    async fn test_in_memory_row_reports() {
        let sink = InMemoryArtifactSink::new();
        let job_id = Uuid::new_v4();
        sink.append(job_id, ERROR_ROWS, &[json!(1), json!(2)]).await.unwrap();
        sink.append(job_id, ERROR_ROWS, &[json!(3)]).await.unwrap();
        sink.seal(job_id, ERROR_ROWS).await.unwrap();
        sink.seal(job_id, RESULT_ROWS).await.unwrap();

        assert_eq!(sink.get(job_id, ERROR_ROWS), Some(json!([1, 2, 3])));
        assert_eq!(sink.get(job_id, RESULT_ROWS), Some(json!([])));

        sink.publish(job_id, DEAD_LETTER, &json!({})).await.unwrap();
        assert!(sink.append(job_id, DEAD_LETTER, &[json!(1)]).await.is_err());
    }
}
