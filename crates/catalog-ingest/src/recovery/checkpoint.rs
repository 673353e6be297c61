//! Recovery checkpoints and their stores

use async_trait::async_trait;
use catalog_common::checksum::{sha256_hex, verify_sha256};
use catalog_common::types::RowIndex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{DeadLetterEntry, FailedRow};
use crate::error::{ImportError, Result};

/// Snapshot of a job's recovery state after a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryCheckpoint {
    pub id: Uuid,
    pub job_id: Uuid,
    pub timestamp_ms: i64,
    pub batch_index: u64,
    /// Last source row covered; resumption continues after it
    pub last_row_index: RowIndex,
    /// Valid rows handed to the writer path so far
    pub processed_rows: u64,
    /// Rows rejected by validation so far
    pub rejected_rows: u64,
    pub successful_rows: u64,
    pub failed_rows: Vec<FailedRow>,
    /// key -> row indices referencing it, for the checkpointed batch
    pub dependency_snapshot: BTreeMap<String, Vec<RowIndex>>,
    /// Keys known to exist at checkpoint time
    pub resolved_keys: Vec<String>,
    pub dead_letters: Vec<DeadLetterEntry>,
}

impl RecoveryCheckpoint {
    pub fn dead_lettered_rows(&self) -> u64 {
        self.dead_letters.len() as u64
    }
}

/// Durable home for checkpoints, keyed by job
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, checkpoint: &RecoveryCheckpoint) -> Result<()>;

    async fn load(&self, id: Uuid) -> Result<RecoveryCheckpoint>;

    /// Most recent checkpoint of a job by batch index
    async fn latest_for_job(&self, job_id: Uuid) -> Result<Option<RecoveryCheckpoint>>;

    /// Checkpoint ids of a job, oldest first
    async fn list(&self, job_id: Uuid) -> Result<Vec<Uuid>>;
}

#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: Mutex<Vec<RecoveryCheckpoint>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn for_job(&self, job_id: Uuid) -> Vec<RecoveryCheckpoint> {
        let checkpoints = self.checkpoints.lock().unwrap_or_else(|p| p.into_inner());
        let mut out: Vec<_> = checkpoints
            .iter()
            .filter(|c| c.job_id == job_id)
            .cloned()
            .collect();
        out.sort_by_key(|c| (c.batch_index, c.timestamp_ms));
        out
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, checkpoint: &RecoveryCheckpoint) -> Result<()> {
        self.checkpoints
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(checkpoint.clone());
        Ok(())
    }

    async fn load(&self, id: Uuid) -> Result<RecoveryCheckpoint> {
        self.checkpoints
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .ok_or(ImportError::CheckpointNotFound(id))
    }

    async fn latest_for_job(&self, job_id: Uuid) -> Result<Option<RecoveryCheckpoint>> {
        Ok(self.for_job(job_id).pop())
    }

    async fn list(&self, job_id: Uuid) -> Result<Vec<Uuid>> {
        Ok(self.for_job(job_id).into_iter().map(|c| c.id).collect())
    }
}

/// On-disk envelope guarding a checkpoint with its digest
#[derive(Serialize, Deserialize)]
struct CheckpointEnvelope {
    checksum: String,
    checkpoint: RecoveryCheckpoint,
}

/// Stores checkpoints as `<root>/<job_id>/<batch_index>-<timestamp_ms>-<id>.json`
///
/// Files are written to a temporary name and renamed into place, so a crash
/// mid-write never leaves a truncated checkpoint behind.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    root: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn job_dir(&self, job_id: Uuid) -> PathBuf {
        self.root.join(job_id.to_string())
    }

    fn file_name(checkpoint: &RecoveryCheckpoint) -> String {
        format!(
            "{:08}-{:013}-{}.json",
            checkpoint.batch_index, checkpoint.timestamp_ms, checkpoint.id
        )
    }

    /// Checkpoint files of a job, oldest first by batch index then time
    async fn job_files(&self, job_id: Uuid) -> Result<Vec<PathBuf>> {
        let dir = self.job_dir(job_id);
        if !tokio::fs::try_exists(&dir).await? {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    async fn read(&self, path: &Path) -> Result<RecoveryCheckpoint> {
        let bytes = tokio::fs::read(path).await?;
        let envelope: CheckpointEnvelope = serde_json::from_slice(&bytes)?;
        let payload = serde_json::to_vec(&envelope.checkpoint)?;
        verify_sha256(&payload, &envelope.checksum).map_err(|e| {
            ImportError::Checkpoint(format!("{} failed verification: {}", path.display(), e))
        })?;
        Ok(envelope.checkpoint)
    }

    fn id_from_path(path: &Path) -> Option<Uuid> {
        let stem = path.file_stem()?.to_str()?;
        let mut parts = stem.splitn(3, '-');
        let id = parts.nth(2)?;
        Uuid::parse_str(id).ok()
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, checkpoint: &RecoveryCheckpoint) -> Result<()> {
        let dir = self.job_dir(checkpoint.job_id);
        tokio::fs::create_dir_all(&dir).await?;

        let payload = serde_json::to_vec(checkpoint)?;
        let envelope = CheckpointEnvelope {
            checksum: sha256_hex(&payload),
            checkpoint: checkpoint.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&envelope)?;

        let path = dir.join(Self::file_name(checkpoint));
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!(
            checkpoint_id = %checkpoint.id,
            path = %path.display(),
            bytes = bytes.len(),
            "Checkpoint written"
        );
        Ok(())
    }

    async fn load(&self, id: Uuid) -> Result<RecoveryCheckpoint> {
        if !tokio::fs::try_exists(&self.root).await? {
            return Err(ImportError::CheckpointNotFound(id));
        }
        let mut jobs = tokio::fs::read_dir(&self.root).await?;
        while let Some(job) = jobs.next_entry().await? {
            let Some(job_id) = job.file_name().to_str().and_then(|n| Uuid::parse_str(n).ok()) else {
                continue;
            };
            for path in self.job_files(job_id).await? {
                if Self::id_from_path(&path) == Some(id) {
                    return self.read(&path).await;
                }
            }
        }
        Err(ImportError::CheckpointNotFound(id))
    }

    async fn latest_for_job(&self, job_id: Uuid) -> Result<Option<RecoveryCheckpoint>> {
        // newest first; skip files that fail verification
        for path in self.job_files(job_id).await?.into_iter().rev() {
            match self.read(&path).await {
                Ok(checkpoint) => return Ok(Some(checkpoint)),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable checkpoint"),
            }
        }
        Ok(None)
    }

    async fn list(&self, job_id: Uuid) -> Result<Vec<Uuid>> {
        Ok(self
            .job_files(job_id)
            .await?
            .iter()
            .filter_map(|p| Self::id_from_path(p))
            .collect())
    }
}
