//! Import job orchestration
//!
//! [`ImportPipeline`] wires the resource monitor, batch sizer, streaming
//! validator and recovery manager together for one job. Row reports are
//! appended to the [`ArtifactSink`] after every batch; summaries are published
//! when the job ends, whether the source ran out or the job was cancelled.

use catalog_common::types::RowIndex;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::artifacts::{
    ArtifactSink, InMemoryArtifactSink, DEAD_LETTER, ERROR_ROWS, RESULT_ROWS, VALIDATION_SUMMARY,
};
use crate::batch_sizer::AdaptiveBatchSizer;
use crate::config::{ImportConfig, ImportMode};
use crate::error::{ImportError, Result};
use crate::metrics::{JobEvent, MetricsHandle};
use crate::recovery::{
    CheckpointStore, EntityRegistry, InMemoryCheckpointStore, RecoveryCheckpoint, RecoveryManager,
};
use crate::resource::{MemoryProbe, ProcessMemoryProbe, ResourceMonitor, SlotPool};
use crate::types::{Batch, RawRecord};
use crate::validation::{RowValidator, SchemaRowValidator, StreamingValidator};
use crate::writer::{DomainWriter, DryRunWriter};

/// Boxed record source accepted by [`ImportPipeline::resume_import`]
pub type RecordStream = BoxStream<'static, anyhow::Result<RawRecord>>;

/// Summary of one import run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportJobResult {
    pub job_id: Uuid,
    pub mode: ImportMode,
    /// Source rows consumed, valid or not
    pub processed_rows: u64,
    pub valid_rows: u64,
    pub invalid_rows: u64,
    /// Rows the writer persisted
    pub created: u64,
    pub failed: u64,
    pub dead_lettered: u64,
    pub duration_ms: u64,
    /// The job stopped early; counts cover what ran before the stop
    pub cancelled: bool,
    /// Artifact kind to retrieval URL
    pub artifacts: BTreeMap<String, String>,
}

/// Validation counters for the rows seen by this process
///
/// Issue rows themselves go to the error report as batches arrive; only the
/// per-rule and per-severity counts stay here.
#[derive(Debug, Default)]
struct Tally {
    valid_rows: u64,
    invalid_rows: u64,
    issues_by_rule: BTreeMap<String, u64>,
    issues_by_severity: BTreeMap<String, u64>,
    last_batch_index: Option<u64>,
    last_row_index: RowIndex,
}

impl Tally {
    fn absorb(&mut self, batch: &Batch) {
        self.valid_rows += batch.rows.len() as u64;
        self.invalid_rows += batch.rejected_rows() as u64;
        for issue in batch.issues.iter().flat_map(|r| r.issues.iter()) {
            *self.issues_by_rule.entry(issue.rule_id.clone()).or_insert(0) += 1;
            *self
                .issues_by_severity
                .entry(issue.severity.as_str().to_string())
                .or_insert(0) += 1;
        }
        self.last_batch_index = Some(batch.batch_index);
        self.last_row_index = batch.end_row_index;
    }

    fn resume_from(&mut self, checkpoint: &RecoveryCheckpoint) {
        self.last_batch_index = Some(checkpoint.batch_index);
        self.last_row_index = checkpoint.last_row_index;
    }
}

/// Per-job components
struct Job {
    id: Uuid,
    mode: ImportMode,
    started: Instant,
    monitor: Arc<ResourceMonitor>,
    sizer: Arc<AdaptiveBatchSizer>,
    manager: RecoveryManager,
    sampler_cancel: CancellationToken,
    sampler: JoinHandle<()>,
    tally: Tally,
}

pub struct ImportPipelineBuilder {
    validator: Option<Arc<dyn RowValidator>>,
    writer: Option<Arc<dyn DomainWriter>>,
    artifacts: Option<Arc<dyn ArtifactSink>>,
    store: Option<Arc<dyn CheckpointStore>>,
    probe: Option<Arc<dyn MemoryProbe>>,
    registry: Option<Arc<EntityRegistry>>,
    metrics: Option<MetricsHandle>,
    cancel: CancellationToken,
}

impl ImportPipelineBuilder {
    pub fn validator(mut self, validator: Arc<dyn RowValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn writer(mut self, writer: Arc<dyn DomainWriter>) -> Self {
        self.writer = Some(writer);
        self
    }

    pub fn artifacts(mut self, artifacts: Arc<dyn ArtifactSink>) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    pub fn checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Keys already present in the catalog
    pub fn registry(mut self, registry: Arc<EntityRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn metrics(mut self, metrics: MetricsHandle) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn build(self) -> ImportPipeline {
        ImportPipeline {
            validator: self
                .validator
                .unwrap_or_else(|| Arc::new(SchemaRowValidator::product_catalog())),
            writer: self.writer.unwrap_or_else(|| Arc::new(DryRunWriter)),
            artifacts: self
                .artifacts
                .unwrap_or_else(|| Arc::new(InMemoryArtifactSink::new())),
            store: self
                .store
                .unwrap_or_else(|| Arc::new(InMemoryCheckpointStore::new())),
            probe: self
                .probe
                .unwrap_or_else(|| Arc::new(ProcessMemoryProbe::new())),
            registry: self.registry.unwrap_or_default(),
            metrics: self.metrics,
            cancel: self.cancel,
        }
    }
}

/// Entry point for running and resuming import jobs
pub struct ImportPipeline {
    validator: Arc<dyn RowValidator>,
    writer: Arc<dyn DomainWriter>,
    artifacts: Arc<dyn ArtifactSink>,
    store: Arc<dyn CheckpointStore>,
    probe: Arc<dyn MemoryProbe>,
    registry: Arc<EntityRegistry>,
    metrics: Option<MetricsHandle>,
    cancel: CancellationToken,
}

impl ImportPipeline {
    pub fn builder() -> ImportPipelineBuilder {
        ImportPipelineBuilder {
            validator: None,
            writer: None,
            artifacts: None,
            store: None,
            probe: None,
            registry: None,
            metrics: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Cancelling stops the running job at the next batch boundary; the job
    /// still drains, checkpoints and publishes what it processed
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn checkpoint_store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    /// Validate and, in execute mode, write every record of `source`
    #[instrument(skip_all, fields(mode = config.mode.as_str()))]
    pub async fn run_import<S>(&self, mut source: S, config: &ImportConfig) -> Result<ImportJobResult>
    where
        S: Stream<Item = anyhow::Result<RawRecord>> + Unpin + Send,
    {
        config.validate()?;
        let mut job = self.start_job(Uuid::new_v4(), config);
        info!(job_id = %job.id, "Import started");

        let outcome = self.consume(&mut job, &mut source, 0).await;
        self.finish(job, outcome).await
    }

    /// Continue a job from its latest checkpoint
    ///
    /// Failed rows in the checkpoint are re-attempted first. When `source` is
    /// given, records up to the checkpoint's last row are skipped and the rest
    /// are imported as a normal run would.
    #[instrument(skip_all, fields(job_id = %job_id))]
    pub async fn resume_import(
        &self,
        job_id: Uuid,
        source: Option<RecordStream>,
        config: &ImportConfig,
    ) -> Result<ImportJobResult> {
        config.validate()?;
        if config.mode == ImportMode::DryRun {
            return Err(ImportError::Config(
                "dry-run jobs keep no checkpoints and cannot be resumed".into(),
            ));
        }
        let checkpoint = self
            .store
            .latest_for_job(job_id)
            .await?
            .ok_or(ImportError::NoCheckpointForJob(job_id))?;

        let mut job = self.start_job(job_id, config);
        job.tally.resume_from(&checkpoint);
        info!(
            checkpoint_id = %checkpoint.id,
            batch_index = checkpoint.batch_index,
            last_row_index = checkpoint.last_row_index,
            "Resuming import"
        );

        let outcome = async {
            let recovered = job
                .manager
                .recover_from_checkpoint(checkpoint.id, Arc::clone(&self.writer))
                .await?;
            info!(
                recovered = recovered.recovered_rows,
                permanent = recovered.permanent_failures,
                dead_lettered = recovered.dead_letter_rows,
                "Checkpoint recovery finished"
            );
            if let Some(source) = source {
                let last = checkpoint.last_row_index;
                let mut remaining = source.filter(move |item| {
                    let seen = matches!(item, Ok(record) if record.row_index <= last);
                    futures::future::ready(!seen)
                });
                self.consume(&mut job, &mut remaining, checkpoint.batch_index + 1)
                    .await?;
            }
            Ok::<(), ImportError>(())
        }
        .await;
        self.finish(job, outcome).await
    }

    fn start_job(&self, job_id: Uuid, config: &ImportConfig) -> Job {
        let monitor_config = config.monitor_config();
        let slots = SlotPool::new(monitor_config.optimal_concurrency(self.probe.used_mb()));

        let mut monitor = ResourceMonitor::new(monitor_config, Arc::clone(&self.probe), Arc::clone(&slots));
        if let Some(metrics) = &self.metrics {
            monitor = monitor.with_metrics(metrics.clone());
        }
        let monitor = Arc::new(monitor);
        monitor.tick();
        let sampler_cancel = self.cancel.child_token();
        let sampler = monitor.spawn_sampler(sampler_cancel.clone());

        let mut manager = RecoveryManager::builder(job_id, config.recovery_config(), Arc::clone(&self.store))
            .slots(slots)
            .registry(Arc::clone(&self.registry))
            .cancel(self.cancel.clone());
        if let Some(metrics) = &self.metrics {
            manager = manager.metrics(metrics.clone());
            metrics.record_job_event(JobEvent::Started);
        }

        Job {
            id: job_id,
            mode: config.mode,
            started: Instant::now(),
            monitor,
            sizer: Arc::new(AdaptiveBatchSizer::new(config.sizer_config())),
            manager: manager.build(),
            sampler_cancel,
            sampler,
            tally: Tally::default(),
        }
    }

    /// Pull batches until the source ends, writing them in execute mode
    async fn consume<S>(&self, job: &mut Job, source: &mut S, first_batch: u64) -> Result<()>
    where
        S: Stream<Item = anyhow::Result<RawRecord>> + Unpin + Send,
    {
        let mut batches = StreamingValidator::new(
            Arc::clone(&self.validator),
            Arc::clone(&job.sizer),
            Arc::clone(&job.monitor),
            self.cancel.clone(),
        )
        .starting_at_batch(first_batch);

        while let Some(batch) = batches.next_batch(source).await? {
            let started = Instant::now();
            job.tally.absorb(&batch);
            if job.mode == ImportMode::Execute {
                job.manager
                    .process_batch(&batch, Arc::clone(&self.writer), None)
                    .await?;
            }
            let duration_ms = started.elapsed().as_millis() as u64 + batch.metadata.processing_time_ms;
            job.sizer.record_performance(
                batch.consumed_rows() as usize,
                duration_ms,
                job.monitor.last_snapshot().used_mb,
            );
            self.append_rows(job, &batch).await?;
            if self.cancel.is_cancelled() {
                warn!(job_id = %job.id, batch_index = batch.batch_index, "Import cancelled");
                return Err(ImportError::Cancelled);
            }
        }
        Ok(())
    }

    /// Stream this batch's issue rows and the rows that succeeded since the
    /// previous batch into the row reports
    async fn append_rows(&self, job: &Job, batch: &Batch) -> Result<()> {
        if !batch.issues.is_empty() {
            self.artifacts
                .append(job.id, ERROR_ROWS, &to_records(&batch.issues)?)
                .await?;
        }
        if job.mode == ImportMode::Execute {
            let succeeded = job.manager.take_succeeded();
            if !succeeded.is_empty() {
                self.artifacts
                    .append(job.id, RESULT_ROWS, &to_records(&succeeded)?)
                    .await?;
            }
        }
        Ok(())
    }

    /// Drain retries, checkpoint, stop the sampler and publish reports
    ///
    /// A cancelled job is finished like a completed one, with `cancelled` set.
    async fn finish(&self, job: Job, outcome: Result<()>) -> Result<ImportJobResult> {
        let cancelled = matches!(outcome, Err(ImportError::Cancelled));
        let mut outcome = if cancelled {
            warn!(job_id = %job.id, "Import cancelled, publishing partial results");
            Ok(())
        } else {
            outcome
        };
        if job.mode == ImportMode::Execute {
            job.manager.drain().await;
            if let Some(batch_index) = job.tally.last_batch_index {
                match job.manager.checkpoint(batch_index, job.tally.last_row_index).await {
                    Ok(checkpoint) => debug!(checkpoint_id = %checkpoint.id, "Final checkpoint saved"),
                    Err(e) => {
                        error!(job_id = %job.id, error = %e, "Failed to save final checkpoint");
                        if outcome.is_ok() {
                            outcome = Err(e);
                        }
                    }
                }
            }
        }

        job.sampler_cancel.cancel();
        if let Err(e) = job.sampler.await {
            warn!(error = %e, "Resource sampler ended abnormally");
        }

        let duration_ms = job.started.elapsed().as_millis() as u64;
        let published = match outcome {
            Ok(()) => {
                self.publish(&job.manager, &job.tally, job.id, job.mode, duration_ms, cancelled)
                    .await
            }
            Err(e) => Err(e),
        };

        match published {
            Ok(result) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_job_event(JobEvent::Completed { duration_ms });
                }
                info!(
                    job_id = %result.job_id,
                    processed = result.processed_rows,
                    valid = result.valid_rows,
                    invalid = result.invalid_rows,
                    created = result.created,
                    failed = result.failed,
                    dead_lettered = result.dead_lettered,
                    cancelled = result.cancelled,
                    duration_ms,
                    "Import finished"
                );
                Ok(result)
            }
            Err(e) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_job_event(JobEvent::Failed { duration_ms });
                }
                error!(job_id = %job.id, error = %e, "Import failed");
                Err(e)
            }
        }
    }

    async fn publish(
        &self,
        manager: &RecoveryManager,
        tally: &Tally,
        job_id: Uuid,
        mode: ImportMode,
        duration_ms: u64,
        cancelled: bool,
    ) -> Result<ImportJobResult> {
        let mut result = ImportJobResult {
            job_id,
            mode,
            processed_rows: tally.valid_rows + tally.invalid_rows,
            valid_rows: tally.valid_rows,
            invalid_rows: tally.invalid_rows,
            created: 0,
            failed: 0,
            dead_lettered: 0,
            duration_ms,
            cancelled,
            artifacts: BTreeMap::new(),
        };
        if mode == ImportMode::Execute {
            // includes rows restored from a checkpoint
            let totals = manager.totals();
            result.valid_rows = totals.processed_rows;
            result.invalid_rows = totals.rejected_rows;
            result.processed_rows = totals.processed_rows + totals.rejected_rows;
            result.created = totals.succeeded;
            result.failed = totals.failed;
            result.dead_lettered = totals.dead_lettered;
        }

        let summary = json!({
            "job_id": job_id,
            "mode": mode,
            "cancelled": cancelled,
            "processed_rows": result.processed_rows,
            "valid_rows": result.valid_rows,
            "invalid_rows": result.invalid_rows,
            "issues_by_rule": tally.issues_by_rule,
            "issues_by_severity": tally.issues_by_severity,
        });
        let mut reports = vec![(VALIDATION_SUMMARY, summary)];
        if mode == ImportMode::Execute {
            reports.push((DEAD_LETTER, serde_json::to_value(manager.dead_letters())?));
        }
        for (kind, payload) in reports {
            let url = self.artifacts.publish(job_id, kind, &payload).await?;
            result.artifacts.insert(kind.to_string(), url);
        }

        let mut row_reports = vec![ERROR_ROWS];
        if mode == ImportMode::Execute {
            // retries that finished after the last batch, then rows that never succeeded
            let mut closing = manager.take_succeeded();
            closing.extend(manager.unresolved_outcomes());
            self.artifacts
                .append(job_id, RESULT_ROWS, &to_records(&closing)?)
                .await?;
            row_reports.push(RESULT_ROWS);
        }
        for kind in row_reports {
            let url = self.artifacts.seal(job_id, kind).await?;
            result.artifacts.insert(kind.to_string(), url);
        }
        Ok(result)
    }
}

fn to_records<T: Serialize>(items: &[T]) -> Result<Vec<serde_json::Value>> {
    Ok(items
        .iter()
        .map(serde_json::to_value)
        .collect::<serde_json::Result<_>>()?)
}

impl std::fmt::Debug for ImportPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImportPipeline")
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}
