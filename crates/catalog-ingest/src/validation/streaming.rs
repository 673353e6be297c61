//! Streaming batch assembly
//!
//! Pulls raw records from a single-pass stream, scrubs and validates each one
//! and groups them into batches sized by the [`AdaptiveBatchSizer`]. Emission
//! waits on [`ResourceMonitor::wait_for_admission`], the only point where the
//! ingestion side suspends under memory pressure.

use futures::{Stream, StreamExt};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use super::{sanitize_record, RowValidator};
use crate::batch_sizer::AdaptiveBatchSizer;
use crate::error::{ImportError, Result};
use crate::resource::ResourceMonitor;
use crate::types::{Batch, BatchMetadata, IssueSeverity, RawRecord, RowIssues, ValidationIssue};

pub struct StreamingValidator {
    validator: Arc<dyn RowValidator>,
    sizer: Arc<AdaptiveBatchSizer>,
    monitor: Arc<ResourceMonitor>,
    cancel: CancellationToken,
    next_batch_index: u64,
    exhausted: bool,
}

impl StreamingValidator {
    pub fn new(
        validator: Arc<dyn RowValidator>,
        sizer: Arc<AdaptiveBatchSizer>,
        monitor: Arc<ResourceMonitor>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            validator,
            sizer,
            monitor,
            cancel,
            next_batch_index: 0,
            exhausted: false,
        }
    }

    /// Continue numbering batches after a resumed checkpoint
    pub fn starting_at_batch(mut self, batch_index: u64) -> Self {
        self.next_batch_index = batch_index;
        self
    }

    /// Assemble the next batch, or `None` once the source is drained
    #[instrument(skip_all, fields(batch_index = self.next_batch_index))]
    pub async fn next_batch<S>(&mut self, source: &mut S) -> Result<Option<Batch>>
    where
        S: Stream<Item = anyhow::Result<RawRecord>> + Unpin,
    {
        if self.exhausted {
            return Ok(None);
        }

        let started = Instant::now();
        let target = self.sizer.effective_size(&self.monitor.last_snapshot());
        let mut rows = Vec::with_capacity(target);
        let mut issues = Vec::new();
        let mut consumed = 0usize;
        let mut start_row_index = None;
        let mut end_row_index = 0;

        while consumed < target {
            let mut record = match source.next().await {
                None => {
                    self.exhausted = true;
                    break;
                }
                Some(Err(e)) => return Err(ImportError::Source(format!("{:#}", e))),
                Some(Ok(record)) => record,
            };

            consumed += 1;
            start_row_index.get_or_insert(record.row_index);
            end_row_index = record.row_index;

            let mut row_issues = sanitize_record(&mut record);
            let (row, found) = self.validator.validate(&record)?;
            row_issues.extend(found);

            let rejected = row.is_none() || row_issues.iter().any(|i| i.severity.rejects_row());
            if rejected && row_issues.is_empty() {
                row_issues.push(ValidationIssue::new(
                    "rejected",
                    "Rejected row",
                    IssueSeverity::Error,
                    "Row was rejected by the validator",
                ));
            }
            if !row_issues.is_empty() {
                issues.push(RowIssues {
                    row_index: record.row_index,
                    issues: row_issues,
                    rejected,
                });
            }
            if let (false, Some(row)) = (rejected, row) {
                rows.push(row);
            }
        }

        let Some(start_row_index) = start_row_index else {
            return Ok(None);
        };

        if !self.monitor.wait_for_admission(&self.cancel).await {
            return Err(ImportError::Cancelled);
        }

        let batch = Batch {
            batch_index: self.next_batch_index,
            start_row_index,
            end_row_index,
            rows,
            issues,
            metadata: BatchMetadata {
                processing_time_ms: started.elapsed().as_millis() as u64,
                memory_used_mb: self.monitor.last_snapshot().used_mb,
            },
        };
        self.next_batch_index += 1;

        debug!(
            batch_index = batch.batch_index,
            rows = batch.rows.len(),
            rejected = batch.rejected_rows(),
            target_size = target,
            "Batch assembled"
        );
        Ok(Some(batch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch_sizer::SizerConfig;
    use crate::resource::{FixedMemoryProbe, MonitorConfig, SlotPool};
    use crate::validation::{FieldRule, SchemaRowValidator};

    fn records(n: u64) -> Vec<anyhow::Result<RawRecord>> {
        (1..=n)
            .map(|i| {
                let sku = if i == 3 { String::new() } else { format!("SKU-{}", i) };
                Ok(RawRecord::new(i, vec![("sku".to_string(), sku)]))
            })
            .collect()
    }

    fn validator(used_mb: f64) -> (StreamingValidator, Arc<ResourceMonitor>) {
        let monitor = Arc::new(ResourceMonitor::new(
            MonitorConfig {
                max_memory_mb: 100,
                ..MonitorConfig::default()
            },
            Arc::new(FixedMemoryProbe::new(used_mb)),
            SlotPool::new(4),
        ));
        let sizer = Arc::new(AdaptiveBatchSizer::new(SizerConfig {
            min_size: 2,
            max_size: 10,
            initial_size: 4,
        }));
        let schema = Arc::new(SchemaRowValidator::new(vec![FieldRule::new("sku").required()]));
        (
            StreamingValidator::new(schema, sizer, Arc::clone(&monitor), CancellationToken::new()),
            monitor,
        )
    }

    #[tokio::test]
    async fn test_batches_follow_sizer_and_keep_rejected_issues() {
        let (mut streaming, _) = validator(10.0);
        let mut source = futures::stream::iter(records(10));

        let first = streaming.next_batch(&mut source).await.unwrap().unwrap();
        assert_eq!(first.batch_index, 0);
        assert_eq!((first.start_row_index, first.end_row_index), (1, 4));
        assert_eq!(first.rows.len(), 3);
        assert_eq!(first.rejected_rows(), 1);
        assert_eq!(first.issues[0].row_index, 3);

        let second = streaming.next_batch(&mut source).await.unwrap().unwrap();
        assert_eq!((second.start_row_index, second.end_row_index), (5, 8));

        let third = streaming.next_batch(&mut source).await.unwrap().unwrap();
        assert_eq!(third.rows.len(), 2);
        assert!(streaming.next_batch(&mut source).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_formula_values_are_rejected_but_reported() {
        let (mut streaming, _) = validator(10.0);
        let mut source = futures::stream::iter(vec![Ok(RawRecord::new(
            1,
            vec![("sku".to_string(), "=cmd|'/c calc'!A1".to_string())],
        ))]);
        let batch = streaming.next_batch(&mut source).await.unwrap().unwrap();
        assert!(batch.rows.is_empty());
        assert_eq!(batch.issues[0].issues[0].rule_id, "formula_injection");
    }

    #[tokio::test]
    async fn test_source_error_is_fatal() {
        let (mut streaming, _) = validator(10.0);
        let mut source = futures::stream::iter(vec![
            Ok(RawRecord::new(1, vec![("sku".to_string(), "A".to_string())])),
            Err(anyhow::anyhow!("unexpected end of file")),
        ]);
        let result = streaming.next_batch(&mut source).await;
        assert!(matches!(result, Err(ImportError::Source(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_critical_pressure_shrinks_batches_and_blocks_until_cancelled() {
        let (streaming, monitor) = validator(90.0);
        monitor.tick();
        let cancel = CancellationToken::new();
        let mut streaming = StreamingValidator {
            cancel: cancel.clone(),
            ..streaming
        };
        let mut source = futures::stream::iter(records(10));

        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(10)).await;
            cancel.cancel();
        });
        let result = streaming.next_batch(&mut source).await;
        assert!(matches!(result, Err(ImportError::Cancelled)));
    }
}
