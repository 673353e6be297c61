//! Resuming an interrupted job ends in the same state as an uninterrupted run

mod common;

use catalog_ingest::recovery::{CheckpointStore, InMemoryCheckpointStore};
use catalog_ingest::resource::FixedMemoryProbe;
use catalog_ingest::{ImportConfig, ImportError, ImportMode, ImportPipeline, RecordStream};
use common::{products, FlakyWriter};
use futures::{stream, StreamExt};
use std::sync::Arc;

fn config() -> ImportConfig {
    ImportConfig {
        mode: ImportMode::Execute,
        min_batch_size: 10,
        max_batch_size: 10,
        initial_batch_size: 10,
        base_retry_delay_ms: 10,
        max_backoff_delay_ms: 100,
        dependency_retry_delay_ms: 10,
        ..ImportConfig::default()
    }
}

fn writer() -> Arc<FlakyWriter> {
    Arc::new(
        FlakyWriter::new()
            .fail_always(7, "Validation failed: negative stock")
            .fail(12, 1, "connection reset"),
    )
}

fn pipeline(store: Arc<InMemoryCheckpointStore>, writer: Arc<FlakyWriter>) -> ImportPipeline {
    ImportPipeline::builder()
        .writer(writer)
        .checkpoint_store(store)
        .memory_probe(Arc::new(FixedMemoryProbe::new(32.0)))
        .build()
}

#[tokio::test]
async fn test_resume_matches_uninterrupted_run() {
    let uninterrupted = pipeline(Arc::new(InMemoryCheckpointStore::new()), writer())
        .run_import(stream::iter(products(1..=30)), &config())
        .await
        .unwrap();
    assert_eq!(uninterrupted.created, 28);
    assert_eq!(uninterrupted.failed, 2);

    // first process stops after row 20
    let store = Arc::new(InMemoryCheckpointStore::new());
    let partial = pipeline(store.clone(), writer())
        .run_import(stream::iter(products(1..=20)), &config())
        .await
        .unwrap();
    let checkpoint = store.latest_for_job(partial.job_id).await.unwrap().unwrap();
    assert_eq!(checkpoint.last_row_index, 20);
    assert_eq!(checkpoint.failed_rows.len(), 2);

    let second_writer = writer();
    let source: RecordStream = stream::iter(products(1..=30)).boxed();
    let resumed = pipeline(store, second_writer.clone())
        .resume_import(partial.job_id, Some(source), &config())
        .await
        .unwrap();

    assert_eq!(resumed.job_id, partial.job_id);
    assert_eq!(resumed.processed_rows, uninterrupted.processed_rows);
    assert_eq!(resumed.created, uninterrupted.created);
    assert_eq!(resumed.failed, uninterrupted.failed);
    assert_eq!(resumed.dead_lettered, uninterrupted.dead_lettered);
    // rows up to the checkpoint are not written again
    assert!(second_writer.calls().iter().all(|&i| i > 20));
}

#[tokio::test]
async fn test_resume_retries_recoverable_rows_from_checkpoint() {
    let store = Arc::new(InMemoryCheckpointStore::new());
    let failing = Arc::new(FlakyWriter::new().fail_always(5, "connection refused"));
    let config = ImportConfig {
        max_retries: 1,
        ..config()
    };
    let first = pipeline(store.clone(), failing)
        .run_import(stream::iter(products(1..=10)), &config)
        .await
        .unwrap();
    // row 6 depends on row 5
    assert_eq!(first.failed, 2);

    let healthy = Arc::new(FlakyWriter::new());
    let resumed = pipeline(store, healthy.clone())
        .resume_import(first.job_id, None, &config)
        .await
        .unwrap();

    assert_eq!(resumed.created, 10);
    assert_eq!(resumed.failed, 0);
    assert_eq!(healthy.calls(), vec![5, 6]);
}

#[tokio::test]
async fn test_dry_run_cannot_resume() {
    let store = Arc::new(InMemoryCheckpointStore::new());
    let config = ImportConfig {
        mode: ImportMode::DryRun,
        ..config()
    };
    let err = pipeline(store, writer())
        .resume_import(uuid::Uuid::new_v4(), None, &config)
        .await
        .unwrap_err();
    assert!(matches!(err, ImportError::Config(_)));
}
