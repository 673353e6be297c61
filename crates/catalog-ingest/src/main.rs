//! Catalog Ingest - product catalog import tool

use anyhow::{Context, Result};
use catalog_common::logging::{init_logging, LogConfig, LogLevel};
use catalog_ingest::artifacts::FileArtifactSink;
use catalog_ingest::mapping::{apply_mapping, ColumnMapping, ColumnMappingResolver, HeaderMappingResolver};
use catalog_ingest::metrics::{spawn_reporter, AlertManager, MetricsCollector, TracingAlertSink};
use catalog_ingest::recovery::FileCheckpointStore;
use catalog_ingest::writer::JsonLinesWriter;
use catalog_ingest::{ImportConfig, ImportMode, ImportPipeline, RawRecord, RecordStream};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Rows read up front to guide column mapping
const MAPPING_SAMPLE_ROWS: usize = 20;

/// Parsed rows buffered between the CSV reader thread and the pipeline
const CSV_CHANNEL_CAPACITY: usize = 1024;

#[derive(Parser, Debug)]
#[command(name = "catalog-ingest")]
#[command(author, version, about = "Product catalog batch import tool")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(clap::Args, Debug)]
struct JobArgs {
    /// TOML configuration file; IMPORT_* variables override it
    #[arg(short, long, env = "IMPORT_CONFIG")]
    config: Option<PathBuf>,

    /// Directory for checkpoints, reports and written rows
    #[arg(short, long, default_value = "./import-output")]
    output: PathBuf,

    /// Mapping profile to apply on top of header detection
    #[arg(long)]
    profile: Option<String>,

    /// JSON file of mapping profiles: {"<id>": {"<source column>": "<field>"}}
    #[arg(long)]
    profiles: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Import a CSV file
    Run {
        /// Input CSV file with a header row
        #[arg(short, long)]
        input: PathBuf,

        /// Validate and report without writing rows
        #[arg(long)]
        dry_run: bool,

        #[command(flatten)]
        job: JobArgs,
    },

    /// Resume a job from its latest checkpoint
    Resume {
        #[arg(long)]
        job_id: Uuid,

        /// Source file to continue importing after the checkpoint
        #[arg(short, long)]
        input: Option<PathBuf>,

        #[command(flatten)]
        job: JobArgs,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("catalog-ingest")
        .build()
        .merge_env()?;
    let _guard = init_logging(&log_config)?;

    let result = match cli.command {
        Command::Run {
            input,
            dry_run,
            job,
        } => {
            let mut config = ImportConfig::load(job.config.as_deref())?;
            if dry_run {
                config.mode = ImportMode::DryRun;
            }
            let resolver = build_resolver(job.profiles.as_deref())?;
            let mapping = resolve_mapping(&resolver, &input, job.profile.as_deref()).await?;
            let source = mapped_stream(csv_stream(input.clone()), mapping);

            let job_config = config.clone();
            with_pipeline(&config, &job.output, |pipeline| async move {
                info!(input = %input.display(), mode = job_config.mode.as_str(), "Starting import");
                Ok(pipeline.run_import(source, &job_config).await?)
            })
            .await?
        }
        Command::Resume { job_id, input, job } => {
            let config = ImportConfig::load(job.config.as_deref())?;
            let source = match &input {
                Some(path) => {
                    let resolver = build_resolver(job.profiles.as_deref())?;
                    let mapping = resolve_mapping(&resolver, path, job.profile.as_deref()).await?;
                    Some(mapped_stream(csv_stream(path.clone()), mapping))
                }
                None => None,
            };

            let job_config = config.clone();
            with_pipeline(&config, &job.output, |pipeline| async move {
                info!(job_id = %job_id, "Resuming import");
                Ok(pipeline.resume_import(job_id, source, &job_config).await?)
            })
            .await?
        }
    };

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

/// Build the pipeline around the output directory, run `job`, then stop metrics
async fn with_pipeline<F, Fut>(
    config: &ImportConfig,
    output: &Path,
    job: F,
) -> Result<catalog_ingest::ImportJobResult>
where
    F: FnOnce(Arc<ImportPipeline>) -> Fut,
    Fut: std::future::Future<Output = Result<catalog_ingest::ImportJobResult>>,
{
    tokio::fs::create_dir_all(output)
        .await
        .with_context(|| format!("Failed to create output directory {}", output.display()))?;

    let collector = MetricsCollector::start();
    let alerts = Arc::new(AlertManager::with_default_rules().with_sink(Arc::new(TracingAlertSink)));
    let reporter_cancel = CancellationToken::new();
    let reporter = spawn_reporter(
        Arc::clone(&collector),
        alerts,
        config.metrics_interval(),
        reporter_cancel.clone(),
    );

    let writer = JsonLinesWriter::new(output.join("rows.jsonl"), config.dependencies.key_field.clone());
    let pipeline = Arc::new(
        ImportPipeline::builder()
            .writer(Arc::new(writer))
            .artifacts(Arc::new(FileArtifactSink::new(output.join("artifacts"))))
            .checkpoint_store(Arc::new(FileCheckpointStore::new(output.join("checkpoints"))))
            .metrics(collector.handle())
            .build(),
    );

    let cancel = pipeline.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping at the next batch boundary");
            cancel.cancel();
        }
    });

    let result = job(pipeline).await;

    collector.flush().await;
    let metrics = collector.tick();
    reporter_cancel.cancel();
    let _ = reporter.await;
    debug!(
        rows_processed = metrics.rows_processed,
        errors = metrics.errors_total,
        peak_memory_mb = metrics.peak_memory_mb,
        "Final metrics"
    );
    result
}

fn build_resolver(profiles: Option<&Path>) -> Result<HeaderMappingResolver> {
    let resolver = HeaderMappingResolver::product_catalog();
    if let Some(path) = profiles {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read mapping profiles {}", path.display()))?;
        let parsed: HashMap<String, ColumnMapping> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse mapping profiles {}", path.display()))?;
        for (id, mapping) in parsed {
            resolver.register_profile(id, mapping);
        }
    }
    Ok(resolver)
}

/// Read the header row and the first rows of a CSV file
fn read_samples(path: &Path) -> Result<(Vec<String>, Vec<RawRecord>)> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let headers: Vec<String> = reader
        .headers()
        .context("Failed to read CSV header")?
        .iter()
        .map(str::to_string)
        .collect();
    let mut samples = Vec::with_capacity(MAPPING_SAMPLE_ROWS);
    for (i, record) in reader.records().take(MAPPING_SAMPLE_ROWS).enumerate() {
        let values: Vec<String> = record
            .with_context(|| format!("Failed to read CSV row {}", i + 1))?
            .iter()
            .map(str::to_string)
            .collect();
        samples.push(RawRecord::from_columns(i as u64 + 1, &headers, &values));
    }
    Ok((headers, samples))
}

async fn resolve_mapping(
    resolver: &HeaderMappingResolver,
    path: &Path,
    profile: Option<&str>,
) -> Result<ColumnMapping> {
    let (headers, samples) = read_samples(path)?;
    let mapping = resolver.resolve(&headers, &samples, profile).await?;
    let unmapped: Vec<&String> = headers.iter().filter(|h| !mapping.contains_key(*h)).collect();
    info!(mapped = mapping.len(), unmapped = ?unmapped, "Column mapping resolved");
    Ok(mapping)
}

/// Stream CSV rows from a blocking reader thread
fn csv_stream(path: PathBuf) -> RecordStream {
    let (tx, rx) = tokio::sync::mpsc::channel::<anyhow::Result<RawRecord>>(CSV_CHANNEL_CAPACITY);
    tokio::task::spawn_blocking(move || {
        let mut reader = match csv::Reader::from_path(&path) {
            Ok(reader) => reader,
            Err(e) => {
                let _ = tx.blocking_send(Err(anyhow::Error::new(e)
                    .context(format!("Failed to open {}", path.display()))));
                return;
            }
        };
        let headers: Vec<String> = match reader.headers() {
            Ok(headers) => headers.iter().map(str::to_string).collect(),
            Err(e) => {
                let _ = tx.blocking_send(Err(anyhow::Error::new(e).context("Failed to read CSV header")));
                return;
            }
        };
        for (i, record) in reader.records().enumerate() {
            let row_index = i as u64 + 1;
            let item = record
                .map(|record| {
                    let values: Vec<String> = record.iter().map(str::to_string).collect();
                    RawRecord::from_columns(row_index, &headers, &values)
                })
                .with_context(|| format!("Failed to read CSV row {}", row_index));
            let stop = item.is_err();
            if tx.blocking_send(item).is_err() || stop {
                break;
            }
        }
    });

    futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
}

fn mapped_stream(source: RecordStream, mapping: ColumnMapping) -> RecordStream {
    source
        .map(move |item| item.map(|record| apply_mapping(record, &mapping)))
        .boxed()
}
