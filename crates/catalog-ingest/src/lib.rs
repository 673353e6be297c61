//! Catalog Ingest Library
//!
//! Batch ingestion core for product catalog imports: turns an arbitrarily
//! large tabular source into validated catalog rows under a memory budget,
//! with retry, dead-lettering and checkpoint-based recovery of failed writes.
//!
//! # Components
//!
//! - **Resource Monitor** ([`resource`]): memory sampling, concurrency slots, backpressure
//! - **Adaptive Batch Sizer** ([`batch_sizer`]): throughput-driven batch sizing
//! - **Streaming Validator** ([`validation`]): sanitizing, schema checks, batch assembly
//! - **Recovery Manager** ([`recovery`]): dependency ordering, retries, checkpoints
//! - **Metrics & Alerting** ([`metrics`]): event aggregation and threshold alerts
//!
//! # Example
//!
//! ```no_run
//! use catalog_ingest::{ImportConfig, ImportMode, ImportPipeline, RawRecord};
//! use futures::stream;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pipeline = ImportPipeline::builder().build();
//!     let rows = vec![Ok(RawRecord::new(
//!         1,
//!         vec![
//!             ("sku".to_string(), "MUG-1".to_string()),
//!             ("name".to_string(), "Mug".to_string()),
//!             ("price".to_string(), "9.50".to_string()),
//!         ],
//!     ))];
//!     let config = ImportConfig { mode: ImportMode::DryRun, ..Default::default() };
//!     let result = pipeline.run_import(stream::iter(rows), &config).await?;
//!     println!("{} valid rows", result.valid_rows);
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod artifacts;
pub mod batch_sizer;
pub mod config;
pub mod error;
pub mod mapping;
pub mod metrics;
pub mod pipeline;
pub mod recovery;
pub mod resource;
pub mod types;
pub mod validation;
pub mod writer;

pub use config::{DependencyRules, ImportConfig, ImportMode};
pub use error::{ImportError, Result, WriteError};
pub use pipeline::{ImportJobResult, ImportPipeline, RecordStream};
pub use types::{Batch, RawRecord, ValidatedRow, ValidationIssue};
