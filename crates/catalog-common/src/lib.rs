//! Catalog Common Library
//!
//! Shared types, utilities, and error handling for the catalog import workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`CatalogError`] and the crate-wide [`Result`] alias
//! - **Logging**: `tracing` subscriber setup driven by `LOG_*` environment variables
//! - **Checksums**: integrity digests for persisted state (checkpoints, artifacts)
//! - **Types**: small shared types such as [`types::RowIndex`] and clock helpers
//!
//! # Example
//!
//! ```
//! use catalog_common::checksum::{sha256_hex, verify_sha256};
//!
//! fn check(payload: &[u8], stored: &str) -> catalog_common::Result<()> {
//!     verify_sha256(payload, stored)
//! }
//!
//! let digest = sha256_hex(b"checkpoint");
//! assert!(check(b"checkpoint", &digest).is_ok());
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod checksum;
pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{CatalogError, Result};
