//! Error types for the ingestion core
//!
//! Job-level failures surface as [`ImportError`] and terminate a run. Row-level
//! failures are [`WriteError`]s; they never leave the recovery manager.

use catalog_common::types::RowIndex;
use thiserror::Error;
use uuid::Uuid;

use crate::recovery::ErrorType;

/// Result type alias for ingestion operations
pub type Result<T> = std::result::Result<T, ImportError>;

/// Job-level error for an import run
#[derive(Error, Debug)]
pub enum ImportError {
    /// The raw record stream failed to open or yielded a read error
    #[error("Record source failed: {0}")]
    Source(String),

    /// The row validator could not be used (bad schema setup)
    #[error("Row validator setup failed: {0}")]
    ValidatorSetup(String),

    #[error("Invalid import configuration: {0}")]
    Config(String),

    #[error("Checkpoint store error: {0}")]
    Checkpoint(String),

    #[error("Checkpoint not found: {0}")]
    CheckpointNotFound(Uuid),

    #[error("No checkpoint recorded for job {0}")]
    NoCheckpointForJob(Uuid),

    #[error("Artifact publication failed for '{kind}': {message}")]
    Artifact { kind: String, message: String },

    #[error("Column mapping failed: {0}")]
    Mapping(String),

    /// A row tried to move between lifecycle states in a way the ledger forbids
    #[error("Row {row_index} cannot move from {from} to {to}")]
    InvalidTransition {
        row_index: RowIndex,
        from: &'static str,
        to: &'static str,
    },

    #[error("Import cancelled")]
    Cancelled,

    #[error(transparent)]
    Common(#[from] catalog_common::CatalogError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Row-level failure reported by a [`crate::writer::DomainWriter`]
///
/// Writers may pin the [`ErrorType`] explicitly; otherwise it is derived from
/// the message by [`crate::recovery::classify_error`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct WriteError {
    pub message: String,
    pub error_type: Option<ErrorType>,
}

impl WriteError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
        }
    }

    pub fn typed(error_type: ErrorType, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: Some(error_type),
        }
    }

    /// Resolve the error type, falling back to message inspection
    pub fn classify(&self) -> ErrorType {
        self.error_type
            .unwrap_or_else(|| crate::recovery::classify_error(&self.message))
    }
}

impl From<anyhow::Error> for WriteError {
    fn from(e: anyhow::Error) -> Self {
        Self::new(format!("{:#}", e))
    }
}
