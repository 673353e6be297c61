//! Record sanitizing, schema validation and batch assembly

pub mod sanitize;
pub mod schema;
pub mod streaming;

use crate::error::Result;
use crate::types::{RawRecord, ValidatedRow, ValidationIssue};

pub use sanitize::{sanitize_record, strip_formula_prefix, FORMULA_INJECTION_RULE};
pub use schema::{FieldKind, FieldRule, SchemaRowValidator};
pub use streaming::StreamingValidator;

/// Row-schema validator
///
/// Returns the typed row when the record is acceptable, plus every issue
/// found. An `Err` means the validator itself is unusable and ends the job.
pub trait RowValidator: Send + Sync {
    fn validate(&self, record: &RawRecord) -> Result<(Option<ValidatedRow>, Vec<ValidationIssue>)>;
}
