//! Checksum utilities for persisted state verification

use crate::error::{CatalogError, Result};
use sha2::{Digest, Sha256};

/// Compute a SHA-256 hex digest of an in-memory payload
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Verify an in-memory payload against an expected SHA-256 hex digest
pub fn verify_sha256(bytes: &[u8], expected: &str) -> Result<()> {
    let actual = sha256_hex(bytes);
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(CatalogError::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        })
    }
}
