//! Common types used across the catalog import crates

use chrono::Utc;

/// 1-based position of a record in its source file
pub type RowIndex = u64;

/// Milliseconds since the Unix epoch, as stored in attempt records and checkpoints
pub fn epoch_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Convert a byte count into whole-and-fractional megabytes
pub fn bytes_to_mb(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_to_mb() {
        assert_eq!(bytes_to_mb(0), 0.0);
        assert_eq!(bytes_to_mb(1024 * 1024), 1.0);
        assert_eq!(bytes_to_mb(512 * 1024), 0.5);
    }

    #[test]
    fn test_epoch_millis_is_monotonic_enough() {
        let a = epoch_millis();
        let b = epoch_millis();
        assert!(b >= a);
        assert!(a > 1_600_000_000_000);
    }
}
