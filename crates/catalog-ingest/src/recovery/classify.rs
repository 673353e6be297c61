//! Failure classification
//!
//! Maps a writer error message onto the error taxonomy and each error type
//! onto its retryability.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    Validation,
    Database,
    Network,
    Memory,
    BusinessLogic,
    Dependency,
    Timeout,
    Unknown,
}

impl ErrorType {
    pub const ALL: [ErrorType; 8] = [
        ErrorType::Validation,
        ErrorType::Database,
        ErrorType::Network,
        ErrorType::Memory,
        ErrorType::BusinessLogic,
        ErrorType::Dependency,
        ErrorType::Timeout,
        ErrorType::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::Validation => "validation",
            ErrorType::Database => "database",
            ErrorType::Network => "network",
            ErrorType::Memory => "memory",
            ErrorType::BusinessLogic => "business_logic",
            ErrorType::Dependency => "dependency",
            ErrorType::Timeout => "timeout",
            ErrorType::Unknown => "unknown",
        }
    }

    pub fn severity(&self) -> FailureSeverity {
        match self {
            ErrorType::Network | ErrorType::Timeout | ErrorType::Memory => FailureSeverity::Recoverable,
            ErrorType::Validation | ErrorType::BusinessLogic => FailureSeverity::Permanent,
            ErrorType::Database | ErrorType::Dependency | ErrorType::Unknown => FailureSeverity::Critical,
        }
    }
}

impl std::fmt::Display for ErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retryability of a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureSeverity {
    Recoverable,
    Critical,
    Permanent,
}

impl FailureSeverity {
    /// Recovery ordering: recoverable first, permanent last
    pub fn rank(&self) -> u8 {
        match self {
            FailureSeverity::Recoverable => 0,
            FailureSeverity::Critical => 1,
            FailureSeverity::Permanent => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureSeverity::Recoverable => "recoverable",
            FailureSeverity::Critical => "critical",
            FailureSeverity::Permanent => "permanent",
        }
    }
}

// Checked in order; the first group with a matching keyword wins. Keywords
// match whole words, so "rule" does not fire on "overrule". A bare "invalid"
// only decides when no more specific group matched: "invalid connection handle"
// is a network failure.
const PATTERNS: &[(ErrorType, &[&str])] = &[
    (ErrorType::Validation, &["validation", "required", "must be"]),
    (ErrorType::Timeout, &["timeout", "timed out"]),
    (
        ErrorType::Network,
        &["network", "connection", "econnrefused", "econnreset", "socket", "unreachable"],
    ),
    (ErrorType::Memory, &["out of memory", "memory", "heap"]),
    (
        ErrorType::Dependency,
        &["dependency", "not found", "missing reference", "foreign key"],
    ),
    (
        ErrorType::Database,
        &["database", "sql", "constraint", "deadlock", "duplicate key"],
    ),
    (ErrorType::BusinessLogic, &["business", "rule", "rules", "not allowed"]),
    (ErrorType::Validation, &["invalid"]),
];

/// True if the words of `keyword` appear consecutively in `words`
fn contains_words(words: &[&str], keyword: &str) -> bool {
    let needle: Vec<&str> = keyword.split(' ').collect();
    words.windows(needle.len()).any(|window| window == needle.as_slice())
}

/// Classify an error message by case-insensitive keyword inspection
pub fn classify_error(message: &str) -> ErrorType {
    let message = message.to_lowercase();
    let words: Vec<&str> = message
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    PATTERNS
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|k| contains_words(&words, k)))
        .map(|(error_type, _)| *error_type)
        .unwrap_or(ErrorType::Unknown)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_error_keywords() {
        assert_eq!(classify_error("Validation failed: price"), ErrorType::Validation);
        assert_eq!(classify_error("request timed out"), ErrorType::Timeout);
        assert_eq!(classify_error("ECONNRESET while writing"), ErrorType::Network);
        assert_eq!(classify_error("JavaScript heap exhausted"), ErrorType::Memory);
        assert_eq!(classify_error("category parent-9 not found"), ErrorType::Dependency);
        assert_eq!(classify_error("deadlock detected"), ErrorType::Database);
        assert_eq!(classify_error("discount rule violated"), ErrorType::BusinessLogic);
        assert_eq!(classify_error("something odd"), ErrorType::Unknown);
    }

    #[test]
    fn test_keywords_match_whole_words() {
        assert_eq!(classify_error("invalid connection handle"), ErrorType::Network);
        assert_eq!(classify_error("invalid price"), ErrorType::Validation);
        assert_eq!(classify_error("Invalid SKU format"), ErrorType::Validation);
        assert_eq!(classify_error("manager overruled the import"), ErrorType::Unknown);
        assert_eq!(classify_error("ruleset reload failed"), ErrorType::Unknown);
        assert_eq!(classify_error("pricing rules: not allowed"), ErrorType::BusinessLogic);
        assert_eq!(classify_error("SocketError: reset"), ErrorType::Unknown);
        assert_eq!(classify_error("socket closed"), ErrorType::Network);
    }

    #[test]
    fn test_validation_wins_over_database_keywords() {
        assert_eq!(
            classify_error("SQL constraint: validation failed for sku"),
            ErrorType::Validation
        );
    }

    #[test]
    fn test_severity_mapping() {
        assert_eq!(ErrorType::Network.severity(), FailureSeverity::Recoverable);
        assert_eq!(ErrorType::Timeout.severity(), FailureSeverity::Recoverable);
        assert_eq!(ErrorType::Memory.severity(), FailureSeverity::Recoverable);
        assert_eq!(ErrorType::Database.severity(), FailureSeverity::Critical);
        assert_eq!(ErrorType::Dependency.severity(), FailureSeverity::Critical);
        assert_eq!(ErrorType::Validation.severity(), FailureSeverity::Permanent);
        assert_eq!(ErrorType::BusinessLogic.severity(), FailureSeverity::Permanent);
        assert_eq!(ErrorType::Unknown.severity(), FailureSeverity::Critical);
    }

    #[test]
    fn test_error_type_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorType::BusinessLogic).unwrap();
        assert_eq!(json, "\"business_logic\"");
    }
}
