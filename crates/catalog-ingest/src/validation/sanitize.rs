//! Spreadsheet formula-injection scrubbing

use crate::types::{IssueSeverity, RawRecord, ValidationIssue};

pub const FORMULA_INJECTION_RULE: &str = "formula_injection";

const FORMULA_PREFIXES: [char; 4] = ['=', '+', '-', '@'];

/// Strip a formula trigger from a value
///
/// Returns the cleaned value when the first non-whitespace character is one of
/// `= + - @`, otherwise `None`. Negative numbers are flagged as well.
pub fn strip_formula_prefix(value: &str) -> Option<String> {
    let trimmed = value.trim_start();
    let mut chars = trimmed.chars();
    match chars.next() {
        Some(c) if FORMULA_PREFIXES.contains(&c) => Some(chars.as_str().to_string()),
        _ => None,
    }
}

/// Scrub every value of a record in place, returning one critical issue per cleaned field
pub fn sanitize_record(record: &mut RawRecord) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    for (column, value) in record.fields.iter_mut() {
        if let Some(cleaned) = strip_formula_prefix(value) {
            issues.push(
                ValidationIssue::new(
                    FORMULA_INJECTION_RULE,
                    "Formula injection",
                    IssueSeverity::Critical,
                    format!("Value of '{}' starts with a spreadsheet formula character", column),
                )
                .with_field(column.clone())
                .with_suggestion("Remove the leading '=', '+', '-' or '@'"),
            );
            *value = cleaned;
        }
    }
    issues
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_formula_prefix() {
        assert_eq!(strip_formula_prefix("=SUM(A1:A3)"), Some("SUM(A1:A3)".to_string()));
        assert_eq!(strip_formula_prefix("   @cmd"), Some("cmd".to_string()));
        assert_eq!(strip_formula_prefix("+1"), Some("1".to_string()));
        assert_eq!(strip_formula_prefix("-5"), Some("5".to_string()));
        assert_eq!(strip_formula_prefix("Mug = cup"), None);
        assert_eq!(strip_formula_prefix(""), None);
    }

    #[test]
    fn test_sanitize_record_flags_each_field() {
        let mut record = RawRecord::new(
            4,
            vec![
                ("sku".to_string(), "SKU-4".to_string()),
                ("name".to_string(), "=HYPERLINK(\"x\")".to_string()),
                ("note".to_string(), " +cmd".to_string()),
            ],
        );
        let issues = sanitize_record(&mut record);
        assert_eq!(issues.len(), 2);
        assert!(issues.iter().all(|i| i.severity == IssueSeverity::Critical));
        assert_eq!(issues[0].field.as_deref(), Some("name"));
        assert_eq!(record.get("name"), Some("HYPERLINK(\"x\")"));
        assert_eq!(record.get("note"), Some("cmd"));
        assert_eq!(record.get("sku"), Some("SKU-4"));
    }
}
