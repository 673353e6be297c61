//! Rule-based row schema

use std::collections::HashSet;

use super::RowValidator;
use crate::error::{ImportError, Result};
use crate::types::{IssueSeverity, RawRecord, ValidatedRow, ValidationIssue};

/// Expected shape of a field value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Integer,
    Decimal,
    Boolean,
}

impl FieldKind {
    fn accepts(&self, value: &str) -> bool {
        match self {
            FieldKind::Text => true,
            FieldKind::Integer => value.parse::<i64>().is_ok(),
            FieldKind::Decimal => value.parse::<f64>().map(|v| v.is_finite()).unwrap_or(false),
            FieldKind::Boolean => matches!(
                value.to_ascii_lowercase().as_str(),
                "true" | "false" | "1" | "0" | "yes" | "no"
            ),
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            FieldKind::Text => "text",
            FieldKind::Integer => "integer",
            FieldKind::Decimal => "decimal",
            FieldKind::Boolean => "boolean",
        }
    }
}

/// Constraints for one target field
#[derive(Debug, Clone, PartialEq)]
pub struct FieldRule {
    pub name: String,
    pub required: bool,
    pub kind: FieldKind,
    pub max_length: Option<usize>,
    pub allowed_values: Option<Vec<String>>,
}

impl FieldRule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: false,
            kind: FieldKind::Text,
            max_length: None,
            allowed_values: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn kind(mut self, kind: FieldKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn max_length(mut self, max_length: usize) -> Self {
        self.max_length = Some(max_length);
        self
    }

    pub fn allowed_values<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_values = Some(values.into_iter().map(Into::into).collect());
        self
    }

    fn check(&self, value: Option<&str>, issues: &mut Vec<ValidationIssue>) {
        let value = value.map(str::trim).filter(|v| !v.is_empty());
        let Some(value) = value else {
            if self.required {
                issues.push(
                    ValidationIssue::new(
                        "required",
                        "Required field",
                        IssueSeverity::Error,
                        format!("Field '{}' is required", self.name),
                    )
                    .with_field(&self.name),
                );
            }
            return;
        };

        if !self.kind.accepts(value) {
            issues.push(
                ValidationIssue::new(
                    "type",
                    "Field type",
                    IssueSeverity::Error,
                    format!(
                        "Field '{}' expects a {} value, got '{}'",
                        self.name,
                        self.kind.as_str(),
                        value
                    ),
                )
                .with_field(&self.name),
            );
        }

        if let Some(max) = self.max_length {
            let len = value.chars().count();
            if len > max {
                issues.push(
                    ValidationIssue::new(
                        "max_length",
                        "Maximum length",
                        IssueSeverity::Error,
                        format!("Field '{}' is {} characters long, limit is {}", self.name, len, max),
                    )
                    .with_field(&self.name)
                    .with_suggestion(format!("Shorten the value to {} characters", max)),
                );
            }
        }

        if let Some(allowed) = &self.allowed_values {
            if !allowed.iter().any(|a| a.eq_ignore_ascii_case(value)) {
                issues.push(
                    ValidationIssue::new(
                        "allowed_values",
                        "Allowed values",
                        IssueSeverity::Error,
                        format!("Field '{}' has unsupported value '{}'", self.name, value),
                    )
                    .with_field(&self.name)
                    .with_suggestion(format!("Use one of: {}", allowed.join(", "))),
                );
            }
        }
    }
}

/// [`RowValidator`] driven by a list of [`FieldRule`]s
#[derive(Debug, Clone)]
pub struct SchemaRowValidator {
    rules: Vec<FieldRule>,
    warn_unknown_columns: bool,
    setup_error: Option<String>,
}

impl SchemaRowValidator {
    pub fn new(rules: Vec<FieldRule>) -> Self {
        let setup_error = check_rules(&rules);
        Self {
            rules,
            warn_unknown_columns: true,
            setup_error,
        }
    }

    /// Schema for product catalog rows
    pub fn product_catalog() -> Self {
        Self::new(vec![
            FieldRule::new("sku").required().max_length(64),
            FieldRule::new("name").required().max_length(255),
            FieldRule::new("description").max_length(5000),
            FieldRule::new("price").required().kind(FieldKind::Decimal),
            FieldRule::new("stock").kind(FieldKind::Integer),
            FieldRule::new("active").kind(FieldKind::Boolean),
            FieldRule::new("status").allowed_values(["draft", "published", "archived"]),
            FieldRule::new("category").max_length(128),
            FieldRule::new("parent_sku").max_length(64),
        ])
    }

    pub fn warn_unknown_columns(mut self, warn: bool) -> Self {
        self.warn_unknown_columns = warn;
        self
    }

    pub fn rules(&self) -> &[FieldRule] {
        &self.rules
    }
}

fn check_rules(rules: &[FieldRule]) -> Option<String> {
    let mut seen = HashSet::new();
    for rule in rules {
        if rule.name.trim().is_empty() {
            return Some("field rule with empty name".to_string());
        }
        if !seen.insert(rule.name.as_str()) {
            return Some(format!("duplicate rule for field '{}'", rule.name));
        }
        if rule.max_length == Some(0) {
            return Some(format!("field '{}' has max_length 0", rule.name));
        }
        if matches!(&rule.allowed_values, Some(values) if values.is_empty()) {
            return Some(format!("field '{}' has an empty allowed value list", rule.name));
        }
    }
    None
}

impl RowValidator for SchemaRowValidator {
    fn validate(&self, record: &RawRecord) -> Result<(Option<ValidatedRow>, Vec<ValidationIssue>)> {
        if let Some(message) = &self.setup_error {
            return Err(ImportError::ValidatorSetup(message.clone()));
        }

        let mut issues = Vec::new();
        for rule in &self.rules {
            rule.check(record.get(&rule.name), &mut issues);
        }

        if self.warn_unknown_columns {
            for column in record.columns() {
                if !self.rules.iter().any(|r| r.name == column) {
                    issues.push(
                        ValidationIssue::new(
                            "unknown_column",
                            "Unknown column",
                            IssueSeverity::Warning,
                            format!("Column '{}' is not part of the schema and is passed through", column),
                        )
                        .with_field(column),
                    );
                }
            }
        }

        let rejected = issues.iter().any(|i| i.severity.rejects_row());
        let row = (!rejected).then(|| ValidatedRow::new(record.row_index, record.fields.clone()));
        Ok((row, issues))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(fields: &[(&str, &str)]) -> RawRecord {
        RawRecord::new(
            1,
            fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_valid_product_row() {
        let validator = SchemaRowValidator::product_catalog();
        let (row, issues) = validator
            .validate(&record(&[("sku", "A-1"), ("name", "Mug"), ("price", "4.50"), ("active", "yes")]))
            .unwrap();
        assert!(row.is_some());
        assert!(issues.is_empty());
    }

    #[test]
    fn test_missing_required_and_bad_type() {
        let validator = SchemaRowValidator::product_catalog();
        let (row, issues) = validator
            .validate(&record(&[("sku", " "), ("name", "Mug"), ("price", "cheap")]))
            .unwrap();
        assert!(row.is_none());
        let rules: Vec<_> = issues.iter().map(|i| i.rule_id.as_str()).collect();
        assert_eq!(rules, vec!["required", "type"]);
    }

    #[test]
    fn test_allowed_values_and_length() {
        let validator = SchemaRowValidator::new(vec![
            FieldRule::new("status").allowed_values(["draft", "published"]),
            FieldRule::new("code").max_length(3),
        ]);
        let (row, issues) = validator
            .validate(&record(&[("status", "PUBLISHED"), ("code", "ABCD")]))
            .unwrap();
        assert!(row.is_none());
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].rule_id, "max_length");
    }

    #[test]
    fn test_unknown_columns_only_warn() {
        let validator = SchemaRowValidator::new(vec![FieldRule::new("sku").required()]);
        let (row, issues) = validator.validate(&record(&[("sku", "A"), ("color", "red")])).unwrap();
        assert!(row.is_some());
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].severity, IssueSeverity::Warning);

        let quiet = validator.warn_unknown_columns(false);
        let (_, issues) = quiet.validate(&record(&[("sku", "A"), ("color", "red")])).unwrap();
        assert!(issues.is_empty());
    }

    #[test]
    fn test_malformed_schema_is_setup_error() {
        let validator = SchemaRowValidator::new(vec![FieldRule::new("sku"), FieldRule::new("sku")]);
        let result = validator.validate(&record(&[("sku", "A")]));
        assert!(matches!(result, Err(ImportError::ValidatorSetup(_))));
    }
}
