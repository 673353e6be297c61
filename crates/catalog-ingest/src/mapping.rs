//! Source column to target field mapping
//!
//! [`HeaderMappingResolver`] maps file headers onto catalog fields by
//! normalized name, then by alias, then by Jaro-Winkler similarity. Fuzzy
//! matches onto numeric fields must be backed by numeric sample values.
//! Registered profiles override auto-detection.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use strsim::jaro_winkler;
use tracing::debug;

use crate::error::{ImportError, Result};
use crate::types::RawRecord;

/// Source column name to target field name
pub type ColumnMapping = HashMap<String, String>;

/// Minimum similarity for a fuzzy header match
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.9;

#[async_trait]
pub trait ColumnMappingResolver: Send + Sync {
    async fn resolve(
        &self,
        headers: &[String],
        sample_rows: &[RawRecord],
        profile_id: Option<&str>,
    ) -> Result<ColumnMapping>;
}

#[derive(Debug, Clone)]
pub struct TargetField {
    pub name: String,
    pub aliases: Vec<String>,
    /// Fuzzy matches require numeric sample values
    pub numeric: bool,
}

impl TargetField {
    pub fn new<I, S>(name: &str, aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.to_string(),
            aliases: aliases.into_iter().map(Into::into).collect(),
            numeric: false,
        }
    }

    pub fn numeric(mut self) -> Self {
        self.numeric = true;
        self
    }

    fn names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.name.as_str()).chain(self.aliases.iter().map(String::as_str))
    }
}

/// Lowercase, with runs of non-alphanumerics collapsed to one underscore
pub fn normalize_header(header: &str) -> String {
    let mut out = String::with_capacity(header.len());
    let mut pending_sep = false;
    for c in header.trim().chars() {
        if c.is_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.extend(c.to_lowercase());
        } else {
            pending_sep = true;
        }
    }
    out
}

fn looks_numeric(value: &str) -> bool {
    let cleaned: String = value
        .trim()
        .chars()
        .filter(|c| !matches!(c, '$' | '€' | '£' | ','))
        .collect();
    !cleaned.is_empty() && cleaned.parse::<f64>().is_ok()
}

pub struct HeaderMappingResolver {
    targets: Vec<TargetField>,
    profiles: RwLock<HashMap<String, ColumnMapping>>,
    similarity_threshold: f64,
}

impl HeaderMappingResolver {
    pub fn new(targets: Vec<TargetField>) -> Self {
        Self {
            targets,
            profiles: RwLock::new(HashMap::new()),
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
        }
    }

    /// Product catalog fields and their common aliases
    pub fn product_catalog() -> Self {
        Self::new(vec![
            TargetField::new(
                "sku",
                ["product_code", "item_code", "article_number", "product_id", "code"],
            ),
            TargetField::new("name", ["title", "product_name", "item_name"]),
            TargetField::new("description", ["desc", "details", "long_description"]),
            TargetField::new("price", ["unit_price", "cost", "amount", "retail_price"]).numeric(),
            TargetField::new("stock", ["qty", "quantity", "inventory", "stock_level"]).numeric(),
            TargetField::new("active", ["enabled", "is_active"]),
            TargetField::new("status", ["state", "publish_status"]),
            TargetField::new("category", ["category_name", "department", "product_type"]),
            TargetField::new("parent_sku", ["parent", "parent_code", "parent_id"]),
        ])
    }

    pub fn with_similarity_threshold(mut self, threshold: f64) -> Self {
        self.similarity_threshold = threshold;
        self
    }

    /// Register or replace a named mapping profile
    pub fn register_profile(&self, profile_id: impl Into<String>, mapping: ColumnMapping) {
        self.profiles
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(profile_id.into(), mapping);
    }

    fn profile(&self, profile_id: &str) -> Option<ColumnMapping> {
        self.profiles
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(profile_id)
            .cloned()
    }

    fn exact_target(&self, normalized: &str) -> Option<&TargetField> {
        self.targets
            .iter()
            .find(|t| t.names().any(|n| n == normalized))
    }

    fn fuzzy_target(&self, normalized: &str) -> Option<(&TargetField, f64)> {
        self.targets
            .iter()
            .filter_map(|t| {
                let best = t
                    .names()
                    .map(|n| jaro_winkler(normalized, n))
                    .fold(0.0_f64, f64::max);
                (best >= self.similarity_threshold).then_some((t, best))
            })
            .max_by(|a, b| a.1.total_cmp(&b.1))
    }

    fn samples_numeric(header: &str, sample_rows: &[RawRecord]) -> bool {
        let mut values = sample_rows
            .iter()
            .filter_map(|r| r.get(header))
            .filter(|v| !v.trim().is_empty())
            .peekable();
        values.peek().is_some() && values.all(looks_numeric)
    }
}

#[async_trait]
impl ColumnMappingResolver for HeaderMappingResolver {
    async fn resolve(
        &self,
        headers: &[String],
        sample_rows: &[RawRecord],
        profile_id: Option<&str>,
    ) -> Result<ColumnMapping> {
        let mut mapping = ColumnMapping::new();
        let mut claimed: HashSet<String> = HashSet::new();

        if let Some(id) = profile_id {
            let profile = self
                .profile(id)
                .ok_or_else(|| ImportError::Mapping(format!("Unknown mapping profile '{}'", id)))?;
            for header in headers {
                if let Some(target) = profile.get(header) {
                    claimed.insert(target.clone());
                    mapping.insert(header.clone(), target.clone());
                }
            }
        }

        // exact and alias matches take precedence over fuzzy ones
        for header in headers {
            if mapping.contains_key(header) {
                continue;
            }
            let normalized = normalize_header(header);
            if let Some(target) = self.exact_target(&normalized) {
                if claimed.insert(target.name.clone()) {
                    mapping.insert(header.clone(), target.name.clone());
                }
            }
        }

        for header in headers {
            if mapping.contains_key(header) {
                continue;
            }
            let normalized = normalize_header(header);
            let Some((target, score)) = self.fuzzy_target(&normalized) else {
                continue;
            };
            if claimed.contains(&target.name) {
                continue;
            }
            if target.numeric && !Self::samples_numeric(header, sample_rows) {
                debug!(header = %header, target = %target.name, "Fuzzy match rejected by sample values");
                continue;
            }
            debug!(header = %header, target = %target.name, score, "Fuzzy header match");
            claimed.insert(target.name.clone());
            mapping.insert(header.clone(), target.name.clone());
        }

        Ok(mapping)
    }
}

impl std::fmt::Debug for HeaderMappingResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeaderMappingResolver")
            .field("targets", &self.targets.len())
            .field("similarity_threshold", &self.similarity_threshold)
            .finish()
    }
}

/// Rename mapped columns; unmapped columns keep their source name
///
/// If two columns end up with the same name the first one wins.
pub fn apply_mapping(record: RawRecord, mapping: &ColumnMapping) -> RawRecord {
    let mut seen = HashSet::new();
    let fields = record
        .fields
        .into_iter()
        .map(|(name, value)| match mapping.get(&name) {
            Some(target) => (target.clone(), value),
            None => (name, value),
        })
        .filter(|(name, _)| seen.insert(name.clone()))
        .collect();
    RawRecord::new(record.row_index, fields)
}
