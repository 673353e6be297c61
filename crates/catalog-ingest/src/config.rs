//! Import configuration
//!
//! `ImportConfig` carries every tunable of a run. It can be built from
//! defaults, from `IMPORT_*` environment variables, or from a TOML file layered
//! with the environment through the `config` crate.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::batch_sizer::SizerConfig;
use crate::error::{ImportError, Result};
use crate::recovery::RecoveryConfig;
use crate::resource::MonitorConfig;

/// Default memory ceiling in MB.
pub const DEFAULT_MAX_MEMORY_MB: u64 = 512;

/// Default warning threshold as a fraction of the memory ceiling.
pub const DEFAULT_WARNING_THRESHOLD: f64 = 0.70;

/// Default critical threshold as a fraction of the memory ceiling.
pub const DEFAULT_CRITICAL_THRESHOLD: f64 = 0.85;

/// Default backpressure threshold as a fraction of the memory ceiling.
pub const DEFAULT_BACKPRESSURE_THRESHOLD: f64 = 0.80;

/// Default number of failed attempts before a row stops retrying.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default first retry delay.
pub const DEFAULT_BASE_RETRY_DELAY_MS: u64 = 1_000;

/// Default upper bound for any retry delay.
pub const DEFAULT_MAX_BACKOFF_DELAY_MS: u64 = 30_000;

/// Default attempt count at which a row is dead-lettered.
pub const DEFAULT_DEAD_LETTER_THRESHOLD: u32 = 5;

/// Default per-call writer timeout.
pub const DEFAULT_WRITER_TIMEOUT_MS: u64 = 30_000;

/// Default fixed delay for dependency retries.
pub const DEFAULT_DEPENDENCY_RETRY_DELAY_MS: u64 = 5_000;

/// Whether rows are written or only validated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ImportMode {
    /// Validate and report only; the domain writer is never called
    DryRun,
    #[default]
    Execute,
}

impl ImportMode {
    pub fn as_str(&self) -> &str {
        match self {
            ImportMode::DryRun => "dry_run",
            ImportMode::Execute => "execute",
        }
    }
}

impl std::str::FromStr for ImportMode {
    type Err = ImportError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dry_run" | "dry-run" | "dryrun" => Ok(ImportMode::DryRun),
            "execute" => Ok(ImportMode::Execute),
            other => Err(ImportError::Config(format!("Unknown import mode: {}", other))),
        }
    }
}

/// Rules for deriving a row's dependency keys
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyRules {
    /// Column whose value is the key this row defines (e.g. "sku")
    pub key_field: Option<String>,
    /// Columns whose values reference keys defined elsewhere (e.g. "parent_sku")
    pub reference_fields: Vec<String>,
    /// Treat references that are neither known nor defined in the batch as failures
    pub strict: bool,
}

impl Default for DependencyRules {
    fn default() -> Self {
        Self {
            key_field: Some("sku".to_string()),
            reference_fields: vec!["parent_sku".to_string()],
            strict: false,
        }
    }
}

/// Main import configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    pub mode: ImportMode,
    pub max_memory_mb: u64,
    pub warning_threshold: f64,
    pub critical_threshold: f64,
    pub backpressure_threshold: f64,
    pub sampling_interval_ms: u64,
    /// Estimated memory cost of one in-flight row write
    pub per_operation_memory_mb: u64,
    pub max_concurrency: usize,
    pub max_retries: u32,
    pub base_retry_delay_ms: u64,
    pub max_backoff_delay_ms: u64,
    pub exponential_backoff: bool,
    pub dependency_retry_delay_ms: u64,
    pub dead_letter_threshold: u32,
    /// Rows between checkpoints; 0 checkpoints after every batch
    pub checkpoint_interval_rows: u64,
    pub writer_timeout_ms: u64,
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    pub initial_batch_size: usize,
    pub metrics_interval_ms: u64,
    pub dependencies: DependencyRules,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            mode: ImportMode::Execute,
            max_memory_mb: DEFAULT_MAX_MEMORY_MB,
            warning_threshold: DEFAULT_WARNING_THRESHOLD,
            critical_threshold: DEFAULT_CRITICAL_THRESHOLD,
            backpressure_threshold: DEFAULT_BACKPRESSURE_THRESHOLD,
            sampling_interval_ms: 1_000,
            per_operation_memory_mb: 8,
            max_concurrency: 20,
            max_retries: DEFAULT_MAX_RETRIES,
            base_retry_delay_ms: DEFAULT_BASE_RETRY_DELAY_MS,
            max_backoff_delay_ms: DEFAULT_MAX_BACKOFF_DELAY_MS,
            exponential_backoff: true,
            dependency_retry_delay_ms: DEFAULT_DEPENDENCY_RETRY_DELAY_MS,
            dead_letter_threshold: DEFAULT_DEAD_LETTER_THRESHOLD,
            checkpoint_interval_rows: 0,
            writer_timeout_ms: DEFAULT_WRITER_TIMEOUT_MS,
            min_batch_size: 10,
            max_batch_size: 250,
            initial_batch_size: 100,
            metrics_interval_ms: 30_000,
            dependencies: DependencyRules::default(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl ImportConfig {
    /// Load configuration from `IMPORT_*` environment variables (and `.env`)
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let d = Self::default();

        let mode = match std::env::var("IMPORT_MODE") {
            Ok(value) => value.parse()?,
            Err(_) => d.mode,
        };

        let reference_fields = std::env::var("IMPORT_DEPENDENCY_REFERENCE_FIELDS")
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_else(|_| d.dependencies.reference_fields.clone());

        let config = Self {
            mode,
            max_memory_mb: env_parse("IMPORT_MAX_MEMORY_MB", d.max_memory_mb),
            warning_threshold: env_parse("IMPORT_WARNING_THRESHOLD", d.warning_threshold),
            critical_threshold: env_parse("IMPORT_CRITICAL_THRESHOLD", d.critical_threshold),
            backpressure_threshold: env_parse(
                "IMPORT_BACKPRESSURE_THRESHOLD",
                d.backpressure_threshold,
            ),
            sampling_interval_ms: env_parse("IMPORT_SAMPLING_INTERVAL_MS", d.sampling_interval_ms),
            per_operation_memory_mb: env_parse(
                "IMPORT_PER_OPERATION_MEMORY_MB",
                d.per_operation_memory_mb,
            ),
            max_concurrency: env_parse("IMPORT_MAX_CONCURRENCY", d.max_concurrency),
            max_retries: env_parse("IMPORT_MAX_RETRIES", d.max_retries),
            base_retry_delay_ms: env_parse("IMPORT_BASE_RETRY_DELAY_MS", d.base_retry_delay_ms),
            max_backoff_delay_ms: env_parse("IMPORT_MAX_BACKOFF_DELAY_MS", d.max_backoff_delay_ms),
            exponential_backoff: env_parse("IMPORT_EXPONENTIAL_BACKOFF", d.exponential_backoff),
            dependency_retry_delay_ms: env_parse(
                "IMPORT_DEPENDENCY_RETRY_DELAY_MS",
                d.dependency_retry_delay_ms,
            ),
            dead_letter_threshold: env_parse(
                "IMPORT_DEAD_LETTER_THRESHOLD",
                d.dead_letter_threshold,
            ),
            checkpoint_interval_rows: env_parse(
                "IMPORT_CHECKPOINT_INTERVAL_ROWS",
                d.checkpoint_interval_rows,
            ),
            writer_timeout_ms: env_parse("IMPORT_WRITER_TIMEOUT_MS", d.writer_timeout_ms),
            min_batch_size: env_parse("IMPORT_MIN_BATCH_SIZE", d.min_batch_size),
            max_batch_size: env_parse("IMPORT_MAX_BATCH_SIZE", d.max_batch_size),
            initial_batch_size: env_parse("IMPORT_INITIAL_BATCH_SIZE", d.initial_batch_size),
            metrics_interval_ms: env_parse("IMPORT_METRICS_INTERVAL_MS", d.metrics_interval_ms),
            dependencies: DependencyRules {
                key_field: std::env::var("IMPORT_DEPENDENCY_KEY_FIELD")
                    .ok()
                    .or(d.dependencies.key_field.clone()),
                reference_fields,
                strict: env_parse("IMPORT_DEPENDENCY_STRICT", d.dependencies.strict),
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Load from an optional TOML file, then overlay `IMPORT_*` environment variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("IMPORT")
                .prefix_separator("_")
                .try_parsing(true)
                .separator("__"),
        );

        let settings = builder
            .build()
            .map_err(|e| ImportError::Config(format!("Failed to read configuration: {}", e)))?;
        let config: Self = settings
            .try_deserialize()
            .map_err(|e| ImportError::Config(format!("Failed to parse configuration: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_memory_mb == 0 {
            return Err(ImportError::Config("max_memory_mb must be greater than 0".into()));
        }
        let thresholds_ordered = 0.0 < self.warning_threshold
            && self.warning_threshold <= self.backpressure_threshold
            && self.backpressure_threshold <= self.critical_threshold
            && self.critical_threshold <= 1.0;
        if !thresholds_ordered {
            return Err(ImportError::Config(format!(
                "thresholds must satisfy 0 < warning ({}) <= backpressure ({}) <= critical ({}) <= 1",
                self.warning_threshold, self.backpressure_threshold, self.critical_threshold
            )));
        }
        if self.min_batch_size == 0 || self.min_batch_size > self.max_batch_size {
            return Err(ImportError::Config(format!(
                "batch size bounds invalid: min {} max {}",
                self.min_batch_size, self.max_batch_size
            )));
        }
        if self.dead_letter_threshold == 0 {
            return Err(ImportError::Config(
                "dead_letter_threshold must be at least 1".into(),
            ));
        }
        if self.max_concurrency == 0 {
            return Err(ImportError::Config("max_concurrency must be at least 1".into()));
        }
        for (name, value) in [
            ("sampling_interval_ms", self.sampling_interval_ms),
            ("metrics_interval_ms", self.metrics_interval_ms),
            ("writer_timeout_ms", self.writer_timeout_ms),
        ] {
            if value == 0 {
                return Err(ImportError::Config(format!("{} must be greater than 0", name)));
            }
        }
        if self.base_retry_delay_ms > self.max_backoff_delay_ms {
            return Err(ImportError::Config(format!(
                "base_retry_delay_ms ({}) exceeds max_backoff_delay_ms ({})",
                self.base_retry_delay_ms, self.max_backoff_delay_ms
            )));
        }
        Ok(())
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            max_memory_mb: self.max_memory_mb,
            warning_threshold: self.warning_threshold,
            critical_threshold: self.critical_threshold,
            backpressure_threshold: self.backpressure_threshold,
            sampling_interval: Duration::from_millis(self.sampling_interval_ms),
            per_operation_memory_mb: self.per_operation_memory_mb.max(1),
            max_concurrency_cap: self.max_concurrency,
            ..MonitorConfig::default()
        }
    }

    pub fn sizer_config(&self) -> SizerConfig {
        SizerConfig {
            min_size: self.min_batch_size,
            max_size: self.max_batch_size,
            initial_size: self.initial_batch_size,
        }
    }

    pub fn recovery_config(&self) -> RecoveryConfig {
        RecoveryConfig {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_retry_delay_ms),
            max_backoff_delay: Duration::from_millis(self.max_backoff_delay_ms),
            exponential_backoff: self.exponential_backoff,
            dependency_retry_delay: Duration::from_millis(self.dependency_retry_delay_ms),
            dead_letter_threshold: self.dead_letter_threshold,
            checkpoint_interval_rows: self.checkpoint_interval_rows,
            writer_timeout: Duration::from_millis(self.writer_timeout_ms),
            dependencies: self.dependencies.clone(),
        }
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = ImportConfig::default();
        assert_eq!(config.warning_threshold, 0.70);
        assert_eq!(config.critical_threshold, 0.85);
        assert_eq!(config.backpressure_threshold, 0.80);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.base_retry_delay_ms, 1_000);
        assert_eq!(config.max_backoff_delay_ms, 30_000);
        assert_eq!(config.dead_letter_threshold, 5);
        assert_eq!(config.min_batch_size, 10);
        assert_eq!(config.max_batch_size, 250);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_unordered_thresholds() {
        let config = ImportConfig {
            warning_threshold: 0.9,
            critical_threshold: 0.8,
            ..ImportConfig::default()
        };
        assert!(matches!(config.validate(), Err(ImportError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_inverted_batch_bounds() {
        let config = ImportConfig {
            min_batch_size: 300,
            ..ImportConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_intervals() {
        let zero_sampling = ImportConfig {
            sampling_interval_ms: 0,
            ..ImportConfig::default()
        };
        let zero_metrics = ImportConfig {
            metrics_interval_ms: 0,
            ..ImportConfig::default()
        };
        let zero_timeout = ImportConfig {
            writer_timeout_ms: 0,
            ..ImportConfig::default()
        };
        for config in [zero_sampling, zero_metrics, zero_timeout] {
            assert!(matches!(config.validate(), Err(ImportError::Config(_))));
        }
        assert!(ImportConfig::default().validate().is_ok());
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("dry-run".parse::<ImportMode>().unwrap(), ImportMode::DryRun);
        assert_eq!("EXECUTE".parse::<ImportMode>().unwrap(), ImportMode::Execute);
        assert!("maybe".parse::<ImportMode>().is_err());
    }

    #[test]
    #[serial]
    fn test_from_env_reads_import_variables() {
        std::env::set_var("IMPORT_MODE", "dry_run");
        std::env::set_var("IMPORT_MAX_RETRIES", "7");
        std::env::set_var("IMPORT_DEPENDENCY_REFERENCE_FIELDS", "parent_sku, category");

        let config = ImportConfig::from_env().unwrap();
        assert_eq!(config.mode, ImportMode::DryRun);
        assert_eq!(config.max_retries, 7);
        assert_eq!(
            config.dependencies.reference_fields,
            vec!["parent_sku".to_string(), "category".to_string()]
        );

        std::env::remove_var("IMPORT_MODE");
        std::env::remove_var("IMPORT_MAX_RETRIES");
        std::env::remove_var("IMPORT_DEPENDENCY_REFERENCE_FIELDS");
    }

    #[test]
    #[serial]
    fn test_load_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
mode = "dry_run"
max_memory_mb = 100
dead_letter_threshold = 3

[dependencies]
key_field = "handle"
reference_fields = ["group"]
strict = true
"#
        )
        .unwrap();

        let config = ImportConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.mode, ImportMode::DryRun);
        assert_eq!(config.max_memory_mb, 100);
        assert_eq!(config.dead_letter_threshold, 3);
        assert_eq!(config.dependencies.key_field.as_deref(), Some("handle"));
        assert!(config.dependencies.strict);
        // untouched keys keep their defaults
        assert_eq!(config.max_retries, DEFAULT_MAX_RETRIES);
    }

    #[test]
    fn test_recovery_config_conversion() {
        let config = ImportConfig::default();
        let recovery = config.recovery_config();
        assert_eq!(recovery.base_delay, Duration::from_secs(1));
        assert_eq!(recovery.max_backoff_delay, Duration::from_secs(30));
        assert_eq!(recovery.dead_letter_threshold, 5);
    }
}
