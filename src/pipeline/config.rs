//! Pipeline configuration for the orchestrator and stage processors.
//!
//! This module provides configuration for storage locations, the content
//! transform (model, sampling, timeout), the parse quality gate, and the
//! concurrency limits of every fan-out.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::llm::DEFAULT_MODEL;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// The configuration file could not be parsed.
    #[error("Invalid configuration file '{path}': {message}")]
    InvalidFile { path: String, message: String },

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Upper bound for `page_concurrency`.
pub const MAX_PAGE_CONCURRENCY: usize = 20;

/// Configuration for a pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    // Storage settings
    /// Base directory for stage artifacts.
    pub artifact_root: PathBuf,
    /// SQLite connection URL for the version store.
    pub database_url: String,

    // Transform settings
    /// Model passed to the LLM provider.
    pub model: String,
    /// Sampling temperature for every transform call.
    pub temperature: f64,
    /// Maximum tokens per transform response.
    pub max_tokens: u32,
    /// Caller-side timeout for a single transform call.
    #[serde(with = "duration_secs")]
    pub transform_timeout: Duration,

    // Quality gate
    /// Minimum readability confidence (0-100) for a document to be parsed.
    pub quality_threshold: f64,
    /// Number of leading pages sampled by the quality gate.
    pub quality_sample_pages: usize,

    // Fan-out limits
    /// Pages transcribed concurrently within one document (1-20).
    pub page_concurrency: usize,
    /// Sequential extraction passes per document.
    pub extract_iterations: u32,
    /// Entity-detail calls in flight per document.
    pub entity_concurrency: usize,
    /// Candidate entities sent per merge call.
    pub merge_batch_size: usize,
    /// Stage jobs (input files, documents) processed concurrently.
    pub stage_concurrency: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            artifact_root: PathBuf::from("./artifacts"),
            database_url: "sqlite://onto-forge.db".to_string(),

            model: DEFAULT_MODEL.to_string(),
            temperature: 0.2,
            max_tokens: 8000,
            transform_timeout: Duration::from_secs(120),

            quality_threshold: 75.0,
            quality_sample_pages: 5,

            page_concurrency: 10,
            extract_iterations: 3,
            entity_concurrency: 5,
            merge_batch_size: 10,
            stage_concurrency: 4,
        }
    }
}

impl PipelineConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from defaults overridden by environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `FORGE_ARTIFACT_ROOT`: Artifact directory (default: ./artifacts)
    /// - `FORGE_DATABASE_URL`: Version store URL (default: sqlite://onto-forge.db)
    /// - `FORGE_MODEL`: Transform model
    /// - `FORGE_TEMPERATURE`: Sampling temperature (default: 0.2)
    /// - `FORGE_MAX_TOKENS`: Max tokens per response (default: 8000)
    /// - `FORGE_TRANSFORM_TIMEOUT_SECS`: Per-call timeout (default: 120)
    /// - `FORGE_QUALITY_THRESHOLD`: Quality gate threshold (default: 75)
    /// - `FORGE_QUALITY_SAMPLE_PAGES`: Pages sampled by the gate (default: 5)
    /// - `FORGE_PAGE_CONCURRENCY`: Page fan-out limit (default: 10)
    /// - `FORGE_EXTRACT_ITERATIONS`: Extraction passes (default: 3)
    /// - `FORGE_ENTITY_CONCURRENCY`: Entity-detail fan-out limit (default: 5)
    /// - `FORGE_MERGE_BATCH_SIZE`: Merge batch size (default: 10)
    /// - `FORGE_STAGE_CONCURRENCY`: Stage job fan-out limit (default: 4)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value or the result
    /// does not validate.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self::default().merge_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a YAML configuration file. Missing keys keep their defaults.
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self =
            serde_yaml::from_str(&content).map_err(|e| ConfigError::InvalidFile {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Resolves the effective configuration: the optional file, then
    /// environment overrides, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let base = match path {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };
        let config = base.merge_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `FORGE_*` environment overrides on top of `self`.
    pub fn merge_env(mut self) -> Result<Self, ConfigError> {
        if let Ok(val) = std::env::var("FORGE_ARTIFACT_ROOT") {
            self.artifact_root = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("FORGE_DATABASE_URL") {
            self.database_url = val;
        }

        if let Ok(val) = std::env::var("FORGE_MODEL") {
            self.model = val;
        }
        if let Ok(val) = std::env::var("FORGE_TEMPERATURE") {
            self.temperature = parse_env_value(&val, "FORGE_TEMPERATURE")?;
        }
        if let Ok(val) = std::env::var("FORGE_MAX_TOKENS") {
            self.max_tokens = parse_env_value(&val, "FORGE_MAX_TOKENS")?;
        }
        if let Ok(val) = std::env::var("FORGE_TRANSFORM_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "FORGE_TRANSFORM_TIMEOUT_SECS")?;
            self.transform_timeout = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("FORGE_QUALITY_THRESHOLD") {
            self.quality_threshold = parse_env_value(&val, "FORGE_QUALITY_THRESHOLD")?;
        }
        if let Ok(val) = std::env::var("FORGE_QUALITY_SAMPLE_PAGES") {
            self.quality_sample_pages = parse_env_value(&val, "FORGE_QUALITY_SAMPLE_PAGES")?;
        }

        if let Ok(val) = std::env::var("FORGE_PAGE_CONCURRENCY") {
            self.page_concurrency = parse_env_value(&val, "FORGE_PAGE_CONCURRENCY")?;
        }
        if let Ok(val) = std::env::var("FORGE_EXTRACT_ITERATIONS") {
            self.extract_iterations = parse_env_value(&val, "FORGE_EXTRACT_ITERATIONS")?;
        }
        if let Ok(val) = std::env::var("FORGE_ENTITY_CONCURRENCY") {
            self.entity_concurrency = parse_env_value(&val, "FORGE_ENTITY_CONCURRENCY")?;
        }
        if let Ok(val) = std::env::var("FORGE_MERGE_BATCH_SIZE") {
            self.merge_batch_size = parse_env_value(&val, "FORGE_MERGE_BATCH_SIZE")?;
        }
        if let Ok(val) = std::env::var("FORGE_STAGE_CONCURRENCY") {
            self.stage_concurrency = parse_env_value(&val, "FORGE_STAGE_CONCURRENCY")?;
        }

        Ok(self)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` naming the first invalid field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "database_url cannot be empty".to_string(),
            ));
        }

        if self.model.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "model cannot be empty".to_string(),
            ));
        }

        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::ValidationFailed(
                "temperature must be between 0.0 and 2.0".to_string(),
            ));
        }

        if self.max_tokens == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_tokens must be greater than 0".to_string(),
            ));
        }

        if self.transform_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "transform_timeout must be greater than 0".to_string(),
            ));
        }

        if !(0.0..=100.0).contains(&self.quality_threshold) {
            return Err(ConfigError::ValidationFailed(
                "quality_threshold must be between 0 and 100".to_string(),
            ));
        }

        if self.quality_sample_pages == 0 {
            return Err(ConfigError::ValidationFailed(
                "quality_sample_pages must be greater than 0".to_string(),
            ));
        }

        if !(1..=MAX_PAGE_CONCURRENCY).contains(&self.page_concurrency) {
            return Err(ConfigError::ValidationFailed(format!(
                "page_concurrency must be between 1 and {}",
                MAX_PAGE_CONCURRENCY
            )));
        }

        if self.extract_iterations == 0 {
            return Err(ConfigError::ValidationFailed(
                "extract_iterations must be greater than 0".to_string(),
            ));
        }

        if self.entity_concurrency == 0 {
            return Err(ConfigError::ValidationFailed(
                "entity_concurrency must be greater than 0".to_string(),
            ));
        }

        if self.merge_batch_size < 2 {
            return Err(ConfigError::ValidationFailed(
                "merge_batch_size must be at least 2".to_string(),
            ));
        }

        if self.stage_concurrency == 0 {
            return Err(ConfigError::ValidationFailed(
                "stage_concurrency must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Builder method to set the artifact root.
    pub fn with_artifact_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.artifact_root = path.into();
        self
    }

    /// Builder method to set the database URL.
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_transform_timeout(mut self, timeout: Duration) -> Self {
        self.transform_timeout = timeout;
        self
    }

    pub fn with_quality_threshold(mut self, threshold: f64) -> Self {
        self.quality_threshold = threshold;
        self
    }

    pub fn with_quality_sample_pages(mut self, pages: usize) -> Self {
        self.quality_sample_pages = pages;
        self
    }

    pub fn with_page_concurrency(mut self, limit: usize) -> Self {
        self.page_concurrency = limit;
        self
    }

    pub fn with_extract_iterations(mut self, iterations: u32) -> Self {
        self.extract_iterations = iterations;
        self
    }

    pub fn with_entity_concurrency(mut self, limit: usize) -> Self {
        self.entity_concurrency = limit;
        self
    }

    pub fn with_merge_batch_size(mut self, size: usize) -> Self {
        self.merge_batch_size = size;
        self
    }

    pub fn with_stage_concurrency(mut self, limit: usize) -> Self {
        self.stage_concurrency = limit;
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Serializes a `Duration` as whole seconds.
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.quality_threshold, 75.0);
        assert_eq!(config.quality_sample_pages, 5);
        assert_eq!(config.page_concurrency, 10);
        assert_eq!(config.extract_iterations, 3);
        assert_eq!(config.entity_concurrency, 5);
        assert_eq!(config.merge_batch_size, 10);
        assert_eq!(config.transform_timeout, Duration::from_secs(120));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = PipelineConfig::new()
            .with_artifact_root("/tmp/forge")
            .with_database_url("sqlite::memory:")
            .with_model("test-model")
            .with_quality_threshold(60.0)
            .with_page_concurrency(20)
            .with_extract_iterations(1)
            .with_stage_concurrency(2);

        assert_eq!(config.artifact_root, PathBuf::from("/tmp/forge"));
        assert_eq!(config.database_url, "sqlite::memory:");
        assert_eq!(config.model, "test-model");
        assert_eq!(config.page_concurrency, 20);
        assert_eq!(config.extract_iterations, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_page_concurrency_bounds() {
        for limit in [0, MAX_PAGE_CONCURRENCY + 1] {
            let result = PipelineConfig::default()
                .with_page_concurrency(limit)
                .validate();
            assert!(result.unwrap_err().to_string().contains("page_concurrency"));
        }
    }

    #[test]
    fn test_validation_quality_threshold() {
        let result = PipelineConfig::default()
            .with_quality_threshold(101.0)
            .validate();
        assert!(result.unwrap_err().to_string().contains("quality_threshold"));
    }

    #[test]
    fn test_validation_zero_timeout() {
        let result = PipelineConfig::default()
            .with_transform_timeout(Duration::ZERO)
            .validate();
        assert!(result.unwrap_err().to_string().contains("transform_timeout"));
    }

    #[test]
    fn test_validation_merge_batch_size() {
        let result = PipelineConfig::default()
            .with_merge_batch_size(1)
            .validate();
        assert!(result.unwrap_err().to_string().contains("merge_batch_size"));
    }

    #[test]
    fn test_from_yaml_file_keeps_defaults_for_missing_keys() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "quality_threshold: 80\ntransform_timeout: 30\nartifact_root: /srv/forge"
        )
        .unwrap();

        let config = PipelineConfig::from_yaml_file(file.path()).unwrap();
        assert_eq!(config.quality_threshold, 80.0);
        assert_eq!(config.transform_timeout, Duration::from_secs(30));
        assert_eq!(config.artifact_root, PathBuf::from("/srv/forge"));
        assert_eq!(config.page_concurrency, 10);
    }

    #[test]
    fn test_from_yaml_file_rejects_invalid_values() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "page_concurrency: 50").unwrap();
        let result = PipelineConfig::from_yaml_file(file.path());
        assert!(matches!(result, Err(ConfigError::ValidationFailed(_))));
    }

    #[test]
    fn test_parse_env_value() {
        let value: usize = parse_env_value(" 12 ", "FORGE_PAGE_CONCURRENCY").unwrap();
        assert_eq!(value, 12);
        let err = parse_env_value::<usize>("many", "FORGE_PAGE_CONCURRENCY").unwrap_err();
        assert!(err.to_string().contains("FORGE_PAGE_CONCURRENCY"));
    }
}
