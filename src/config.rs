//! Configuration for the ingestion pipeline
//!
//! Loaded from a TOML file. Every section is optional; missing values fall
//! back to defaults that match the pipeline's historical behavior (no step
//! timeouts, dead letters recorded as `plugin_server_ingest_event`).

use crate::dead_letter::DEFAULT_ERROR_LOCATION;
use crate::pipeline::{StepId, StepTimeoutPolicy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct IngestionConfig {
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub dead_letter: DeadLetterSection,
}

/// Runner behavior
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineSection {
    /// Timeout applied to every step, in milliseconds
    pub step_timeout_ms: Option<u64>,
    /// Per-step timeouts keyed by step name, in milliseconds
    #[serde(default)]
    pub step_timeouts_ms: BTreeMap<String, u64>,
    /// Events processed concurrently by the CLI harness
    #[serde(default = "default_max_concurrent_events")]
    pub max_concurrent_events: usize,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            step_timeout_ms: None,
            step_timeouts_ms: BTreeMap::new(),
            max_concurrent_events: default_max_concurrent_events(),
        }
    }
}

fn default_max_concurrent_events() -> usize {
    64
}

/// Dead-letter destination
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeadLetterSection {
    /// JSON-lines file records are appended to
    #[serde(default = "default_dead_letter_path")]
    pub path: PathBuf,
    /// Value written to each record's `error_location`
    #[serde(default = "default_error_location")]
    pub error_location: String,
}

impl Default for DeadLetterSection {
    fn default() -> Self {
        Self {
            path: default_dead_letter_path(),
            error_location: default_error_location(),
        }
    }
}

fn default_dead_letter_path() -> PathBuf {
    PathBuf::from("dead_letter.jsonl")
}

fn default_error_location() -> String {
    DEFAULT_ERROR_LOCATION.to_string()
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl IngestionConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: IngestionConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints that serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pipeline.max_concurrent_events == 0 {
            return Err(ConfigError::InvalidConfig(
                "pipeline.max_concurrent_events must be greater than 0".to_string(),
            ));
        }
        if self.pipeline.step_timeout_ms == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "pipeline.step_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.dead_letter.error_location.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "dead_letter.error_location must not be empty".to_string(),
            ));
        }
        self.step_timeouts().map(|_| ())
    }

    /// Build the runner's timeout policy, rejecting unknown step names
    pub fn step_timeouts(&self) -> Result<StepTimeoutPolicy, ConfigError> {
        let mut policy = match self.pipeline.step_timeout_ms {
            Some(ms) => StepTimeoutPolicy::uniform(Duration::from_millis(ms)),
            None => StepTimeoutPolicy::disabled(),
        };

        for (name, ms) in &self.pipeline.step_timeouts_ms {
            let step: StepId = name.parse().map_err(|e| {
                ConfigError::InvalidConfig(format!("pipeline.step_timeouts_ms: {e}"))
            })?;
            if *ms == 0 {
                return Err(ConfigError::InvalidConfig(format!(
                    "pipeline.step_timeouts_ms.{name} must be greater than 0"
                )));
            }
            policy = policy.with_override(step, Duration::from_millis(*ms));
        }

        Ok(policy)
    }
}
