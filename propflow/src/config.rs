//! Configuration loading for the pipeline.
//!
//! Stored as TOML. Every field has a default, so an empty document is a
//! valid configuration:
//!
//! ```toml
//! graph_property_queue = "graphProperty"
//! consumer_count = 4
//! priority_policy = "weighted"
//! weighted_burst = 8
//! authorizations = ["ws1"]
//! ```

use crate::queue::{PriorityPolicy, DEFAULT_MAX_ATTEMPTS};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    ValidationError(String),
}

/// Priority policy as written in the config file.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PriorityPolicyKind {
    #[default]
    Strict,
    Weighted,
}

/// Pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Queue carrying property-change messages.
    #[serde(default = "default_graph_property_queue")]
    pub graph_property_queue: String,

    /// Queue carrying long-running-process items.
    #[serde(default = "default_long_running_process_queue")]
    pub long_running_process_queue: String,

    /// Parallel consumers pulling from the graph property queue.
    #[serde(default = "default_consumer_count")]
    pub consumer_count: usize,

    /// Sleep between polls of an empty queue.
    #[serde(default = "default_poll_backoff_ms")]
    pub poll_backoff_ms: u64,

    /// Minimum progress advance before a progress report is broadcast.
    #[serde(default = "default_progress_flush_threshold")]
    pub progress_flush_threshold: f64,

    /// Deliveries before a failing message is dead-lettered.
    #[serde(default = "default_max_delivery_attempts")]
    pub max_delivery_attempts: u32,

    #[serde(default)]
    pub priority_policy: PriorityPolicyKind,

    /// Higher-band deliveries in a row before a lower band gets a turn.
    #[serde(default = "default_weighted_burst")]
    pub weighted_burst: u32,

    /// Directory for local copies of property values. OS temp dir if unset.
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,

    /// Stop a consumer on queue transport errors instead of retrying.
    #[serde(default = "default_exit_on_queue_failure")]
    pub exit_on_queue_failure: bool,

    /// Identity the runners act as.
    #[serde(default = "default_user_id")]
    pub user_id: String,

    /// Labels the runners read the graph with.
    #[serde(default)]
    pub authorizations: Vec<String>,
}

fn default_graph_property_queue() -> String {
    "graphProperty".to_string()
}

fn default_long_running_process_queue() -> String {
    "longRunningProcess".to_string()
}

fn default_consumer_count() -> usize {
    1
}

fn default_poll_backoff_ms() -> u64 {
    100
}

fn default_progress_flush_threshold() -> f64 {
    0.01
}

fn default_max_delivery_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_weighted_burst() -> u32 {
    8
}

fn default_exit_on_queue_failure() -> bool {
    true
}

fn default_user_id() -> String {
    "system".to_string()
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            graph_property_queue: default_graph_property_queue(),
            long_running_process_queue: default_long_running_process_queue(),
            consumer_count: default_consumer_count(),
            poll_backoff_ms: default_poll_backoff_ms(),
            progress_flush_threshold: default_progress_flush_threshold(),
            max_delivery_attempts: default_max_delivery_attempts(),
            priority_policy: PriorityPolicyKind::default(),
            weighted_burst: default_weighted_burst(),
            temp_dir: None,
            exit_on_queue_failure: default_exit_on_queue_failure(),
            user_id: default_user_id(),
            authorizations: Vec::new(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Load configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.graph_property_queue.is_empty() || self.long_running_process_queue.is_empty() {
            return Err(ConfigError::ValidationError(
                "queue names must not be empty".to_string(),
            ));
        }
        if self.graph_property_queue == self.long_running_process_queue {
            return Err(ConfigError::ValidationError(format!(
                "graph property and long-running-process queues are both '{}'",
                self.graph_property_queue
            )));
        }
        if self.consumer_count == 0 {
            return Err(ConfigError::ValidationError(
                "consumer_count must be at least 1".to_string(),
            ));
        }
        if !(self.progress_flush_threshold > 0.0 && self.progress_flush_threshold <= 1.0) {
            return Err(ConfigError::ValidationError(format!(
                "progress_flush_threshold must be in (0, 1], got {}",
                self.progress_flush_threshold
            )));
        }
        if self.max_delivery_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "max_delivery_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn poll_backoff(&self) -> Duration {
        Duration::from_millis(self.poll_backoff_ms)
    }

    pub fn priority_policy(&self) -> PriorityPolicy {
        match self.priority_policy {
            PriorityPolicyKind::Strict => PriorityPolicy::Strict,
            PriorityPolicyKind::Weighted => PriorityPolicy::Weighted {
                burst: self.weighted_burst,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = PipelineConfig::parse("").unwrap();
        assert_eq!(config.graph_property_queue, "graphProperty");
        assert_eq!(config.long_running_process_queue, "longRunningProcess");
        assert_eq!(config.consumer_count, 1);
        assert_eq!(config.poll_backoff(), Duration::from_millis(100));
        assert_eq!(config.priority_policy(), PriorityPolicy::Strict);
        assert!(config.exit_on_queue_failure);
    }

    #[test]
    fn test_parse_overrides() {
        let config = PipelineConfig::parse(
            r#"
            consumer_count = 4
            priority_policy = "weighted"
            weighted_burst = 3
            authorizations = ["ws1", "secret"]
            temp_dir = "/var/tmp/propflow"
            "#,
        )
        .unwrap();

        assert_eq!(config.consumer_count, 4);
        assert_eq!(config.priority_policy(), PriorityPolicy::Weighted { burst: 3 });
        assert_eq!(config.authorizations, vec!["ws1", "secret"]);
        assert_eq!(config.temp_dir, Some(PathBuf::from("/var/tmp/propflow")));
    }

    #[test]
    fn test_validation_errors() {
        assert!(matches!(
            PipelineConfig::parse("consumer_count = 0"),
            Err(ConfigError::ValidationError(_))
        ));
        assert!(matches!(
            PipelineConfig::parse("progress_flush_threshold = 1.5"),
            Err(ConfigError::ValidationError(_))
        ));
        assert!(matches!(
            PipelineConfig::parse(r#"long_running_process_queue = "graphProperty""#),
            Err(ConfigError::ValidationError(_))
        ));
        assert!(matches!(
            PipelineConfig::parse("consumer_count = \"many\""),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("propflow.toml");
        std::fs::write(&path, "poll_backoff_ms = 250\n").unwrap();
        assert_eq!(
            PipelineConfig::load(&path).unwrap().poll_backoff(),
            Duration::from_millis(250)
        );
        assert!(matches!(
            PipelineConfig::load(dir.path().join("missing.toml")),
            Err(ConfigError::ReadError(_))
        ));
    }
}
