//! Configuration for the document pipeline

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::types::Stage;

/// Environment variable naming a TOML config file
pub const CONFIG_ENV: &str = "DOCFLOW_CONFIG";

/// Main pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PipelineConfig {
    /// Storage/transport backend
    pub backend: StorageBackend,
    /// Server configuration
    pub server: ServerConfig,
    /// Database location (sqlite backend)
    pub storage: StorageConfig,
    /// Stream broker tuning
    pub broker: BrokerConfig,
    /// Stage worker configuration
    pub processing: ProcessingConfig,
    /// Topic and group names
    pub topics: TopicConfig,
    /// Stand-in recognizer settings
    pub recognition: RecognitionConfig,
}

impl PipelineConfig {
    /// Parse a TOML document; missing sections fall back to defaults
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)
            .map_err(|e| Error::Config(format!("Invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!(
                "Failed to read config {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Load from `DOCFLOW_CONFIG` if set, otherwise defaults
    pub fn load() -> Result<Self> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_file(PathBuf::from(path)),
            None => {
                let config = Self::default();
                config.validate()?;
                Ok(config)
            }
        }
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.processing.workers_per_stage == 0 {
            return Err(Error::Config("processing.workers_per_stage must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.recognition.confidence) {
            return Err(Error::Config("recognition.confidence must be within [0, 1]".into()));
        }
        if self.broker.poll_interval_ms == 0 {
            return Err(Error::Config("broker.poll_interval_ms must be positive".into()));
        }
        Ok(())
    }
}

/// Backend selection
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Durable SQLite database shared by record store and broker
    #[default]
    Sqlite,
    /// Process-local, nothing survives a restart
    Memory,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host address
    pub host: String,
    /// Port number
    pub port: u16,
    /// Enable CORS
    pub enable_cors: bool,
    /// Maximum upload size in bytes (default: 25MB)
    pub max_upload_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            enable_cors: true,
            max_upload_size: 25 * 1024 * 1024,
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file
    pub database_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let database_path = std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join("data")
            .join("docflow.db");

        Self { database_path }
    }
}

/// Stream broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Fallback wake-up for blocked reads (cross-process appends, idle reclaim)
    pub poll_interval_ms: u64,
    /// An unacknowledged entry idle this long is redelivered to the group
    pub reclaim_idle_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            reclaim_idle_ms: 60_000,
        }
    }
}

impl BrokerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn reclaim_idle(&self) -> Duration {
        Duration::from_millis(self.reclaim_idle_ms)
    }
}

/// Stage worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Consumers started per stage, each with its own consumer name
    pub workers_per_stage: usize,
    /// Fixed delay before the loop resumes after an infrastructure error
    pub retry_delay_ms: u64,
    /// How long shutdown waits for in-flight handlers
    pub shutdown_grace_secs: u64,
    /// Route entries for unknown documents to the dead-letter topic instead of dropping them
    pub dead_letter_missing_records: bool,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            workers_per_stage: 1,
            retry_delay_ms: 5_000,
            shutdown_grace_secs: 30,
            dead_letter_missing_records: false,
        }
    }
}

impl ProcessingConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Topic and consumer group names
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicConfig {
    /// Stage 1 input, written by ingress
    pub ocr: String,
    /// Stage 2 input, written by recognition
    pub ocr_result: String,
    /// Stage 3 input, written by extraction/validation
    pub validation: String,
    pub ocr_dead_letter: String,
    pub validation_dead_letter: String,
    pub persistence_dead_letter: String,
    pub ocr_group: String,
    pub validation_group: String,
    pub persistence_group: String,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            ocr: "ocr_queue".to_string(),
            ocr_result: "ocr_result_queue".to_string(),
            validation: "validation_queue".to_string(),
            ocr_dead_letter: "ocr_dead_letter_queue".to_string(),
            validation_dead_letter: "validation_dead_letter_queue".to_string(),
            persistence_dead_letter: "persistence_dead_letter_queue".to_string(),
            ocr_group: "ocr_group".to_string(),
            validation_group: "validation_group".to_string(),
            persistence_group: "persistence_group".to_string(),
        }
    }
}

impl TopicConfig {
    /// Topic a stage consumes
    pub fn input(&self, stage: Stage) -> &str {
        match stage {
            Stage::Recognition => &self.ocr,
            Stage::Validation => &self.ocr_result,
            Stage::Persistence => &self.validation,
        }
    }

    /// Consumer group a stage reads with
    pub fn group(&self, stage: Stage) -> &str {
        match stage {
            Stage::Recognition => &self.ocr_group,
            Stage::Validation => &self.validation_group,
            Stage::Persistence => &self.persistence_group,
        }
    }

    /// Dead-letter topic for a stage
    pub fn dead_letter(&self, stage: Stage) -> &str {
        match stage {
            Stage::Recognition => &self.ocr_dead_letter,
            Stage::Validation => &self.validation_dead_letter,
            Stage::Persistence => &self.persistence_dead_letter,
        }
    }
}

/// Stand-in recognizer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognitionConfig {
    /// Simulated processing time
    pub delay_ms: u64,
    /// Text returned for every document (defaults to a sample invoice)
    pub text: Option<String>,
    pub confidence: f32,
    pub language: String,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            delay_ms: 2_000,
            text: None,
            confidence: 0.95,
            language: "en".to_string(),
        }
    }
}
