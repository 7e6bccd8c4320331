//! Recorder configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (`config/recorder.toml` by default)
//! 2. environment variables prefixed with `DAQ_RECORDER_`, using `__` between
//!    nesting levels
//!
//! # Example
//! ```no_run
//! use daq_recorder::config::RecorderConfig;
//!
//! let config = RecorderConfig::load()?;
//! config.validate()?;
//! println!("Application: {}", config.application.name);
//! # Ok::<(), daq_recorder::error::DaqError>(())
//! ```
//!
//! Override a single key from the environment:
//! `DAQ_RECORDER_ACQUISITION__SAVE_UNIT=120`

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::data::writer::{validate_delimiter, OverflowPolicy, QueueConfig, DEFAULT_QUEUE_CAPACITY};
use crate::data::storage::DEFAULT_EXTENSION;
use crate::error::{AppResult, DaqError};

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "config/recorder.toml";

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "DAQ_RECORDER_";

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Top-level recorder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecorderConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Polling and rotation settings
    pub acquisition: AcquisitionConfig,
    /// Per-channel write queue settings
    #[serde(default)]
    pub queue: QueueSettings,
    /// File format settings
    #[serde(default)]
    pub output: OutputConfig,
    /// Sources to record
    #[serde(default)]
    pub sources: Vec<SourceDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

/// Polling and rotation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Blocks per file before rotating
    pub save_unit: u64,
    /// Root directory; each source gets `<output_root>/<source>/<session>/`
    #[serde(default = "default_output_root")]
    pub output_root: PathBuf,
    /// Sleep after a cycle that found nothing new, in microseconds (0 = yield only)
    #[serde(default)]
    pub idle_backoff_us: u64,
}

/// Write queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Maximum queued blocks per channel
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// What to do when the queue is full
    #[serde(default)]
    pub overflow: OverflowPolicy,
}

/// Output file format
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Field delimiter (one ASCII character)
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    /// File extension without the dot
    #[serde(default = "default_extension")]
    pub extension: String,
}

/// Kind of simulated source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Multi-channel analog input (f64)
    Analog,
    /// Mono S16 audio capture (i16)
    Audio,
}

/// Source definition in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceDefinition {
    /// Unique source name, also the output subdirectory
    pub name: String,
    /// Source kind
    pub kind: SourceKind,
    /// Channels per row
    #[serde(default = "default_channels")]
    pub channels: usize,
    /// Rows per block
    pub samples_per_block: usize,
    /// Time between blocks in milliseconds
    pub block_period_ms: u64,
    /// Per-source rotation threshold, overriding `acquisition.save_unit`
    #[serde(default)]
    pub save_unit: Option<u64>,
}

// Default value functions
fn default_output_root() -> PathBuf {
    PathBuf::from("output")
}

fn default_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

fn default_delimiter() -> char {
    ','
}

fn default_extension() -> String {
    DEFAULT_EXTENSION.to_string()
}

fn default_channels() -> usize {
    1
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            overflow: OverflowPolicy::default(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            delimiter: default_delimiter(),
            extension: default_extension(),
        }
    }
}

impl QueueSettings {
    /// Writer-side queue configuration.
    pub fn to_queue_config(&self) -> QueueConfig {
        QueueConfig {
            capacity: self.capacity,
            overflow: self.overflow,
        }
    }
}

impl OutputConfig {
    /// Delimiter as a byte; fails for non-ASCII characters.
    pub fn delimiter_byte(&self) -> AppResult<u8> {
        let byte = u8::try_from(self.delimiter)
            .ok()
            .filter(u8::is_ascii)
            .ok_or_else(|| {
                DaqError::Configuration(format!(
                    "Delimiter {:?} must be a single ASCII character",
                    self.delimiter
                ))
            })?;
        validate_delimiter(byte)?;
        Ok(byte)
    }
}

impl AcquisitionConfig {
    /// Idle backoff as a duration.
    pub fn idle_backoff(&self) -> Duration {
        Duration::from_micros(self.idle_backoff_us)
    }
}

impl SourceDefinition {
    /// Block period as a duration.
    pub fn block_period(&self) -> Duration {
        Duration::from_millis(self.block_period_ms)
    }
}

impl RecorderConfig {
    /// Load configuration from the default path and environment variables
    ///
    /// Example override: `DAQ_RECORDER_APPLICATION__LOG_LEVEL=debug`
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Self::extract(Figment::new().merge(Toml::file(path.as_ref())))
    }

    /// Extract from an already assembled figment, applying environment overrides.
    pub fn extract(figment: Figment) -> AppResult<Self> {
        Ok(figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?)
    }

    /// Rotation threshold for `source`.
    pub fn save_unit_for(&self, source: &SourceDefinition) -> u64 {
        source.save_unit.unwrap_or(self.acquisition.save_unit)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        if !VALID_LOG_LEVELS.contains(&self.application.log_level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                VALID_LOG_LEVELS.join(", ")
            )));
        }

        if self.acquisition.save_unit == 0 {
            return Err(DaqError::Configuration(
                "acquisition.save_unit must be at least 1".into(),
            ));
        }

        if self.queue.capacity == 0 {
            return Err(DaqError::Configuration(
                "queue.capacity must be at least 1".into(),
            ));
        }

        self.output.delimiter_byte()?;

        if self.output.extension.is_empty() {
            return Err(DaqError::Configuration(
                "output.extension must not be empty".into(),
            ));
        }

        if self.sources.is_empty() {
            return Err(DaqError::Configuration("No sources configured".into()));
        }

        let mut names = HashSet::new();
        for source in &self.sources {
            if !names.insert(source.name.as_str()) {
                return Err(DaqError::Configuration(format!(
                    "Duplicate source name: {}",
                    source.name
                )));
            }
            if source.channels == 0 {
                return Err(DaqError::Configuration(format!(
                    "Source '{}' must have at least one channel",
                    source.name
                )));
            }
            if source.kind == SourceKind::Audio && source.channels != 1 {
                return Err(DaqError::Configuration(format!(
                    "Audio source '{}' is mono; got {} channels",
                    source.name, source.channels
                )));
            }
            if source.samples_per_block == 0 {
                return Err(DaqError::Configuration(format!(
                    "Source '{}' must produce at least one sample per block",
                    source.name
                )));
            }
            if source.save_unit == Some(0) {
                return Err(DaqError::Configuration(format!(
                    "Source '{}' save_unit must be at least 1",
                    source.name
                )));
            }
        }

        Ok(())
    }
}
