use crate::error::{Error, Result};
use config::{Config as ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Point in the native event history a subscription starts from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumePoint {
    /// Only events generated after the subscription is created
    #[default]
    Now,
    /// Events with an id greater than the saved one
    After(u64),
}

impl ResumePoint {
    /// The saved event id, if resuming from one
    pub fn event_id(&self) -> Option<u64> {
        match self {
            Self::Now => None,
            Self::After(id) => Some(*id),
        }
    }
}

/// Configuration handed to the native facility when subscribing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Report changes to the watched roots themselves (default: true)
    #[serde(default = "default_true")]
    pub watch_root: bool,

    /// Report individual files instead of their parent directories (default: true)
    #[serde(default = "default_true")]
    pub file_level_events: bool,

    /// Where in the event history to start (default: now)
    #[serde(default)]
    pub resume_from: ResumePoint,

    /// Coalescing latency requested from the facility in milliseconds (default: 0)
    #[serde(default)]
    pub latency_ms: u64,
}

impl StreamConfig {
    /// Create configuration from builder
    pub fn builder() -> StreamConfigBuilder {
        StreamConfigBuilder::default()
    }

    /// Get the latency as a duration
    pub fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms)
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            watch_root: true,
            file_level_events: true,
            resume_from: ResumePoint::Now,
            latency_ms: 0,
        }
    }
}

/// Builder for StreamConfig
#[derive(Debug, Default)]
pub struct StreamConfigBuilder {
    config: StreamConfig,
}

impl StreamConfigBuilder {
    /// Set whether root changes are reported
    pub fn watch_root(mut self, enabled: bool) -> Self {
        self.config.watch_root = enabled;
        self
    }

    /// Set file-level (true) or directory-level (false) granularity
    pub fn file_level_events(mut self, enabled: bool) -> Self {
        self.config.file_level_events = enabled;
        self
    }

    /// Set the history resume point
    pub fn resume_from(mut self, point: ResumePoint) -> Self {
        self.config.resume_from = point;
        self
    }

    /// Set latency in milliseconds
    pub fn latency_ms(mut self, ms: u64) -> Self {
        self.config.latency_ms = ms;
        self
    }

    /// Build the configuration
    pub fn build(self) -> StreamConfig {
        self.config
    }
}

/// Observer-wide configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObserverConfig {
    /// Subscription settings
    #[serde(default)]
    pub stream: StreamConfig,

    /// Buffered pull-sequence events before a growth warning (default: 10000)
    #[serde(default = "default_high_water_mark")]
    pub sequence_high_water_mark: usize,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            stream: StreamConfig::default(),
            sequence_high_water_mark: default_high_water_mark(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_high_water_mark() -> usize {
    10_000
}

impl ObserverConfig {
    /// Create configuration from builder
    pub fn builder() -> ObserverConfigBuilder {
        ObserverConfigBuilder::default()
    }

    /// Loads configuration from a TOML file with environment variable overrides
    ///
    /// Environment variables are prefixed with `FSOBSERVER_` and use double underscores
    /// for nested values. For example:
    /// - `FSOBSERVER_STREAM__FILE_LEVEL_EVENTS=false`
    pub fn from_file(path: &Path) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if path.exists() {
            debug!(path = %path.display(), "Loading observer config file");
            builder = builder.add_source(File::from(path));
        } else {
            debug!(
                path = %path.display(),
                "Observer config file not found; using defaults and environment"
            );
        }

        builder = builder.add_source(
            Environment::with_prefix("FSOBSERVER")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: Self = builder
            .build()
            .map_err(|e| Error::config(format!("Failed to build config: {e}")))?
            .try_deserialize()
            .map_err(|e| Error::config(format!("Failed to deserialize config: {e}")))?;

        config.validate()?;
        info!(
            watch_root = config.stream.watch_root,
            file_level_events = config.stream.file_level_events,
            latency_ms = config.stream.latency_ms,
            sequence_high_water_mark = config.sequence_high_water_mark,
            "Observer config loaded"
        );
        Ok(config)
    }

    /// Creates a config from a TOML string (useful for testing)
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| Error::config(format!("Failed to parse TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<()> {
        if self.sequence_high_water_mark == 0 {
            return Err(Error::config(
                "Invalid sequence_high_water_mark: must be greater than 0",
            ));
        }
        if self.stream.latency_ms > 60_000 {
            return Err(Error::config(format!(
                "Invalid latency {}ms. Must be at most 60000",
                self.stream.latency_ms
            )));
        }
        Ok(())
    }
}

/// Builder for ObserverConfig
#[derive(Debug, Default)]
pub struct ObserverConfigBuilder {
    config: ObserverConfig,
}

impl ObserverConfigBuilder {
    /// Set the subscription settings
    pub fn stream(mut self, stream: StreamConfig) -> Self {
        self.config.stream = stream;
        self
    }

    /// Set the pull-sequence high-water mark
    pub fn sequence_high_water_mark(mut self, mark: usize) -> Self {
        self.config.sequence_high_water_mark = mark;
        self
    }

    /// Build the configuration
    pub fn build(self) -> ObserverConfig {
        self.config
    }
}
