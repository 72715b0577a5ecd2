//! Configuration management for the streaming service.
//!
//! Every field carries a default, so an empty file (or no file at all) yields
//! a working configuration. `load_with_overrides` layers environment
//! variables prefixed with `STREAM` (separator `__`) on top of the optional
//! file named by `STREAM_CONFIG_PATH`, e.g.
//! `STREAM__THROTTLING__MAX_EVENTS_PER_SECOND=500`.

use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Result, StreamError};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct StreamingConfig {
    pub throttling: ThrottlingConfig,
    pub filtering: FilteringConfig,
    pub channels: ChannelsConfig,
    pub orchestrator: OrchestratorConfig,
    pub logging: LoggingConfig,
    pub generator: GeneratorConfig,
}

/// Four-tier thresholds for one throttling signal. A value strictly above a
/// tier's threshold triggers that tier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdTiers {
    pub light: f64,
    pub moderate: f64,
    pub heavy: f64,
    pub critical: f64,
}

impl ThresholdTiers {
    pub const fn new(light: f64, moderate: f64, heavy: f64, critical: f64) -> Self {
        Self { light, moderate, heavy, critical }
    }

    pub fn is_monotonic(&self) -> bool {
        self.light <= self.moderate && self.moderate <= self.heavy && self.heavy <= self.critical
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ThrottlingConfig {
    pub max_events_per_second: u32,
    /// Recompute the recommendation on every metrics update.
    pub adaptive_mode: bool,
    pub window_size_ms: u64,
    pub inactivity_timeout_ms: u64,
    pub cleanup_interval_ms: u64,
    /// Consecutive less-severe readings required before a downgrade. 0 disables hysteresis.
    pub hysteresis_readings: u32,
    /// Milliseconds.
    pub latency_thresholds: ThresholdTiers,
    /// Percent.
    pub error_rate_thresholds: ThresholdTiers,
    /// Queued messages.
    pub queue_depth_thresholds: ThresholdTiers,
}

impl Default for ThrottlingConfig {
    fn default() -> Self {
        Self {
            max_events_per_second: default_max_events_per_second(),
            adaptive_mode: true,
            window_size_ms: default_window_size_ms(),
            inactivity_timeout_ms: default_inactivity_timeout_ms(),
            cleanup_interval_ms: 60_000,
            hysteresis_readings: 0,
            latency_thresholds: ThresholdTiers::new(200.0, 500.0, 1000.0, 2000.0),
            error_rate_thresholds: ThresholdTiers::new(1.0, 5.0, 10.0, 25.0),
            queue_depth_thresholds: ThresholdTiers::new(100.0, 500.0, 1000.0, 5000.0),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct FilteringConfig {
    pub enabled: bool,
    /// Upper bound on rule evaluation time for a single event.
    pub max_evaluation_time_ms: u64,
    /// Compiled size limit for regex conditions, in bytes.
    pub regex_size_limit: usize,
    pub stats_log_interval_ms: u64,
    pub install_default_rules: bool,
    pub heuristics: HeuristicConfig,
}

impl Default for FilteringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_evaluation_time_ms: 50,
            regex_size_limit: 1 << 20,
            stats_log_interval_ms: 60_000,
            install_default_rules: true,
            heuristics: HeuristicConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct HeuristicConfig {
    pub enabled: bool,
    pub relevance_weight: f64,
    pub noise_penalty: f64,
    pub type_priority_weight: f64,
}

impl Default for HeuristicConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            relevance_weight: 0.2,
            noise_penalty: 0.1,
            type_priority_weight: 0.05,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ChannelsConfig {
    pub max_channels_per_client: usize,
    pub max_aggregation_window_ms: u64,
    /// A window buffer reaching this size is flushed early.
    pub max_events_per_window: usize,
    pub sweep_interval_ms: u64,
    /// A channel counts as active if it routed an event within this span.
    pub active_window_ms: u64,
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            max_channels_per_client: 16,
            max_aggregation_window_ms: 300_000,
            max_events_per_window: 10_000,
            sweep_interval_ms: 1_000,
            active_window_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct OrchestratorConfig {
    pub client_queue_capacity: usize,
    pub metrics_broadcast_interval_ms: u64,
    pub default_channel_type: String,
    pub enforce_rate_limit: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            client_queue_capacity: 1024,
            metrics_broadcast_interval_ms: 30_000,
            default_channel_type: "all".to_string(),
            enforce_rate_limit: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct LoggingConfig {
    pub level: String,
    /// "json" or "pretty"
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: "pretty".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct GeneratorConfig {
    pub enabled: bool,
    pub min_interval_ms: u64,
    pub max_interval_ms: u64,
    pub min_batch: usize,
    pub max_batch: usize,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_interval_ms: 2_000,
            max_interval_ms: 5_000,
            min_batch: 1,
            max_batch: 3,
        }
    }
}

fn default_max_events_per_second() -> u32 { 1000 }
fn default_window_size_ms() -> u64 { 30_000 }
fn default_inactivity_timeout_ms() -> u64 { 300_000 } // 5 minutes
fn default_log_level() -> String { "info".to_string() }

impl StreamingConfig {
    /// Load configuration using the config crate: optional file, then `STREAM__*` overrides.
    pub fn load_with_overrides() -> Result<Self> {
        Self::load_layered(std::env::var("STREAM_CONFIG_PATH").ok().as_deref())
    }

    /// Layer an optional config file under the `STREAM__*` environment.
    /// A missing file is logged and skipped.
    pub fn load_layered(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(config_path) = config_path {
            if Path::new(config_path).exists() {
                builder = builder.add_source(File::new(config_path, file_format(config_path)?));
            } else {
                tracing::warn!("Config file does not exist: {}", config_path);
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("STREAM")
                .separator("__")
                .try_parsing(true),
        );

        let config: StreamingConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a `.toml`, `.yaml` or `.yml` file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            StreamError::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let config: StreamingConfig = match file_format(&path.to_string_lossy())? {
            FileFormat::Yaml => serde_yaml::from_str(&content)
                .map_err(|e| StreamError::config(format!("Failed to parse YAML config: {}", e)))?,
            _ => toml::from_str(&content)
                .map_err(|e| StreamError::config(format!("Failed to parse TOML config: {}", e)))?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| StreamError::config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let throttling = &self.throttling;
        if throttling.max_events_per_second == 0 {
            return Err(StreamError::config("throttling.max_events_per_second must be greater than 0"));
        }
        if throttling.window_size_ms == 0 {
            return Err(StreamError::config("throttling.window_size_ms must be greater than 0"));
        }
        for (name, tiers) in [
            ("latency_thresholds", &throttling.latency_thresholds),
            ("error_rate_thresholds", &throttling.error_rate_thresholds),
            ("queue_depth_thresholds", &throttling.queue_depth_thresholds),
        ] {
            if !tiers.is_monotonic() {
                return Err(StreamError::config(format!(
                    "throttling.{} must be non-decreasing from light to critical",
                    name
                )));
            }
        }

        if self.filtering.max_evaluation_time_ms == 0 {
            return Err(StreamError::config("filtering.max_evaluation_time_ms must be greater than 0"));
        }

        if self.channels.max_channels_per_client == 0 {
            return Err(StreamError::config("channels.max_channels_per_client must be greater than 0"));
        }
        if self.channels.max_events_per_window == 0 {
            return Err(StreamError::config("channels.max_events_per_window must be greater than 0"));
        }

        if self.orchestrator.client_queue_capacity == 0 {
            return Err(StreamError::config("orchestrator.client_queue_capacity must be greater than 0"));
        }

        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            return Err(StreamError::config(format!(
                "logging.format must be 'json' or 'pretty', got '{}'",
                self.logging.format
            )));
        }

        let generator = &self.generator;
        if generator.min_interval_ms > generator.max_interval_ms || generator.min_batch > generator.max_batch {
            return Err(StreamError::config("generator ranges must satisfy min <= max"));
        }

        Ok(())
    }
}

fn file_format(path: &str) -> Result<FileFormat> {
    if path.ends_with(".yaml") || path.ends_with(".yml") {
        Ok(FileFormat::Yaml)
    } else if path.ends_with(".toml") {
        Ok(FileFormat::Toml)
    } else {
        Err(StreamError::config("Unsupported config file format. Use .toml or .yaml"))
    }
}
