//! Typed configuration shared by every component.
//!
//! A [`Config`] is built once (from defaults, a deserialized document or the
//! environment) and passed to [`Coordinator::new`](crate::Coordinator::new).
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Prefix of every environment variable read by [`Config::from_env`].
pub const ENV_PREFIX: &str = "SHEET_SLICE_";

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Invalid value '{value}' for environment variable '{name}'")]
    InvalidEnvValue { name: String, value: String },

    #[error("Invalid configuration '{name}': {message}")]
    InvalidValue { name: &'static str, message: String },
}

/// Runtime configuration.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Memory ceiling the governor measures process usage against.
    pub max_memory_ceiling_bytes: u64,
    /// Rows per read chunk while the governor is `Normal`.
    pub base_chunk_rows: usize,
    /// Concurrent section reads while the governor is `Normal`.
    pub base_concurrency: usize,
    /// Section cache budget while the governor is not `Critical`.
    pub cache_byte_budget: u64,
    /// Sampling period of the governor; `0` disables the background sampler.
    pub sampling_interval_ms: u64,
    pub prefetch_enabled: bool,
    /// Number of resource samples kept in the sliding window.
    pub sample_window: usize,
    /// Network throughput above which prefetch is paused.
    pub max_network_bytes_per_sec: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_memory_ceiling_bytes: 2 * 1024 * 1024 * 1024,
            base_chunk_rows: 2048,
            base_concurrency: 4,
            cache_byte_budget: 256 * 1024 * 1024,
            sampling_interval_ms: 500,
            prefetch_enabled: true,
            sample_window: 8,
            max_network_bytes_per_sec: None,
        }
    }
}

impl Config {
    /// Defaults overlaid with `SHEET_SLICE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overlaid with values produced by `lookup`, keyed by full variable name.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();
        let read = |key: &str| {
            let name = format!("{ENV_PREFIX}{key}");
            lookup(&name).map(|value| (name, value.trim().to_owned()))
        };

        if let Some((name, value)) = read("MAX_MEMORY_CEILING_BYTES") {
            config.max_memory_ceiling_bytes = parse_env(&name, &value)?;
        }
        if let Some((name, value)) = read("BASE_CHUNK_ROWS") {
            config.base_chunk_rows = parse_env(&name, &value)?;
        }
        if let Some((name, value)) = read("BASE_CONCURRENCY") {
            config.base_concurrency = parse_env(&name, &value)?;
        }
        if let Some((name, value)) = read("CACHE_BYTE_BUDGET") {
            config.cache_byte_budget = parse_env(&name, &value)?;
        }
        if let Some((name, value)) = read("SAMPLING_INTERVAL_MS") {
            config.sampling_interval_ms = parse_env(&name, &value)?;
        }
        if let Some((name, value)) = read("PREFETCH_ENABLED") {
            config.prefetch_enabled = match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => return Err(ConfigError::InvalidEnvValue { name, value }),
            };
        }
        if let Some((name, value)) = read("SAMPLE_WINDOW") {
            config.sample_window = parse_env(&name, &value)?;
        }
        if let Some((name, value)) = read("MAX_NETWORK_BYTES_PER_SEC") {
            config.max_network_bytes_per_sec = if value.is_empty() {
                None
            } else {
                Some(parse_env(&name, &value)?)
            };
        }
        config.validate()
    }

    /// Rejects values the governor cannot work with.
    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.max_memory_ceiling_bytes == 0 {
            Err(invalid("max_memory_ceiling_bytes", "must be positive"))?;
        }
        if self.base_chunk_rows == 0 {
            Err(invalid("base_chunk_rows", "must be positive"))?;
        }
        if self.base_concurrency == 0 {
            Err(invalid("base_concurrency", "must be positive"))?;
        }
        if self.sample_window < 3 {
            Err(invalid("sample_window", "must hold at least 3 samples"))?;
        }
        Ok(self)
    }

    pub fn sampling_interval(&self) -> Option<Duration> {
        Some(self.sampling_interval_ms)
            .filter(|millis| *millis > 0)
            .map(Duration::from_millis)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidEnvValue {
        name: name.to_owned(),
        value: value.to_owned(),
    })
}

fn invalid(name: &'static str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        name,
        message: message.to_owned(),
    }
}
