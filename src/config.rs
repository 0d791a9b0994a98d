//! Configuration management for the model cache

use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Log verbosity, from quietest to noisiest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Silent,
    Error,
    Warn,
    Info,
    Debug,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

/// Configuration for the model cache
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Root directory holding one sub-directory per cache namespace
    #[serde(default = "default_store_dir")]
    pub store_dir: PathBuf,

    /// Name of the persistent store (default: "model-cache-models")
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Cache key version; bump to invalidate every existing entry
    #[serde(default = "default_key_version")]
    pub key_version: String,

    /// Size of each persisted chunk in bytes (default: 8MB)
    /// Valid range: 4KB to 256MB
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Capacity of the bounded event channel between worker and consumer (default: 4)
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// TCP connect timeout in milliseconds (default: 10s)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Maximum silence between two body reads in milliseconds (default: 60s)
    #[serde(default = "default_read_idle_timeout_ms")]
    pub read_idle_timeout_ms: u64,

    /// Overall request timeout in milliseconds; unset means no limit
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,

    /// Attempts made by cache clearing while the store is held open elsewhere (default: 5)
    #[serde(default = "default_clear_max_retries")]
    pub clear_max_retries: u32,

    /// Delay between cache clearing attempts in milliseconds (default: 500)
    #[serde(default = "default_clear_retry_delay_ms")]
    pub clear_retry_delay_ms: u64,

    /// Progress notification throttling
    #[serde(default)]
    pub throttle: ThrottleConfig,

    /// Log verbosity used by the binary (default: info)
    #[serde(default)]
    pub log_level: LogLevel,
}

/// Thresholds deciding which progress updates reach the caller
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThrottleConfig {
    /// Minimum percent advance while downloading (default: 2)
    #[serde(default = "default_network_percent_step")]
    pub network_percent_step: u8,

    /// Minimum percent advance while replaying from cache (default: 10)
    #[serde(default = "default_cache_percent_step")]
    pub cache_percent_step: u8,

    /// Surface an update at least this often in milliseconds (default: 900)
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,

    /// Byte step used when the total size is unknown (default: 64MB)
    #[serde(default = "default_unknown_total_step_bytes")]
    pub unknown_total_step_bytes: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            network_percent_step: default_network_percent_step(),
            cache_percent_step: default_cache_percent_step(),
            min_interval_ms: default_min_interval_ms(),
            unknown_total_step_bytes: default_unknown_total_step_bytes(),
        }
    }
}

// Default value functions for serde
fn default_store_dir() -> PathBuf {
    PathBuf::from("./model-cache")
}

fn default_namespace() -> String {
    "model-cache-models".to_string()
}

fn default_key_version() -> String {
    "v1".to_string()
}

fn default_chunk_size() -> usize {
    8 * 1024 * 1024 // 8MB
}

fn default_channel_capacity() -> usize {
    4
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_read_idle_timeout_ms() -> u64 {
    60_000
}

fn default_clear_max_retries() -> u32 {
    5
}

fn default_clear_retry_delay_ms() -> u64 {
    500
}

fn default_network_percent_step() -> u8 {
    2
}

fn default_cache_percent_step() -> u8 {
    10
}

fn default_min_interval_ms() -> u64 {
    900
}

fn default_unknown_total_step_bytes() -> u64 {
    64 * 1024 * 1024 // 64MB
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            store_dir: default_store_dir(),
            namespace: default_namespace(),
            key_version: default_key_version(),
            chunk_size: default_chunk_size(),
            channel_capacity: default_channel_capacity(),
            connect_timeout_ms: default_connect_timeout_ms(),
            read_idle_timeout_ms: default_read_idle_timeout_ms(),
            request_timeout_ms: None,
            clear_max_retries: default_clear_max_retries(),
            clear_retry_delay_ms: default_clear_retry_delay_ms(),
            throttle: ThrottleConfig::default(),
            log_level: LogLevel::default(),
        }
    }
}

impl CacheConfig {
    pub const MIN_CHUNK_SIZE: usize = 4 * 1024; // 4KB
    pub const MAX_CHUNK_SIZE: usize = 256 * 1024 * 1024; // 256MB

    /// Load configuration from a YAML file
    ///
    /// # Returns
    /// * `Ok(CacheConfig)` if loading and validation succeed
    /// * `Err(CacheError)` if the file cannot be read or the config is invalid
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            CacheError::Config(format!("Failed to read config file: {}", e))
        })?;

        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from a YAML document
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: CacheConfig = serde_yaml::from_str(content).map_err(|e| {
            CacheError::Config(format!("Failed to parse config file: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    ///
    /// # Validation Rules
    /// - namespace and key_version must be non-empty and free of path separators
    /// - chunk_size must be between 4KB and 256MB
    /// - channel_capacity must be > 0
    /// - read_idle_timeout_ms and connect_timeout_ms must be > 0
    /// - throttle percent steps must be between 1 and 100
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() || self.namespace.contains(['/', '\\']) {
            return Err(CacheError::Config(format!(
                "namespace must be a non-empty directory name, got '{}'",
                self.namespace
            )));
        }

        if self.key_version.is_empty() {
            return Err(CacheError::Config(
                "key_version must not be empty".to_string(),
            ));
        }

        if self.chunk_size < Self::MIN_CHUNK_SIZE || self.chunk_size > Self::MAX_CHUNK_SIZE {
            return Err(CacheError::Config(format!(
                "chunk_size must be between {}KB and {}MB, got {} bytes",
                Self::MIN_CHUNK_SIZE / 1024,
                Self::MAX_CHUNK_SIZE / (1024 * 1024),
                self.chunk_size
            )));
        }

        if self.channel_capacity == 0 {
            return Err(CacheError::Config(
                "channel_capacity must be greater than 0".to_string(),
            ));
        }

        if self.connect_timeout_ms == 0 || self.read_idle_timeout_ms == 0 {
            return Err(CacheError::Config(
                "connect_timeout_ms and read_idle_timeout_ms must be greater than 0".to_string(),
            ));
        }

        for (name, step) in [
            ("network_percent_step", self.throttle.network_percent_step),
            ("cache_percent_step", self.throttle.cache_percent_step),
        ] {
            if step == 0 || step > 100 {
                return Err(CacheError::Config(format!(
                    "throttle.{} must be between 1 and 100, got {}",
                    name, step
                )));
            }
        }

        Ok(())
    }

    /// Directory of the configured namespace
    pub fn namespace_dir(&self) -> PathBuf {
        self.store_dir.join(&self.namespace)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.read_idle_timeout_ms)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    pub fn clear_retry_delay(&self) -> Duration {
        Duration::from_millis(self.clear_retry_delay_ms)
    }
}
