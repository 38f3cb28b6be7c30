//! Configuration management for ThrottleX.
//!
//! Values come from an optional YAML file, overridden by environment
//! variables prefixed with `THROTTLEX_` using `__` between sections, e.g.
//! `THROTTLEX_RATE_LIMITING__FAILURE_MODE=closed`.

use std::net::SocketAddr;
use std::time::Duration;

use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::error::{Result, ThrottlexError};
use crate::ratelimit::{Algorithm, DefaultPolicy, FailureMode, MAX_LIMIT, MAX_WINDOW_SECONDS};

/// Main configuration for the ThrottleX service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottlexConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// State store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Rate limiting configuration. Required: the failure mode has no default.
    pub rate_limiting: RateLimitingConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_addr")]
    pub addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        self.addr
            .parse()
            .map_err(|e| ThrottlexError::Config(format!("invalid server.addr {:?}: {}", self.addr, e)))
    }
}

fn default_addr() -> String {
    "127.0.0.1:8080".to_string()
}

/// Which backing store to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local; only correct for a single instance
    Memory,
    Redis,
}

/// State store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,

    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Round-trip timeout for every store operation, in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            redis_url: default_redis_url(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_backend() -> StoreBackend {
    StoreBackend::Redis
}

fn default_redis_url() -> String {
    "redis://localhost:6379/0".to_string()
}

fn default_timeout_ms() -> u64 {
    250
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Algorithm of the policy used when none matches
    #[serde(default = "default_algorithm")]
    pub default_algorithm: Algorithm,

    #[serde(default = "default_limit")]
    pub default_limit: u64,

    #[serde(default = "default_window_seconds")]
    pub default_window_seconds: u64,

    /// Behaviour when the store is unavailable
    pub failure_mode: FailureMode,

    /// YAML file of policies created at startup
    #[serde(default)]
    pub policies_path: Option<String>,
}

impl RateLimitingConfig {
    pub fn default_policy(&self) -> DefaultPolicy {
        DefaultPolicy {
            algorithm: self.default_algorithm,
            limit: self.default_limit,
            window_seconds: self.default_window_seconds,
        }
    }
}

fn default_algorithm() -> Algorithm {
    Algorithm::FixedWindow
}

fn default_limit() -> u64 {
    100
}

fn default_window_seconds() -> u64 {
    60
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

impl ThrottlexConfig {
    /// Load from an optional YAML file layered under the environment.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::new(path, FileFormat::Yaml));
        }
        builder = builder.add_source(
            Environment::with_prefix("THROTTLEX")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        Self::from_builder(builder)
    }

    /// Load from a YAML string only.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Self::from_builder(Config::builder().add_source(File::from_str(yaml, FileFormat::Yaml)))
    }

    fn from_builder(builder: ConfigBuilder<DefaultState>) -> Result<Self> {
        let config: ThrottlexConfig = builder
            .build()
            .map_err(|e| ThrottlexError::Config(e.to_string()))?
            .try_deserialize()
            .map_err(|e| ThrottlexError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_LIMIT).contains(&self.rate_limiting.default_limit) {
            return Err(ThrottlexError::Config(format!(
                "rate_limiting.default_limit must be between 1 and {}",
                MAX_LIMIT
            )));
        }
        if !(1..=MAX_WINDOW_SECONDS).contains(&self.rate_limiting.default_window_seconds) {
            return Err(ThrottlexError::Config(format!(
                "rate_limiting.default_window_seconds must be between 1 and {}",
                MAX_WINDOW_SECONDS
            )));
        }
        if self.store.timeout_ms == 0 {
            return Err(ThrottlexError::Config("store.timeout_ms must be > 0".to_string()));
        }
        self.server.socket_addr()?;
        Ok(())
    }
}
