//! Runtime Configuration
//!
//! Configuration for the Asthra runtime: worker pool size, callback
//! queue capacity, and log level. Values come from the builder API or
//! from environment variables:
//!
//! | Variable               | Meaning                       | Default        |
//! |------------------------|-------------------------------|----------------|
//! | `ASTHRA_NUM_WORKERS`   | scheduler worker threads      | logical CPUs   |
//! | `ASTHRA_MAX_CALLBACKS` | callback queue capacity       | 1024           |
//! | `ASTHRA_LOG_LEVEL`     | trace/debug/info/warn/error   | warn           |

use thiserror::Error;

use crate::log::LogLevel;
use crate::platform;

/// Default callback queue capacity.
pub const DEFAULT_MAX_CALLBACKS: usize = 1024;

/// Configuration errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A numeric variable did not parse.
    #[error("invalid value for {var}: {value:?}")]
    InvalidValue {
        /// Variable or field name.
        var: &'static str,
        /// The offending text.
        value: String,
    },

    /// A value parsed but is outside the allowed range.
    #[error("{var} must be at least 1 (got {got})")]
    OutOfRange {
        /// Variable or field name.
        var: &'static str,
        /// The rejected value.
        got: usize,
    },
}

/// Runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Number of scheduler worker threads.
    pub num_workers: usize,
    /// Callback queue capacity.
    pub max_callbacks: usize,
    /// Minimum log level.
    pub log_level: LogLevel,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            num_workers: platform::num_cpus(),
            max_callbacks: DEFAULT_MAX_CALLBACKS,
            log_level: LogLevel::default(),
        }
    }
}

impl RuntimeConfig {
    /// Start building a configuration from the defaults.
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder {
            config: Self::default(),
        }
    }

    /// Load configuration from `ASTHRA_*` environment variables.
    ///
    /// Unset variables keep their defaults; set-but-invalid variables
    /// are errors rather than silent fallbacks.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("ASTHRA_NUM_WORKERS") {
            config.num_workers = parse_count("ASTHRA_NUM_WORKERS", &v)?;
        }
        if let Ok(v) = std::env::var("ASTHRA_MAX_CALLBACKS") {
            config.max_callbacks = parse_count("ASTHRA_MAX_CALLBACKS", &v)?;
        }
        if let Ok(v) = std::env::var("ASTHRA_LOG_LEVEL") {
            config.log_level = LogLevel::parse(&v).ok_or(ConfigError::InvalidValue {
                var: "ASTHRA_LOG_LEVEL",
                value: v,
            })?;
        }

        Ok(config)
    }

    /// Validate a hand-assembled configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_workers == 0 {
            return Err(ConfigError::OutOfRange {
                var: "num_workers",
                got: 0,
            });
        }
        if self.max_callbacks == 0 {
            return Err(ConfigError::OutOfRange {
                var: "max_callbacks",
                got: 0,
            });
        }
        Ok(())
    }
}

fn parse_count(var: &'static str, value: &str) -> Result<usize, ConfigError> {
    let n: usize = value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        var,
        value: value.to_string(),
    })?;
    if n == 0 {
        return Err(ConfigError::OutOfRange { var, got: 0 });
    }
    Ok(n)
}

/// Builder for [`RuntimeConfig`].
#[derive(Debug, Clone)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    /// Set the number of worker threads.
    pub fn num_workers(mut self, n: usize) -> Self {
        self.config.num_workers = n;
        self
    }

    /// Set the callback queue capacity.
    pub fn max_callbacks(mut self, n: usize) -> Self {
        self.config.max_callbacks = n;
        self
    }

    /// Set the minimum log level.
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log_level = level;
        self
    }

    /// Validate and produce the configuration.
    pub fn build(self) -> Result<RuntimeConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
