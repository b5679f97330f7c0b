//! Runtime Configuration
//!
//! Configuration for the epoch runtime. Options can be set programmatically
//! through the builder or loaded from environment variables.
//!
//! # Environment Variables
//!
//! All environment variables use the `REWIND_` prefix:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `REWIND_HEAP_SIZE` | Managed heap arena size in bytes | 16777216 (16MB) |
//! | `REWIND_MAX_FREE_OBJECTS` | Quarantine capacity before epoch-end pressure | 4096 |
//! | `REWIND_WATCHPOINTS` | Watchpoint registry capacity | 4 |
//! | `REWIND_DETECT_OVERFLOW` | Guard-byte overflow detection ("true"/"false") | true |
//! | `REWIND_DETECT_UAF` | Use-after-free detection ("true"/"false") | true |
//! | `REWIND_SEGV_HANDLER` | Install the SEGV rollback handler | false |
//! | `REWIND_LOG_LEVEL` | Log level (off/error/warn/info/debug/trace) | info |
//!
//! # Example
//!
//! ```rust,ignore
//! use rewind_runtime::config::RuntimeConfig;
//!
//! // Load from environment with defaults
//! let config = RuntimeConfig::from_env().unwrap();
//!
//! // Or use the builder pattern
//! let config = RuntimeConfig::builder()
//!     .heap_size(64 * 1024 * 1024)
//!     .max_free_objects(1024)
//!     .build();
//! ```

use std::env;

use crate::log::LogLevel;

/// Default managed heap arena size (16 MB).
pub const DEFAULT_HEAP_SIZE: usize = 16 * 1024 * 1024;

/// Default quarantine capacity.
pub const DEFAULT_MAX_FREE_OBJECTS: usize = 4096;

/// Default watchpoint registry capacity (hardware debug registers on x86).
pub const DEFAULT_WATCHPOINTS: usize = 4;

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable held a value that could not be parsed.
    #[error("invalid value for {var}: {value:?}")]
    InvalidValue {
        /// Variable name.
        var: &'static str,
        /// Offending value.
        value: String,
    },
    /// A configuration field failed validation.
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Managed heap arena size in bytes.
    pub heap_size: usize,
    /// Quarantine capacity; reaching it forces an epoch end.
    pub max_free_objects: usize,
    /// Watchpoint registry capacity.
    pub watchpoint_capacity: usize,
    /// Whether guard bytes are installed and verified.
    pub detect_overflow: bool,
    /// Whether freed blocks are poisoned and verified at commit.
    pub detect_uaf: bool,
    /// Whether to install the SEGV rollback handler at init.
    pub install_segv_handler: bool,
    /// Log level for the runtime logger.
    pub log_level: LogLevel,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            heap_size: DEFAULT_HEAP_SIZE,
            max_free_objects: DEFAULT_MAX_FREE_OBJECTS,
            watchpoint_capacity: DEFAULT_WATCHPOINTS,
            detect_overflow: true,
            detect_uaf: true,
            install_segv_handler: false,
            log_level: LogLevel::Info,
        }
    }
}

impl RuntimeConfig {
    /// Create a builder for the configuration.
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::new()
    }

    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(v) = parse_usize("REWIND_HEAP_SIZE")? {
            config.heap_size = v;
        }
        if let Some(v) = parse_usize("REWIND_MAX_FREE_OBJECTS")? {
            config.max_free_objects = v;
        }
        if let Some(v) = parse_usize("REWIND_WATCHPOINTS")? {
            config.watchpoint_capacity = v;
        }
        if let Some(v) = parse_bool("REWIND_DETECT_OVERFLOW")? {
            config.detect_overflow = v;
        }
        if let Some(v) = parse_bool("REWIND_DETECT_UAF")? {
            config.detect_uaf = v;
        }
        if let Some(v) = parse_bool("REWIND_SEGV_HANDLER")? {
            config.install_segv_handler = v;
        }
        if let Ok(s) = env::var("REWIND_LOG_LEVEL") {
            config.log_level = LogLevel::parse(&s).ok_or(ConfigError::InvalidValue {
                var: "REWIND_LOG_LEVEL",
                value: s,
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heap_size < 4096 {
            return Err(ConfigError::Invalid("heap_size must be at least one page"));
        }
        if self.max_free_objects == 0 {
            return Err(ConfigError::Invalid("max_free_objects must be nonzero"));
        }
        if self.watchpoint_capacity == 0 {
            return Err(ConfigError::Invalid("watchpoint_capacity must be nonzero"));
        }
        Ok(())
    }
}

fn parse_usize(var: &'static str) -> Result<Option<usize>, ConfigError> {
    match env::var(var) {
        Ok(s) => s
            .parse::<usize>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { var, value: s }),
        Err(_) => Ok(None),
    }
}

fn parse_bool(var: &'static str) -> Result<Option<bool>, ConfigError> {
    match env::var(var) {
        Ok(s) => match s.to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(Some(true)),
            "false" | "0" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigError::InvalidValue { var, value: s }),
        },
        Err(_) => Ok(None),
    }
}

/// Builder for [`RuntimeConfig`].
#[derive(Debug, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self {
            config: RuntimeConfig::default(),
        }
    }

    /// Set the managed heap arena size in bytes.
    pub fn heap_size(mut self, bytes: usize) -> Self {
        self.config.heap_size = bytes;
        self
    }

    /// Set the quarantine capacity.
    pub fn max_free_objects(mut self, count: usize) -> Self {
        self.config.max_free_objects = count;
        self
    }

    /// Set the watchpoint registry capacity.
    pub fn watchpoint_capacity(mut self, count: usize) -> Self {
        self.config.watchpoint_capacity = count;
        self
    }

    /// Enable or disable guard-byte overflow detection.
    pub fn detect_overflow(mut self, enabled: bool) -> Self {
        self.config.detect_overflow = enabled;
        self
    }

    /// Enable or disable use-after-free detection.
    pub fn detect_uaf(mut self, enabled: bool) -> Self {
        self.config.detect_uaf = enabled;
        self
    }

    /// Enable or disable SEGV handler installation at init.
    pub fn install_segv_handler(mut self, enabled: bool) -> Self {
        self.config.install_segv_handler = enabled;
        self
    }

    /// Set the runtime log level.
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log_level = level;
        self
    }

    /// Finish building the configuration.
    pub fn build(self) -> RuntimeConfig {
        self.config
    }
}
