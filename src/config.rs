//! Configuration module for chatvox.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::script::settings::mb_to_bytes;
use crate::script::ResourceLimits;
use crate::{ChatvoxError, Result};

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Path to the log file.
    #[serde(default = "default_log_file")]
    pub file: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> String {
    "logs/chatvox.log".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: default_log_file(),
        }
    }
}

/// Script processor configuration.
///
/// The limits here are the process-wide defaults; a user's settings file may
/// override them.
#[derive(Debug, Clone, Deserialize)]
pub struct ScriptConfig {
    /// Directory holding per-user `<user>.lua` scripts.
    #[serde(default = "default_settings_dir")]
    pub settings_dir: String,
    /// Maximum wall-clock execution time in seconds (0 = unlimited).
    #[serde(default)]
    pub max_exec_time_secs: u64,
    /// Per-function call caps, keyed by capability name.
    #[serde(default)]
    pub max_func_calls: HashMap<String, u32>,
    /// Lua allocator cap in megabytes (0 = unlimited).
    #[serde(default = "default_max_memory_mb")]
    pub max_memory_mb: usize,
    /// VM instructions between cancellation checks.
    #[serde(default = "default_interrupt_interval")]
    pub interrupt_interval: u32,
    /// Priority passed to the AI collaborator.
    #[serde(default)]
    pub ai_priority: u8,
}

fn default_settings_dir() -> String {
    "data/scripts".to_string()
}

fn default_max_memory_mb() -> usize {
    16
}

fn default_interrupt_interval() -> u32 {
    1000
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            settings_dir: default_settings_dir(),
            max_exec_time_secs: 0,
            max_func_calls: HashMap::new(),
            max_memory_mb: default_max_memory_mb(),
            interrupt_interval: default_interrupt_interval(),
            ai_priority: 0,
        }
    }
}

impl ScriptConfig {
    /// Resource limits applied to sessions whose settings do not override them.
    pub fn default_limits(&self) -> ResourceLimits {
        ResourceLimits {
            max_exec_duration: (self.max_exec_time_secs > 0)
                .then(|| Duration::from_secs(self.max_exec_time_secs)),
            max_calls_per_function: self.max_func_calls.clone(),
            // Out-of-range values are rejected by `Config::validate`.
            max_memory_bytes: mb_to_bytes(self.max_memory_mb).unwrap_or(usize::MAX),
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Script processor configuration.
    #[serde(default)]
    pub script: ScriptConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(ChatvoxError::Io)?;
        Self::parse(&content)
    }

    /// Load configuration from a TOML file and apply environment variable overrides.
    pub fn load_with_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| ChatvoxError::Config(format!("config parse error: {e}")))
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Supported environment variables:
    /// - `CHATVOX_LOG_LEVEL`: Override the log level
    /// - `CHATVOX_SETTINGS_DIR`: Override the per-user script directory
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("CHATVOX_LOG_LEVEL") {
            if !level.is_empty() {
                self.logging.level = level;
            }
        }
        if let Ok(dir) = std::env::var("CHATVOX_SETTINGS_DIR") {
            if !dir.is_empty() {
                self.script.settings_dir = dir;
            }
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.script.interrupt_interval == 0 {
            return Err(ChatvoxError::Validation(
                "script.interrupt_interval must be greater than zero".to_string(),
            ));
        }
        if mb_to_bytes(self.script.max_memory_mb).is_none() {
            return Err(ChatvoxError::Validation(format!(
                "script.max_memory_mb is too large: {}",
                self.script.max_memory_mb
            )));
        }
        if self.script.max_func_calls.keys().any(|k| k.trim().is_empty()) {
            return Err(ChatvoxError::Validation(
                "script.max_func_calls contains an empty function name".to_string(),
            ));
        }
        Ok(())
    }
}
