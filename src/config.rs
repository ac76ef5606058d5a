use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chain::{TimeoutPolicy, DEFAULT_TIMEOUT_SECS};

/// Invalid values caught after the configuration layers are merged
#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("chain.timeout_secs must be a positive number of seconds, got {0}")]
    InvalidTimeout(f64),

    #[error("worker.tick_interval_ms must be greater than zero")]
    ZeroTickInterval,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub chain: ChainConfig,
    pub worker: WorkerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Seconds before an unready chain is expired (default: 60.0)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: f64,
    /// What an expired chain does with its waiting steps
    #[serde(default)]
    pub policy: TimeoutPolicy,
}

fn default_timeout_secs() -> f64 {
    DEFAULT_TIMEOUT_SECS
}

impl ChainConfig {
    pub fn timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.timeout_secs)
            .unwrap_or_else(|_| Duration::from_secs_f64(DEFAULT_TIMEOUT_SECS))
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            policy: TimeoutPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Milliseconds between timer polls in the run loop (default: 10)
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Step table capacity; factory calls beyond it return nothing
    #[serde(default = "default_table_capacity")]
    pub max_steps: usize,
    /// Session table capacity
    #[serde(default = "default_table_capacity")]
    pub max_sessions: usize,
    /// Leave the run loop once no steps or timers remain
    #[serde(default)]
    pub exit_when_idle: bool,
}

fn default_tick_interval_ms() -> u64 {
    10
}

fn default_table_capacity() -> usize {
    4096
}

impl WorkerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            max_steps: default_table_capacity(),
            max_sessions: default_table_capacity(),
            exit_when_idle: false,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Write logs to a file under `dir` instead of stderr
    #[serde(default)]
    pub to_file: bool,

    /// Directory for log files
    #[serde(default = "default_log_dir")]
    pub dir: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            to_file: false,
            dir: default_log_dir(),
        }
    }
}

impl Config {
    /// Project-local config file, read when present
    pub fn local_config_path() -> PathBuf {
        PathBuf::from("nebula.toml")
    }

    pub fn load(config_path: Option<&str>) -> Result<Self> {
        // Embedded defaults so nothing has to exist on disk
        let defaults = Config::default();
        let defaults_json =
            serde_json::to_string(&defaults).context("Failed to serialize default config")?;

        let mut builder = config::Config::builder().add_source(config::File::from_str(
            &defaults_json,
            config::FileFormat::Json,
        ));

        let local_config = Self::local_config_path();
        if local_config.exists() {
            builder = builder.add_source(config::File::from(local_config));
        }

        // User config in ~/.config/nebula/ (optional global overrides)
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("nebula").join("config.toml");
            if user_config.exists() {
                builder = builder.add_source(config::File::from(user_config));
            }
        }

        // Explicit config file (CLI override)
        if let Some(path) = config_path {
            builder = builder.add_source(config::File::with_name(path));
        }

        // Environment variables, e.g. NEBULA__CHAIN__TIMEOUT_SECS=5
        builder = builder.add_source(
            config::Environment::with_prefix("NEBULA")
                .separator("__")
                .try_parsing(true),
        );

        let config: Config = builder
            .build()
            .context("Failed to load configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let secs = self.chain.timeout_secs;
        if !secs.is_finite() || secs <= 0.0 {
            return Err(ConfigError::InvalidTimeout(secs));
        }
        // Chain deadlines are armed as `Instant`s, which hold less than `Duration`
        let representable = Duration::try_from_secs_f64(secs)
            .ok()
            .and_then(|timeout| Instant::now().checked_add(timeout))
            .is_some();
        if !representable {
            return Err(ConfigError::InvalidTimeout(secs));
        }
        if self.worker.tick_interval_ms == 0 {
            return Err(ConfigError::ZeroTickInterval);
        }
        Ok(())
    }

    /// Write the config as TOML
    pub fn save(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).context("Failed to create config directory")?;
            }
        }

        let toml_str = self.to_toml()?;
        std::fs::write(path, toml_str).context("Failed to write config file")?;

        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config to TOML")
    }

    /// Absolute path to the log directory
    pub fn logs_path(&self) -> PathBuf {
        let path = PathBuf::from(&self.logging.dir);
        if path.is_absolute() {
            path
        } else {
            std::env::current_dir().unwrap_or_default().join(path)
        }
    }
}
