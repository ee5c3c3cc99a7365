//! Configuration types for gpuq

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Task store configuration
    pub store: StoreConfig,
    /// Scheduler loop configuration
    pub scheduler: SchedulerConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl DaemonConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, crate::GpuqError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::GpuqError::Config(format!("Failed to read config file: {}", e))
        })?;
        toml::from_str(&content)
            .map_err(|e| crate::GpuqError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Load `path` if given, defaults otherwise
    pub fn load(path: Option<&Path>) -> Result<Self, crate::GpuqError> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }
}

/// Task store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Path to the SQLite database shared by daemon and CLI
    pub database: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database: PathBuf::from("gpuq.db"),
        }
    }
}

/// Scheduler loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Delay between device availability checks while a task waits for GPUs
    pub find_gpu_delay_secs: u64,
    /// Delay after each dispatch before the next cycle
    pub cycle_delay_secs: u64,
    /// Delay when nothing is queued
    pub idle_poll_secs: u64,
    /// Interval between termination signals sent by `stop`
    pub stop_retry_secs: u64,
    /// Devices above this utilization fraction are busy
    pub max_load: f64,
    /// Devices above this memory fraction are busy
    pub max_memory: f64,
}

impl SchedulerConfig {
    pub fn find_gpu_delay(&self) -> Duration {
        Duration::from_secs(self.find_gpu_delay_secs)
    }

    pub fn cycle_delay(&self) -> Duration {
        Duration::from_secs(self.cycle_delay_secs)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_secs(self.idle_poll_secs)
    }

    pub fn stop_retry(&self) -> Duration {
        Duration::from_secs(self.stop_retry_secs)
    }

    pub fn validate(&self) -> Result<(), crate::GpuqError> {
        for (name, value) in [("max_load", self.max_load), ("max_memory", self.max_memory)] {
            if !(0.0..=1.0).contains(&value) {
                return Err(crate::GpuqError::Config(format!(
                    "{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }
        Ok(())
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            find_gpu_delay_secs: 600,
            cycle_delay_secs: 60,
            idle_poll_secs: 5,
            stop_retry_secs: 10,
            max_load: 0.1,
            max_memory: 0.1,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log format (json or text)
    pub format: String,
    /// Log file path (if any)
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            file: Some(PathBuf::from("logs/gpuq.log")),
        }
    }
}
