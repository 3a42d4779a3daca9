//! Configuration management for the gpu-guard daemon

use guard_adapter::CommandSinkConfig;
use guard_core::GuardConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Prefix for environment overrides, e.g. `GPU_GUARD__CONTROLLER__TAIL_THRESHOLD_MS`
pub const ENV_PREFIX: &str = "GPU_GUARD";

/// Complete configuration for the daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Decision engine and executor configuration
    #[serde(flatten)]
    pub guard: GuardConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Where observations and topology come from and how actions are applied
    pub sources: SourcesConfig,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,

    /// Show target in logs
    pub show_target: bool,

    /// Show thread IDs in logs
    pub show_thread_ids: bool,

    /// Show line numbers in logs
    pub show_line_numbers: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            show_target: true,
            show_thread_ids: false,
            show_line_numbers: false,
        }
    }
}

/// Host integration paths
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourcesConfig {
    /// Directory of `<pid>.metric` files
    pub metrics_dir: PathBuf,

    /// YAML GPU inventory
    pub topology_file: PathBuf,

    /// sysfs NUMA node directory, used when the inventory has no distance matrix
    pub sysfs_node_dir: PathBuf,

    /// cgroup, procfs and nvidia-smi locations for the command sink
    #[serde(flatten)]
    pub command: CommandSinkConfig,

    /// Add residents found by `nvidia-smi pmon` to those in metric files
    pub process_discovery: bool,

    /// Deadline for one pmon sample
    pub process_discovery_timeout_ms: u64,

    /// Log actions instead of applying them
    pub dry_run: bool,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            metrics_dir: PathBuf::from("/var/run/tenant_metrics"),
            topology_file: PathBuf::from("/etc/gpu-guard/topology.yaml"),
            sysfs_node_dir: PathBuf::from("/sys/devices/system/node"),
            command: CommandSinkConfig::default(),
            process_discovery: true,
            process_discovery_timeout_ms: 5000,
            dry_run: false,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            guard: GuardConfig::default(),
            logging: LoggingConfig::default(),
            sources: SourcesConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Load configuration with precedence: environment, then the file if any, then defaults
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        let defaults = config::Config::try_from(&Self::default())
            .map_err(|e| crate::AgentError::Config(format!("Failed to build defaults: {}", e)))?;
        let mut builder = config::Config::builder().add_source(defaults);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path.to_path_buf()));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| crate::AgentError::Config(format!("Failed to load config: {}", e)))
    }

    /// Save configuration to a file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> crate::Result<()> {
        let content = serde_yaml::to_string(self)
            .map_err(|e| crate::AgentError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::AgentError::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        self.guard
            .validate()
            .map_err(|e| {
                crate::AgentError::Config(format!("Guard config validation failed: {}", e))
            })?;

        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(crate::AgentError::Config(format!(
                    "Invalid log level: {}",
                    self.logging.level
                )))
            }
        }

        match self.logging.format.as_str() {
            "text" | "json" => {}
            _ => {
                return Err(crate::AgentError::Config(format!(
                    "Invalid log format: {}",
                    self.logging.format
                )))
            }
        }

        if self.sources.metrics_dir.as_os_str().is_empty() {
            return Err(crate::AgentError::Config("metrics_dir cannot be empty".to_string()));
        }

        if self.sources.process_discovery && self.sources.process_discovery_timeout_ms == 0 {
            return Err(crate::AgentError::Config(
                "process_discovery_timeout_ms must be > 0".to_string(),
            ));
        }

        for device in &self.sources.command.block_devices {
            let valid = device
                .split_once(':')
                .map(|(major, minor)| major.parse::<u32>().is_ok() && minor.parse::<u32>().is_ok())
                .unwrap_or(false);
            if !valid {
                return Err(crate::AgentError::Config(format!(
                    "Invalid block device '{}', expected MAJ:MIN",
                    device
                )));
            }
        }

        Ok(())
    }
}
