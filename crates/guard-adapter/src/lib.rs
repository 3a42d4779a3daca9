//! # guard-adapter
//!
//! Effectful edges of gpu-guard: everything that touches the host.
//!
//! This crate provides:
//! - [`ActionExecutor`]: idempotent, time-bounded, per-device serialized action application
//! - [`CommandActionSink`]: cgroup v2 `io.max` writes and `nvidia-smi` MIG commands
//! - [`DryRunSink`]: logs actions without applying them
//! - [`MetricsDirSource`]: per-tenant latency files written by an external collector
//! - [`PmonProcessSource`]: GPU processes and utilization from `nvidia-smi pmon`
//! - [`FileTopologySource`]: YAML device inventory with sysfs NUMA distances
//!
//! Mocks for every capability trait live in [`mock`] behind the `mock` feature.

use thiserror::Error;

pub mod command;
pub mod dry_run;
pub mod executor;
pub mod metrics_dir;
pub mod pmon;
pub mod topology_file;

// Mock implementations for testing
#[cfg(any(feature = "mock", test))]
pub mod mock;

pub use command::{classify_failure, CommandActionSink, CommandSinkConfig};
pub use dry_run::DryRunSink;
pub use executor::{ActionExecutor, ExecutorStats};
pub use metrics_dir::MetricsDirSource;
pub use pmon::{parse_pmon, PmonProcessSource};
pub use topology_file::{FileTopologySource, TopologyInventory};

/// Result type for adapter operations
pub type Result<T> = std::result::Result<T, AdapterError>;

/// Errors that can occur in the adapters
#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("Topology source error: {0}")]
    Topology(String),

    #[error("Metrics source error: {0}")]
    Metrics(String),

    #[error("Command error: {0}")]
    Command(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Core(#[from] guard_core::Error),
}

impl From<AdapterError> for guard_core::Error {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::Core(e) => e,
            AdapterError::Io(e) => guard_core::Error::Io(e),
            AdapterError::Yaml(e) => guard_core::Error::Yaml(e),
            AdapterError::Topology(msg) => guard_core::Error::topology(msg),
            AdapterError::Metrics(msg) => guard_core::Error::invalid_observation(msg),
            AdapterError::Command(msg) => guard_core::Error::Other(anyhow::anyhow!(msg)),
        }
    }
}
