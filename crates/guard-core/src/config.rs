//! Configuration management for gpu-guard
//!
//! The daemon layers these sections from defaults, an optional YAML file and
//! `GPU_GUARD__*` environment variables. The engine only sees the validated numbers.

use crate::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration structure for the decision engine and executor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Detection and loop cadence
    pub controller: ControllerConfig,

    /// Scoring and mitigation policy
    pub placement: PlacementConfig,

    /// Action execution
    pub executor: ExecutorConfig,
}

impl GuardConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.controller.validate()?;
        self.placement.validate()?;
        self.executor.validate()?;
        Ok(())
    }
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            controller: ControllerConfig::default(),
            placement: PlacementConfig::default(),
            executor: ExecutorConfig::default(),
        }
    }
}

/// Detection parameters and loop cadence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// p99 latency SLO in milliseconds
    pub tail_threshold_ms: f64,

    /// Consecutive violating cycles required before acting
    pub persistence_windows: u32,

    /// Cycles a tenant is held after a decision
    pub cooldown_observations: u32,

    /// Interval between cycles in milliseconds
    pub poll_interval_ms: u64,

    /// Rebuild the topology snapshot every N cycles (0 = startup only)
    pub topology_refresh_cycles: u64,

    /// Maximum actions decided per cycle (0 = unlimited)
    pub max_actions_per_cycle: usize,

    /// Forget a tenant after it has been absent for this many cycles (0 = never)
    pub stale_after_cycles: u64,
}

impl ControllerConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.tail_threshold_ms.is_finite() && self.tail_threshold_ms > 0.0) {
            return Err(crate::Error::config(format!(
                "tail_threshold_ms must be positive, got {}",
                self.tail_threshold_ms
            )));
        }
        if self.persistence_windows < 1 {
            return Err(crate::Error::config(format!(
                "persistence_windows must be >= 1, got {}",
                self.persistence_windows
            )));
        }
        if self.cooldown_observations < 1 {
            return Err(crate::Error::config(format!(
                "cooldown_observations must be >= 1, got {}",
                self.cooldown_observations
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(crate::Error::config("poll_interval_ms must be greater than zero"));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            tail_threshold_ms: 100.0,
            persistence_windows: 3,
            cooldown_observations: 10,
            poll_interval_ms: 30_000,
            topology_refresh_cycles: 10,
            max_actions_per_cycle: 0,
            stale_after_cycles: 3,
        }
    }
}

/// Scoring weights and mitigation policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlacementConfig {
    /// Weight applied to NUMA distance
    pub numa_weight: f64,

    /// Weight applied to PCIe hops
    pub pcie_weight: f64,

    /// Allow Tier 2 MIG repartitioning
    pub enable_mig_reconfiguration: bool,

    /// Upper bound of the Tier 1 bandwidth cap in MB/s
    pub max_cgroup_io_limit_mbps: u64,

    /// Floor of the Tier 1 bandwidth cap in MB/s
    pub min_cgroup_io_limit_mbps: u64,

    /// Severity at or above which a fresh episode starts at Tier 2
    pub high_severity_cutoff: f64,

    /// Failed executions after which the planner escalates (0 = never)
    pub failure_escalation_threshold: u32,
}

impl PlacementConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.numa_weight.is_finite() && self.numa_weight >= 0.0) {
            return Err(crate::Error::config(format!(
                "numa_weight must be non-negative, got {}",
                self.numa_weight
            )));
        }
        if !(self.pcie_weight.is_finite() && self.pcie_weight >= 0.0) {
            return Err(crate::Error::config(format!(
                "pcie_weight must be non-negative, got {}",
                self.pcie_weight
            )));
        }
        if self.max_cgroup_io_limit_mbps == 0 {
            return Err(crate::Error::config("max_cgroup_io_limit_mbps must be positive"));
        }
        if self.min_cgroup_io_limit_mbps > self.max_cgroup_io_limit_mbps {
            return Err(crate::Error::config(format!(
                "min_cgroup_io_limit_mbps ({}) exceeds max_cgroup_io_limit_mbps ({})",
                self.min_cgroup_io_limit_mbps, self.max_cgroup_io_limit_mbps
            )));
        }
        if self.high_severity_cutoff.is_nan() || self.high_severity_cutoff < 0.0 {
            return Err(crate::Error::config(format!(
                "high_severity_cutoff must be non-negative, got {}",
                self.high_severity_cutoff
            )));
        }
        Ok(())
    }
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            numa_weight: 2.0,
            pcie_weight: 1.5,
            enable_mig_reconfiguration: true,
            max_cgroup_io_limit_mbps: 1000,
            min_cgroup_io_limit_mbps: 50,
            high_severity_cutoff: 1.0,
            failure_escalation_threshold: 3,
        }
    }
}

/// Action execution settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Deadline for a single action in milliseconds
    pub action_timeout_ms: u64,
}

impl ExecutorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.action_timeout_ms == 0 {
            return Err(crate::Error::config("action_timeout_ms must be greater than zero"));
        }
        Ok(())
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_millis(self.action_timeout_ms)
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            action_timeout_ms: 30_000,
        }
    }
}
