//! Capability traits for the external collaborators of the control loop
//!
//! The decision engine never talks to the system directly. Topology, latency
//! observations, GPU process discovery and action execution are reached
//! through these traits, which
//! are implemented by the adapters and by the mocks used in tests.

use crate::action::{MitigationAction, SinkError};
use crate::types::{CycleSample, GpuDevice, GpuProcess};
use crate::Result;
use async_trait::async_trait;

/// Source of device topology, consumed once per snapshot refresh
pub trait TopologySource: Send + Sync {
    /// Discover all GPUs with their NUMA node, PCIe path and MIG profiles
    fn discover(&self) -> Result<Vec<GpuDevice>>;

    /// Raw NUMA distance between two nodes (ACPI SLIT scale, local = 10)
    fn numa_distance(&self, from: u32, to: u32) -> Option<u32>;
}

/// Source of per-cycle tenant latency observations
#[async_trait]
pub trait ObservationSource: Send + Sync {
    /// Collect the current latency of every known tenant and where it runs
    async fn collect(&self) -> Result<CycleSample>;
}

/// Source of the compute processes currently running on each GPU
#[async_trait]
pub trait ProcessSource: Send + Sync {
    /// List processes with the driver index of the GPU they run on
    async fn processes(&self) -> Result<Vec<GpuProcess>>;

    /// Short name for logging
    fn name(&self) -> &'static str;
}

/// Sink that applies a mitigation action to the system
#[async_trait]
pub trait ActionSink: Send + Sync {
    /// Apply the action; failures are classified by the sink
    async fn execute(&self, action: &MitigationAction) -> std::result::Result<(), SinkError>;

    /// Short name for logging
    fn name(&self) -> &'static str;
}
