//! Core type definitions for gpu-guard

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a tenant workload (the process id of its GPU client)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub u32);

impl TenantId {
    pub fn new(pid: u32) -> Self {
        Self(pid)
    }

    /// The process id backing this tenant
    pub fn pid(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for TenantId {
    fn from(pid: u32) -> Self {
        Self(pid)
    }
}

impl std::str::FromStr for TenantId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u32>()
            .map(TenantId)
            .map_err(|e| format!("Invalid tenant id '{}': {}", s, e))
    }
}

/// Unique identifier for a GPU device (normally its UUID)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Create a new DeviceId from a string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the string representation of the DeviceId
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for DeviceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// One latency sample for one tenant, produced once per cycle by the metric source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub tenant_id: TenantId,
    /// p99 latency in milliseconds
    pub latency_ms: f64,
    pub observed_at: DateTime<Utc>,
}

impl Observation {
    pub fn new(
        tenant_id: impl Into<TenantId>,
        latency_ms: f64,
        observed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            latency_ms,
            observed_at,
        }
    }

    /// Check that the latency is usable: finite and non-negative
    pub fn validate(&self) -> crate::Result<()> {
        if !self.latency_ms.is_finite() || self.latency_ms < 0.0 {
            return Err(crate::Error::invalid_observation(format!(
                "tenant {} reported latency {}",
                self.tenant_id, self.latency_ms
            )));
        }
        Ok(())
    }
}

/// A tenant reported as running on a device, with its resource usage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoResident {
    pub tenant_id: TenantId,
    pub device_id: DeviceId,
    /// Relative resource usage; larger means heavier consumer
    pub resource_usage: f64,
}

impl CoResident {
    pub fn new(
        tenant_id: impl Into<TenantId>,
        device_id: impl Into<DeviceId>,
        resource_usage: f64,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            device_id: device_id.into(),
            resource_usage,
        }
    }
}

/// A compute process found on a GPU by driver-level discovery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuProcess {
    pub tenant_id: TenantId,

    /// Driver index of the device; mapped to a [`DeviceId`] through the topology
    pub gpu_index: u32,

    /// SM utilization in percent, if sampled
    pub sm_percent: Option<f64>,

    /// Memory bandwidth utilization in percent, if sampled
    pub mem_percent: Option<f64>,

    pub command: String,
}

impl GpuProcess {
    /// Heaviest sampled utilization as a 0..=1 fraction; idle when nothing was sampled
    pub fn resource_usage(&self) -> f64 {
        let busiest = self.sm_percent.unwrap_or(0.0).max(self.mem_percent.unwrap_or(0.0));
        (busiest / 100.0).clamp(0.0, 1.0)
    }
}

/// Everything the observation source reports for one cycle
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CycleSample {
    pub observations: Vec<Observation>,
    pub residents: Vec<CoResident>,
}

impl CycleSample {
    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }
}

/// MIG partition profile offered by a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigProfile {
    /// Profile name as understood by the driver tooling, e.g. "1g.10gb"
    pub name: String,

    /// GPU compute slice count
    pub gpu_slice_count: u32,

    /// Memory size in MB
    pub memory_size_mb: u64,
}

impl MigProfile {
    pub fn new(name: impl Into<String>, gpu_slice_count: u32, memory_size_mb: u64) -> Self {
        Self {
            name: name.into(),
            gpu_slice_count,
            memory_size_mb,
        }
    }
}

/// A GPU as seen by one topology refresh
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuDevice {
    pub device_id: DeviceId,

    /// Driver index of the device
    pub index: u32,

    pub numa_node: u32,

    /// Bus identifiers from the root complex down to the device
    pub pcie_path: Vec<String>,

    /// Currently configured MIG profile, if MIG is enabled
    #[serde(default)]
    pub mig_profile: Option<String>,

    /// MIG profiles the device can be reconfigured to
    #[serde(default)]
    pub available_profiles: Vec<MigProfile>,
}

impl GpuDevice {
    pub fn new(
        device_id: impl Into<DeviceId>,
        index: u32,
        numa_node: u32,
        pcie_path: Vec<String>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            index,
            numa_node,
            pcie_path,
            mig_profile: None,
            available_profiles: Vec::new(),
        }
    }

    pub fn with_mig_profile(mut self, profile: impl Into<String>) -> Self {
        self.mig_profile = Some(profile.into());
        self
    }

    pub fn with_available_profiles(mut self, profiles: Vec<MigProfile>) -> Self {
        self.available_profiles = profiles;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tenant_id_ordering_and_parse() {
        let a: TenantId = "1001".parse().unwrap();
        let b = TenantId::new(1002);
        assert!(a < b);
        assert_eq!(a.pid(), 1001);
        assert_eq!(b.to_string(), "1002");
        assert!("abc".parse::<TenantId>().is_err());
    }

    #[test]
    fn test_device_id_conversions() {
        let id = DeviceId::from("GPU-0");
        assert_eq!(id.as_str(), "GPU-0");
        assert_eq!(id, DeviceId::new("GPU-0".to_string()));
    }

    #[test]
    fn test_observation_validation() {
        let now = Utc::now();
        assert!(Observation::new(1u32, 120.0, now).validate().is_ok());
        assert!(Observation::new(1u32, 0.0, now).validate().is_ok());
        assert!(Observation::new(1u32, -1.0, now).validate().is_err());
        assert!(Observation::new(1u32, f64::NAN, now).validate().is_err());
        assert!(Observation::new(1u32, f64::INFINITY, now).validate().is_err());
    }

    #[test]
    fn test_gpu_device_builder() {
        let device = GpuDevice::new("GPU-0", 0, 1, vec!["0000:00".into(), "0000:3b".into()])
            .with_mig_profile("7g.80gb")
            .with_available_profiles(vec![MigProfile::new("1g.10gb", 1, 10240)]);
        assert_eq!(device.numa_node, 1);
        assert_eq!(device.mig_profile.as_deref(), Some("7g.80gb"));
        assert_eq!(device.available_profiles.len(), 1);
    }

    #[test]
    fn test_process_usage_takes_busiest_counter() {
        let mut process = GpuProcess {
            tenant_id: TenantId(7),
            gpu_index: 0,
            sm_percent: Some(35.0),
            mem_percent: Some(80.0),
            command: "python".to_string(),
        };
        assert!((process.resource_usage() - 0.8).abs() < 1e-9);

        process.sm_percent = None;
        process.mem_percent = None;
        assert_eq!(process.resource_usage(), 0.0);
    }

    #[test]
    fn test_device_yaml_defaults() {
        let yaml = "device_id: GPU-1\nindex: 1\nnuma_node: 0\npcie_path: [\"0000:00\"]\n";
        let device: GpuDevice = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(device.device_id, DeviceId::from("GPU-1"));
        assert!(device.mig_profile.is_none());
        assert!(device.available_profiles.is_empty());
    }
}
