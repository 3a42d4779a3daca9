//! Immutable per-refresh view of the GPU topology
//!
//! A snapshot is built once from a [`TopologySource`] and never mutated.
//! Refreshing produces a new snapshot, so a cycle that holds an
//! `Arc<TopologySnapshot>` can never observe a half-updated topology.

use chrono::{DateTime, Utc};
use guard_core::{DeviceId, Error, GpuDevice, PlacementConfig, Result, TopologySource};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info, warn};

/// SLIT distance of a node to itself
pub const LOCAL_NUMA_DISTANCE: u32 = 10;

/// Weights of the affinity score
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffinityWeights {
    pub numa_weight: f64,
    pub pcie_weight: f64,
}

impl From<&PlacementConfig> for AffinityWeights {
    fn from(config: &PlacementConfig) -> Self {
        Self {
            numa_weight: config.numa_weight,
            pcie_weight: config.pcie_weight,
        }
    }
}

impl Default for AffinityWeights {
    fn default() -> Self {
        Self::from(&PlacementConfig::default())
    }
}

/// Devices and NUMA distances captured at one refresh
#[derive(Debug, Clone)]
pub struct TopologySnapshot {
    devices: BTreeMap<DeviceId, GpuDevice>,
    numa_distances: HashMap<(u32, u32), u32>,
    generation: u64,
    built_at: DateTime<Utc>,
}

impl TopologySnapshot {
    /// Query the source once and capture everything the scorer and planner need
    pub fn build(source: &dyn TopologySource, generation: u64) -> Result<Self> {
        let devices = source.discover()?;
        if devices.is_empty() {
            return Err(Error::topology("topology source reported no GPU devices"));
        }

        let nodes: BTreeSet<u32> = devices.iter().map(|d| d.numa_node).collect();
        let mut numa_distances = HashMap::new();
        for &from in &nodes {
            for &to in &nodes {
                if from == to {
                    continue;
                }
                match source.numa_distance(from, to) {
                    Some(distance) => {
                        numa_distances.insert((from, to), distance);
                    }
                    None => warn!("No NUMA distance reported for nodes {} -> {}", from, to),
                }
            }
        }

        let snapshot = Self::from_parts(devices, numa_distances, generation)?;
        info!(
            "Built topology snapshot generation {}: {} devices across {} NUMA nodes",
            generation,
            snapshot.devices.len(),
            nodes.len()
        );
        Ok(snapshot)
    }

    /// Assemble a snapshot from already-discovered parts
    pub fn from_parts(
        devices: Vec<GpuDevice>,
        numa_distances: HashMap<(u32, u32), u32>,
        generation: u64,
    ) -> Result<Self> {
        let mut by_id = BTreeMap::new();
        for device in devices {
            let id = device.device_id.clone();
            if by_id.insert(id.clone(), device).is_some() {
                return Err(Error::topology(format!("duplicate device id {}", id)));
            }
        }

        Ok(Self {
            devices: by_id,
            numa_distances,
            generation,
            built_at: Utc::now(),
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }

    pub fn device(&self, id: &DeviceId) -> Option<&GpuDevice> {
        self.devices.get(id)
    }

    /// Device with the given driver index
    pub fn device_by_index(&self, index: u32) -> Option<&GpuDevice> {
        self.devices.values().find(|device| device.index == index)
    }

    /// Devices in id order
    pub fn devices(&self) -> impl Iterator<Item = &GpuDevice> {
        self.devices.values()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Normalized NUMA distance between the nodes of two devices; 0 on the same node.
    ///
    /// Raw distances are averaged over both directions so the result is
    /// symmetric even when the firmware table is not.
    pub fn numa_distance(&self, a: &DeviceId, b: &DeviceId) -> Option<f64> {
        let node_a = self.devices.get(a)?.numa_node;
        let node_b = self.devices.get(b)?.numa_node;
        if node_a == node_b {
            return Some(0.0);
        }

        let forward = self.numa_distances.get(&(node_a, node_b)).copied();
        let backward = self.numa_distances.get(&(node_b, node_a)).copied();
        let raw = match (forward, backward) {
            (Some(f), Some(b)) => (f as f64 + b as f64) / 2.0,
            (Some(d), None) | (None, Some(d)) => d as f64,
            (None, None) => return None,
        };

        let local = LOCAL_NUMA_DISTANCE as f64;
        Some(((raw - local) / local).max(0.0))
    }

    /// Bus hops between two devices through their closest common PCIe ancestor
    pub fn pcie_hops(&self, a: &DeviceId, b: &DeviceId) -> Option<u32> {
        let path_a = &self.devices.get(a)?.pcie_path;
        let path_b = &self.devices.get(b)?.pcie_path;
        let common = path_a
            .iter()
            .zip(path_b.iter())
            .take_while(|(x, y)| x == y)
            .count();
        Some(((path_a.len() - common) + (path_b.len() - common)) as u32)
    }

    /// `numa_weight * numa_distance + pcie_weight * pcie_hops`.
    ///
    /// `None` when either device or their NUMA distance is unknown.
    pub fn affinity_score(
        &self,
        a: &DeviceId,
        b: &DeviceId,
        weights: &AffinityWeights,
    ) -> Option<f64> {
        if a == b {
            return self.devices.contains_key(a).then_some(0.0);
        }
        let numa = self.numa_distance(a, b)?;
        let hops = self.pcie_hops(a, b)?;
        let score = weights.numa_weight * numa + weights.pcie_weight * hops as f64;
        debug!("Affinity {} <-> {}: numa={:.2} hops={} score={:.3}", a, b, numa, hops, score);
        Some(score)
    }
}
