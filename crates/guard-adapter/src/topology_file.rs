//! Topology source backed by a YAML inventory and sysfs
//!
//! The inventory lists GPUs with their NUMA node, PCIe path and MIG profiles.
//! NUMA distances come from the inventory's optional matrix, or from
//! `/sys/devices/system/node/node*/distance` when the matrix is absent.

use crate::{AdapterError, Result};
use guard_core::{GpuDevice, TopologySource};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

/// On-disk device inventory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologyInventory {
    pub devices: Vec<GpuDevice>,

    /// Row `i`, column `j`: distance from node `i` to node `j`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub numa_distances: Option<Vec<Vec<u32>>>,
}

impl TopologyInventory {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AdapterError::Topology(format!("cannot read {}: {}", path.display(), e)))?;
        Ok(serde_yaml::from_str(&content)?)
    }
}

/// Reads the inventory on every discovery so refreshes pick up edits
#[derive(Debug)]
pub struct FileTopologySource {
    inventory_path: PathBuf,
    sysfs_node_dir: PathBuf,
    distances: RwLock<HashMap<(u32, u32), u32>>,
}

impl FileTopologySource {
    pub fn new(inventory_path: impl Into<PathBuf>, sysfs_node_dir: impl Into<PathBuf>) -> Self {
        Self {
            inventory_path: inventory_path.into(),
            sysfs_node_dir: sysfs_node_dir.into(),
            distances: RwLock::new(HashMap::new()),
        }
    }

    fn load(&self) -> Result<Vec<GpuDevice>> {
        let inventory = TopologyInventory::from_file(&self.inventory_path)?;

        let distances = match &inventory.numa_distances {
            Some(matrix) => matrix_to_map(matrix),
            None => {
                debug!("No NUMA matrix in inventory, reading {}", self.sysfs_node_dir.display());
                read_sysfs_distances(&self.sysfs_node_dir)
            }
        };
        if distances.is_empty() {
            warn!("No NUMA distances available; cross-node candidates will rank last");
        }
        *self.write_distances() = distances;

        info!(
            "Loaded {} GPUs from {}",
            inventory.devices.len(),
            self.inventory_path.display()
        );
        Ok(inventory.devices)
    }

    fn read_distances(&self) -> RwLockReadGuard<'_, HashMap<(u32, u32), u32>> {
        match self.distances.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_distances(&self) -> RwLockWriteGuard<'_, HashMap<(u32, u32), u32>> {
        match self.distances.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl TopologySource for FileTopologySource {
    fn discover(&self) -> guard_core::Result<Vec<GpuDevice>> {
        Ok(self.load()?)
    }

    fn numa_distance(&self, from: u32, to: u32) -> Option<u32> {
        self.read_distances().get(&(from, to)).copied()
    }
}

fn matrix_to_map(matrix: &[Vec<u32>]) -> HashMap<(u32, u32), u32> {
    let mut map = HashMap::new();
    for (from, row) in matrix.iter().enumerate() {
        for (to, distance) in row.iter().enumerate() {
            map.insert((from as u32, to as u32), *distance);
        }
    }
    map
}

/// Distances from `<dir>/node<N>/distance`; empty when the directory is unreadable
fn read_sysfs_distances(dir: &Path) -> HashMap<(u32, u32), u32> {
    let mut map = HashMap::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Cannot read NUMA nodes from {}: {}", dir.display(), e);
            return map;
        }
    };

    for entry in entries.flatten() {
        let name = entry.file_name();
        let node = name
            .to_str()
            .and_then(|n| n.strip_prefix("node"))
            .and_then(|n| n.parse::<u32>().ok());
        let Some(node) = node else {
            continue;
        };
        let content = match std::fs::read_to_string(entry.path().join("distance")) {
            Ok(content) => content,
            Err(e) => {
                warn!("Cannot read distance of NUMA node {}: {}", node, e);
                continue;
            }
        };
        for (to, value) in content.split_whitespace().enumerate() {
            if let Ok(distance) = value.parse::<u32>() {
                map.insert((node, to as u32), distance);
            }
        }
    }
    map
}
