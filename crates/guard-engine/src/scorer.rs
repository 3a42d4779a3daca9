//! Ranking of co-resident tenants as likely sources of interference

use crate::topology::{AffinityWeights, TopologySnapshot};
use guard_core::{BullyCandidate, CoResident, DeviceId, PlacementConfig, TenantId, Violation};
use std::cmp::Ordering;
use std::collections::HashSet;
use tracing::debug;

/// Topology-aware bully ranking
#[derive(Debug, Clone)]
pub struct PlacementScorer {
    weights: AffinityWeights,
}

impl PlacementScorer {
    pub fn new(weights: AffinityWeights) -> Self {
        Self { weights }
    }

    pub fn from_config(config: &PlacementConfig) -> Self {
        Self::new(AffinityWeights::from(config))
    }

    pub fn weights(&self) -> &AffinityWeights {
        &self.weights
    }

    /// Rank every co-resident tenant except the victim, most likely bully first.
    ///
    /// Order is ascending affinity score, then descending usage, then ascending
    /// tenant id. Candidates whose distance to the victim cannot be computed
    /// score `f64::INFINITY` and sink to the bottom. When the victim or a
    /// candidate is reported on several devices, the closest pair counts and
    /// each candidate appears once.
    pub fn rank(
        &self,
        victim: TenantId,
        topology: &TopologySnapshot,
        residents: &[CoResident],
    ) -> Vec<BullyCandidate> {
        let victim_devices: Vec<&DeviceId> = residents
            .iter()
            .filter(|r| r.tenant_id == victim)
            .map(|r| &r.device_id)
            .collect();
        if victim_devices.is_empty() {
            debug!("No placement reported for victim {}, all candidates score as unknown", victim);
        }

        let mut candidates: Vec<BullyCandidate> = residents
            .iter()
            .filter(|r| r.tenant_id != victim)
            .map(|r| {
                let score = victim_devices
                    .iter()
                    .filter_map(|device| {
                        topology.affinity_score(device, &r.device_id, &self.weights)
                    })
                    .min_by(f64::total_cmp)
                    .unwrap_or(f64::INFINITY);
                BullyCandidate {
                    tenant_id: r.tenant_id,
                    device_id: r.device_id.clone(),
                    score,
                    usage: r.resource_usage,
                }
            })
            .collect();

        candidates.sort_by(compare_candidates);

        let mut seen = HashSet::new();
        candidates.retain(|c| seen.insert(c.tenant_id));
        candidates
    }

    /// Fill `candidate_bullies` of a violation in place
    pub fn rank_violation(
        &self,
        violation: &mut Violation,
        topology: &TopologySnapshot,
        residents: &[CoResident],
    ) {
        violation.candidate_bullies = self.rank(violation.tenant_id, topology, residents);
        if let Some(top) = violation.top_candidate() {
            debug!(
                "Top bully for {}: tenant {} on {} (score {:.3}, usage {:.2})",
                violation.tenant_id, top.tenant_id, top.device_id, top.score, top.usage
            );
        }
    }
}

/// Total order over candidates
fn compare_candidates(a: &BullyCandidate, b: &BullyCandidate) -> Ordering {
    a.score
        .total_cmp(&b.score)
        .then_with(|| b.usage.total_cmp(&a.usage))
        .then_with(|| a.tenant_id.cmp(&b.tenant_id))
        .then_with(|| a.device_id.cmp(&b.device_id))
}
