//! Escalation policy: from a ranked violation to a concrete action

use crate::topology::TopologySnapshot;
use guard_core::{
    ActionParameters, BullyCandidate, GpuDevice, MigProfile, MitigationAction, MitigationTier,
    PlacementConfig, TenantRecord, Violation,
};
use tracing::{debug, info, warn};

/// Maps a violation and the tenant's history to an isolation action
#[derive(Debug, Clone)]
pub struct MitigationPlanner {
    config: PlacementConfig,
}

impl MitigationPlanner {
    pub fn new(config: PlacementConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PlacementConfig {
        &self.config
    }

    /// Plan the next action for a violation whose `candidate_bullies` are ranked.
    ///
    /// Returns `None` when there is no candidate to act on.
    pub fn plan(
        &self,
        violation: &Violation,
        record: &TenantRecord,
        topology: &TopologySnapshot,
    ) -> Option<MitigationAction> {
        let Some(top) = violation.top_candidate() else {
            info!("No bully candidates for tenant {}, nothing to mitigate", violation.tenant_id);
            return None;
        };

        let tier = self.select_tier(violation.severity, record);
        let action = match tier {
            MitigationTier::Tier1 => {
                self.throttle(tier, top, self.io_limit_mbps(violation.severity))
            }
            MitigationTier::Tier2 => self.isolate(top, violation.severity, topology),
        };

        info!("Planned for victim {}: {}", violation.tenant_id, action);
        Some(action)
    }

    /// Tier for this decision given severity and what was already tried
    pub fn select_tier(&self, severity: f64, record: &TenantRecord) -> MitigationTier {
        let threshold = self.config.failure_escalation_threshold;
        if threshold > 0 && record.failed_actions >= threshold {
            debug!(
                "{} failed actions reached escalation threshold {}",
                record.failed_actions, threshold
            );
            return MitigationTier::Tier2;
        }

        match record.last_tier_applied {
            Some(previous) => previous.escalate(),
            None if severity >= self.config.high_severity_cutoff => MitigationTier::Tier2,
            None => MitigationTier::Tier1,
        }
    }

    /// Tier 1 bandwidth cap: tighter as severity grows, never below the floor
    pub fn io_limit_mbps(&self, severity: f64) -> u64 {
        let max = self.config.max_cgroup_io_limit_mbps as f64;
        let min = self.config.min_cgroup_io_limit_mbps as f64;
        let raw = max / (1.0 + severity.max(0.0));
        raw.max(min).min(max).round() as u64
    }

    /// Smallest profile on the device: fewest slices, then least memory, then name.
    ///
    /// The device is the bully's, which is the one being repartitioned. The
    /// victim's device is not consulted: the smallest instance leaves the most
    /// capacity to co-tenants whether or not the victim shares that GPU.
    pub fn select_profile<'a>(&self, device: &'a GpuDevice) -> Option<&'a MigProfile> {
        device.available_profiles.iter().min_by(|a, b| {
            a.gpu_slice_count
                .cmp(&b.gpu_slice_count)
                .then_with(|| a.memory_size_mb.cmp(&b.memory_size_mb))
                .then_with(|| a.name.cmp(&b.name))
        })
    }

    fn throttle(
        &self,
        tier: MitigationTier,
        target: &BullyCandidate,
        io_limit_mbps: u64,
    ) -> MitigationAction {
        MitigationAction::new(
            tier,
            target.tenant_id,
            target.device_id.clone(),
            ActionParameters::IoLimit { io_limit_mbps },
        )
    }

    fn isolate(
        &self,
        target: &BullyCandidate,
        severity: f64,
        topology: &TopologySnapshot,
    ) -> MitigationAction {
        if self.config.enable_mig_reconfiguration {
            let profile = topology
                .device(&target.device_id)
                .and_then(|device| self.select_profile(device));
            if let Some(profile) = profile {
                return MitigationAction::new(
                    MitigationTier::Tier2,
                    target.tenant_id,
                    target.device_id.clone(),
                    ActionParameters::MigReconfigure {
                        profile: profile.name.clone(),
                    },
                );
            }
            warn!(
                "No MIG profile available on {}, falling back to a stricter bandwidth cap",
                target.device_id
            );
        }

        let min = self.config.min_cgroup_io_limit_mbps;
        let max = self.config.max_cgroup_io_limit_mbps;
        let stricter = (self.io_limit_mbps(severity) / 2).max(min).min(max);
        self.throttle(MitigationTier::Tier2, target, stricter)
    }
}
