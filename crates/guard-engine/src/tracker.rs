//! Per-tenant violation state machine
//!
//! The tracker is the only owner of [`TenantRecord`]s. Records are created
//! lazily on the first valid observation for a tenant and live until they
//! are pruned. Every transition is a pure function of the previous record
//! and the latency observed this cycle, so replaying the same latencies
//! replays the same states.

use chrono::{DateTime, Utc};
use guard_core::{
    ControllerConfig, Error, MitigationTier, Observation, Result, StateSummary, TenantId,
    TenantRecord, TenantState, Violation,
};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info, warn};

/// Detection parameters applied to every tenant
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionPolicy {
    pub threshold_ms: f64,
    pub persistence_windows: u32,
    pub cooldown_observations: u32,
}

impl From<&ControllerConfig> for DetectionPolicy {
    fn from(config: &ControllerConfig) -> Self {
        Self {
            threshold_ms: config.tail_threshold_ms,
            persistence_windows: config.persistence_windows,
            cooldown_observations: config.cooldown_observations,
        }
    }
}

impl DetectionPolicy {
    /// Relative overshoot of a latency over the threshold
    pub fn severity(&self, latency_ms: f64) -> f64 {
        ((latency_ms - self.threshold_ms) / self.threshold_ms).max(0.0)
    }

    /// Advance one record by one observation, returning a violation when the
    /// tenant is (still) in breach and awaiting a decision
    fn advance(
        &self,
        tenant: TenantId,
        record: &mut TenantRecord,
        obs: &Observation,
    ) -> Option<Violation> {
        let latency = obs.latency_ms;
        let above = latency > self.threshold_ms;
        let previous = record.state;
        record.last_latency_ms = Some(latency);

        let emit = match record.state {
            TenantState::Normal | TenantState::Degraded => {
                if above {
                    record.consecutive_violations += 1;
                    if record.consecutive_violations >= self.persistence_windows {
                        record.state = TenantState::Violated;
                        true
                    } else {
                        record.state = TenantState::Degraded;
                        false
                    }
                } else {
                    record.reset();
                    false
                }
            }
            // Not acknowledged last cycle: keep asking for a decision while in breach
            TenantState::Violated => {
                if above {
                    true
                } else {
                    record.reset();
                    false
                }
            }
            TenantState::Cooldown => {
                record.cooldown_remaining = record.cooldown_remaining.saturating_sub(1);
                if record.cooldown_remaining > 0 {
                    false
                } else if above {
                    // Keep the tier so the planner escalates instead of restarting
                    record.state = TenantState::Violated;
                    record.consecutive_violations = 1;
                    true
                } else {
                    record.reset();
                    false
                }
            }
        };

        if previous != record.state {
            debug!(
                "Tenant {} {} -> {} (latency {:.2}ms, consecutive {})",
                tenant, previous, record.state, latency, record.consecutive_violations
            );
        }

        emit.then(|| Violation::new(tenant, self.severity(latency), latency, obs.observed_at))
    }
}

/// Owner of every tenant's state machine
#[derive(Debug, Clone)]
pub struct TenantStateTracker {
    policy: DetectionPolicy,
    records: BTreeMap<TenantId, TenantRecord>,
    cycle: u64,
}

impl TenantStateTracker {
    pub fn new(config: &ControllerConfig) -> Self {
        Self::with_policy(DetectionPolicy::from(config))
    }

    /// Build a tracker; persistence and cooldown are raised to at least one observation
    pub fn with_policy(policy: DetectionPolicy) -> Self {
        let policy = DetectionPolicy {
            persistence_windows: policy.persistence_windows.max(1),
            cooldown_observations: policy.cooldown_observations.max(1),
            ..policy
        };
        Self {
            policy,
            records: BTreeMap::new(),
            cycle: 0,
        }
    }

    pub fn policy(&self) -> &DetectionPolicy {
        &self.policy
    }

    /// Number of `update` calls so far
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Feed one cycle of observations and return the tenants awaiting a decision.
    ///
    /// Malformed observations are skipped. When a tenant is observed more than
    /// once the last observation wins. Violations are ordered by tenant id.
    pub fn update(&mut self, observations: &[Observation]) -> Vec<Violation> {
        self.cycle += 1;

        let mut latest: BTreeMap<TenantId, &Observation> = BTreeMap::new();
        for obs in observations {
            if let Err(e) = obs.validate() {
                warn!("Skipping observation for tenant {}: {}", obs.tenant_id, e);
                continue;
            }
            if latest.insert(obs.tenant_id, obs).is_some() {
                debug!(
                    "Duplicate observation for tenant {} in cycle {}, keeping the last",
                    obs.tenant_id, self.cycle
                );
            }
        }

        let mut violations = Vec::new();
        for (tenant, obs) in latest {
            let record = self.records.entry(tenant).or_default();
            if let Some(violation) = self.policy.advance(tenant, record, obs) {
                info!("Cycle {}: {}", self.cycle, violation);
                violations.push(violation);
            }
        }
        violations
    }

    /// Record the decision for a violated tenant and start its cooldown.
    ///
    /// `tier` is `None` when no action was planned. Accepted at most once per
    /// tenant per cycle and only while the tenant is Violated.
    pub fn acknowledge(
        &mut self,
        tenant: TenantId,
        tier: Option<MitigationTier>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let cycle = self.cycle;
        let cooldown = self.policy.cooldown_observations;
        let record = self
            .records
            .get_mut(&tenant)
            .ok_or_else(|| Error::not_found(format!("tenant {}", tenant)))?;

        if record.last_decision_cycle == Some(cycle) {
            return Err(Error::state(format!(
                "tenant {} already acknowledged in cycle {}",
                tenant, cycle
            )));
        }
        if record.state != TenantState::Violated {
            return Err(Error::state(format!(
                "tenant {} cannot be acknowledged in state {}",
                tenant, record.state
            )));
        }

        record.state = TenantState::Cooldown;
        record.cooldown_remaining = cooldown;
        record.consecutive_violations = 0;
        record.last_tier_applied = record.last_tier_applied.max(tier);
        if tier.is_some() {
            record.last_action_at = Some(at);
        }
        record.failed_actions = 0;
        record.last_decision_cycle = Some(cycle);

        debug!(
            "Tenant {} acknowledged in cycle {}: tier {:?}, cooldown {}",
            tenant, cycle, record.last_tier_applied, cooldown
        );
        Ok(())
    }

    /// Count a failed execution; the tenant stays in its current state
    pub fn record_failure(&mut self, tenant: TenantId) -> Result<u32> {
        let record = self
            .records
            .get_mut(&tenant)
            .ok_or_else(|| Error::not_found(format!("tenant {}", tenant)))?;
        record.failed_actions = record.failed_actions.saturating_add(1);
        Ok(record.failed_actions)
    }

    /// Drop records of tenants that are no longer active; returns how many were removed
    pub fn prune(&mut self, active: &HashSet<TenantId>) -> usize {
        let before = self.records.len();
        self.records.retain(|tenant, _| active.contains(tenant));
        let removed = before - self.records.len();
        if removed > 0 {
            debug!("Pruned {} stale tenant records", removed);
        }
        removed
    }

    pub fn record(&self, tenant: TenantId) -> Option<&TenantRecord> {
        self.records.get(&tenant)
    }

    pub fn summary(&self) -> StateSummary {
        let mut summary = StateSummary::default();
        for record in self.records.values() {
            summary.add(record.state);
        }
        summary
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(
        threshold_ms: f64,
        persistence_windows: u32,
        cooldown_observations: u32,
    ) -> DetectionPolicy {
        DetectionPolicy {
            threshold_ms,
            persistence_windows,
            cooldown_observations,
        }
    }

    fn obs(tenant: u32, latency_ms: f64) -> Observation {
        Observation::new(tenant, latency_ms, Utc::now())
    }

    fn feed(tracker: &mut TenantStateTracker, tenant: u32, latency_ms: f64) -> Vec<Violation> {
        let violations = tracker.update(&[obs(tenant, latency_ms)]);
        if let Some(record) = tracker.record(TenantId(tenant)) {
            record.check_invariants().unwrap();
        }
        violations
    }

    fn state(tracker: &TenantStateTracker, tenant: u32) -> TenantState {
        tracker.record(TenantId(tenant)).unwrap().state
    }

    #[test]
    fn test_violation_on_exactly_the_persistence_cycle() {
        for p in 1..=5u32 {
            let mut tracker = TenantStateTracker::with_policy(policy(100.0, p, 2));
            for cycle in 1..=p {
                let violations = feed(&mut tracker, 1, 120.0);
                if cycle < p {
                    assert!(violations.is_empty(), "p={} cycle={}", p, cycle);
                    assert_eq!(state(&tracker, 1), TenantState::Degraded);
                } else {
                    assert_eq!(violations.len(), 1, "p={}", p);
                    assert_eq!(state(&tracker, 1), TenantState::Violated);
                }
            }
        }
    }

    #[test]
    fn test_single_recovery_clears_degradation() {
        let mut tracker = TenantStateTracker::with_policy(policy(100.0, 3, 2));
        feed(&mut tracker, 1, 150.0);
        feed(&mut tracker, 1, 150.0);
        assert_eq!(tracker.record(TenantId(1)).unwrap().consecutive_violations, 2);

        feed(&mut tracker, 1, 100.0);
        let record = tracker.record(TenantId(1)).unwrap();
        assert_eq!(record.state, TenantState::Normal);
        assert_eq!(record.consecutive_violations, 0);

        // Counting restarts from scratch
        assert!(feed(&mut tracker, 1, 150.0).is_empty());
        assert!(feed(&mut tracker, 1, 150.0).is_empty());
        assert_eq!(feed(&mut tracker, 1, 150.0).len(), 1);
    }

    #[test]
    fn test_scenario_violation_severity() {
        let mut tracker = TenantStateTracker::with_policy(policy(100.0, 3, 2));
        assert!(feed(&mut tracker, 7, 150.0).is_empty());
        assert!(feed(&mut tracker, 7, 150.0).is_empty());
        let violations = feed(&mut tracker, 7, 150.0);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].tenant_id, TenantId(7));
        assert!((violations[0].severity - 0.5).abs() < 1e-9);
        assert!(violations[0].candidate_bullies.is_empty());
    }

    #[test]
    fn test_cooldown_reenters_violated_with_tier_preserved() {
        let mut tracker = TenantStateTracker::with_policy(policy(100.0, 3, 2));
        for _ in 0..3 {
            feed(&mut tracker, 7, 150.0);
        }
        tracker.acknowledge(TenantId(7), Some(MitigationTier::Tier1), Utc::now()).unwrap();
        assert_eq!(state(&tracker, 7), TenantState::Cooldown);
        assert_eq!(tracker.record(TenantId(7)).unwrap().cooldown_remaining, 2);

        assert!(feed(&mut tracker, 7, 150.0).is_empty());
        assert_eq!(tracker.record(TenantId(7)).unwrap().cooldown_remaining, 1);

        let violations = feed(&mut tracker, 7, 150.0);
        assert_eq!(violations.len(), 1);
        let record = tracker.record(TenantId(7)).unwrap();
        assert_eq!(record.state, TenantState::Violated);
        assert_eq!(record.last_tier_applied, Some(MitigationTier::Tier1));
    }

    #[test]
    fn test_cooldown_ignores_latency_until_expiry() {
        let mut tracker = TenantStateTracker::with_policy(policy(100.0, 1, 3));
        feed(&mut tracker, 1, 500.0);
        tracker.acknowledge(TenantId(1), Some(MitigationTier::Tier2), Utc::now()).unwrap();

        let mut remaining = Vec::new();
        for latency in [10.0, 900.0] {
            assert!(feed(&mut tracker, 1, latency).is_empty());
            remaining.push(tracker.record(TenantId(1)).unwrap().cooldown_remaining);
        }
        assert_eq!(remaining, vec![2, 1]);

        // Recovered on the expiry cycle: back to Normal with the tier cleared
        assert!(feed(&mut tracker, 1, 50.0).is_empty());
        let record = tracker.record(TenantId(1)).unwrap();
        assert_eq!(record.state, TenantState::Normal);
        assert_eq!(record.last_tier_applied, None);
        assert!(record.last_action_at.is_some());
    }

    #[test]
    fn test_zero_cooldown_waits_one_observation() {
        let mut tracker = TenantStateTracker::with_policy(policy(100.0, 1, 0));
        assert_eq!(tracker.policy().cooldown_observations, 1);

        feed(&mut tracker, 1, 200.0);
        tracker.acknowledge(TenantId(1), None, Utc::now()).unwrap();
        let record = tracker.record(TenantId(1)).unwrap();
        assert_eq!(record.state, TenantState::Cooldown);
        assert_eq!(record.cooldown_remaining, 1);
        record.check_invariants().unwrap();

        assert_eq!(feed(&mut tracker, 1, 200.0).len(), 1);
        assert_eq!(state(&tracker, 1), TenantState::Violated);
    }

    #[test]
    fn test_unacknowledged_violation_repeats_or_recovers() {
        let mut tracker = TenantStateTracker::with_policy(policy(100.0, 2, 5));
        feed(&mut tracker, 1, 150.0);
        assert_eq!(feed(&mut tracker, 1, 150.0).len(), 1);
        assert_eq!(feed(&mut tracker, 1, 180.0).len(), 1);
        assert_eq!(state(&tracker, 1), TenantState::Violated);

        assert!(feed(&mut tracker, 1, 90.0).is_empty());
        assert_eq!(state(&tracker, 1), TenantState::Normal);
    }

    #[test]
    fn test_acknowledge_rules() {
        let mut tracker = TenantStateTracker::with_policy(policy(100.0, 1, 4));
        assert!(matches!(
            tracker.acknowledge(TenantId(1), None, Utc::now()),
            Err(Error::NotFound(_))
        ));

        feed(&mut tracker, 1, 50.0);
        assert!(matches!(
            tracker.acknowledge(TenantId(1), None, Utc::now()),
            Err(Error::State(_))
        ));

        feed(&mut tracker, 1, 150.0);
        tracker.acknowledge(TenantId(1), None, Utc::now()).unwrap();
        assert!(tracker.acknowledge(TenantId(1), None, Utc::now()).is_err());
        let record = tracker.record(TenantId(1)).unwrap();
        assert_eq!(record.last_decision_cycle, Some(2));
        assert!(record.last_action_at.is_none());
    }

    #[test]
    fn test_tier_never_regresses() {
        let mut tracker = TenantStateTracker::with_policy(policy(100.0, 1, 1));
        feed(&mut tracker, 1, 300.0);
        tracker.acknowledge(TenantId(1), Some(MitigationTier::Tier2), Utc::now()).unwrap();
        assert_eq!(feed(&mut tracker, 1, 300.0).len(), 1);
        tracker.acknowledge(TenantId(1), Some(MitigationTier::Tier1), Utc::now()).unwrap();
        assert_eq!(
            tracker.record(TenantId(1)).unwrap().last_tier_applied,
            Some(MitigationTier::Tier2)
        );
    }

    #[test]
    fn test_failures_leave_state_untouched() {
        let mut tracker = TenantStateTracker::with_policy(policy(100.0, 1, 2));
        feed(&mut tracker, 1, 300.0);
        assert_eq!(tracker.record_failure(TenantId(1)).unwrap(), 1);
        assert_eq!(tracker.record_failure(TenantId(1)).unwrap(), 2);
        assert_eq!(state(&tracker, 1), TenantState::Violated);
        assert!(tracker.record_failure(TenantId(2)).is_err());

        tracker.acknowledge(TenantId(1), Some(MitigationTier::Tier1), Utc::now()).unwrap();
        assert_eq!(tracker.record(TenantId(1)).unwrap().failed_actions, 0);
    }

    #[test]
    fn test_malformed_and_duplicate_observations() {
        let mut tracker = TenantStateTracker::with_policy(policy(100.0, 1, 2));
        let violations = tracker.update(&[
            obs(1, f64::NAN),
            obs(2, -5.0),
            obs(3, 500.0),
            obs(3, 50.0),
            obs(4, f64::INFINITY),
        ]);
        assert!(violations.is_empty());
        assert_eq!(tracker.len(), 1);
        assert_eq!(state(&tracker, 3), TenantState::Normal);
        assert!(tracker.record(TenantId(1)).is_none());
    }

    #[test]
    fn test_violations_sorted_by_tenant() {
        let mut tracker = TenantStateTracker::with_policy(policy(100.0, 1, 2));
        let violations = tracker.update(&[obs(9, 200.0), obs(3, 150.0), obs(5, 120.0)]);
        let ids: Vec<u32> = violations.iter().map(|v| v.tenant_id.pid()).collect();
        assert_eq!(ids, vec![3, 5, 9]);
    }

    #[test]
    fn test_replay_is_deterministic() {
        let latencies = [90.0, 120.0, 130.0, 140.0, 80.0, 150.0, 150.0, 150.0, 150.0, 60.0];
        let run = || {
            let mut tracker = TenantStateTracker::with_policy(policy(100.0, 2, 2));
            let mut states = Vec::new();
            for &latency in &latencies {
                if !tracker.update(&[obs(1, latency)]).is_empty() {
                    tracker
                        .acknowledge(TenantId(1), Some(MitigationTier::Tier1), Utc::now())
                        .unwrap();
                }
                states.push(tracker.record(TenantId(1)).unwrap().state);
            }
            states
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_summary_and_prune() {
        let mut tracker = TenantStateTracker::with_policy(policy(100.0, 2, 2));
        tracker.update(&[obs(1, 50.0), obs(2, 150.0), obs(3, 150.0)]);
        tracker.update(&[obs(3, 150.0)]);
        let summary = tracker.summary();
        assert_eq!((summary.normal, summary.degraded, summary.violated), (1, 1, 1));

        tracker.acknowledge(TenantId(3), None, Utc::now()).unwrap();
        assert!(tracker.record(TenantId(3)).unwrap().is_in_cooldown());

        let active: HashSet<TenantId> = [TenantId(1), TenantId(3)].into_iter().collect();
        assert_eq!(tracker.prune(&active), 1);
        assert_eq!(tracker.len(), 2);
        assert!(tracker.record(TenantId(2)).is_none());
    }
}
