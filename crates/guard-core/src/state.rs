//! Per-tenant state and violation types

use crate::action::MitigationTier;
use crate::types::{DeviceId, TenantId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Position of a tenant in its violation episode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantState {
    /// Latency within the SLO
    Normal,
    /// Above threshold, not yet for long enough to act
    Degraded,
    /// Persistently above threshold, waiting for a mitigation decision
    Violated,
    /// Holding still after a decision; detection is suppressed
    Cooldown,
}

impl TenantState {
    pub const ALL: [TenantState; 4] = [
        TenantState::Normal,
        TenantState::Degraded,
        TenantState::Violated,
        TenantState::Cooldown,
    ];
}

impl fmt::Display for TenantState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TenantState::Normal => write!(f, "normal"),
            TenantState::Degraded => write!(f, "degraded"),
            TenantState::Violated => write!(f, "violated"),
            TenantState::Cooldown => write!(f, "cooldown"),
        }
    }
}

/// State machine record for one tenant, owned by the tracker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantRecord {
    pub state: TenantState,
    pub consecutive_violations: u32,
    pub cooldown_remaining: u32,
    pub last_tier_applied: Option<MitigationTier>,
    pub last_action_at: Option<DateTime<Utc>>,

    /// Failed executions since the last successful decision in this episode
    pub failed_actions: u32,

    pub last_latency_ms: Option<f64>,

    /// Cycle in which the last decision was committed
    pub last_decision_cycle: Option<u64>,
}

impl TenantRecord {
    pub fn new() -> Self {
        Self {
            state: TenantState::Normal,
            consecutive_violations: 0,
            cooldown_remaining: 0,
            last_tier_applied: None,
            last_action_at: None,
            failed_actions: 0,
            last_latency_ms: None,
            last_decision_cycle: None,
        }
    }

    /// Return to Normal and forget the episode
    pub fn reset(&mut self) {
        self.state = TenantState::Normal;
        self.consecutive_violations = 0;
        self.cooldown_remaining = 0;
        self.last_tier_applied = None;
        self.failed_actions = 0;
    }

    pub fn is_in_cooldown(&self) -> bool {
        self.state == TenantState::Cooldown
    }

    /// Check the record invariants
    pub fn check_invariants(&self) -> crate::Result<()> {
        if self.consecutive_violations > 0
            && !matches!(self.state, TenantState::Degraded | TenantState::Violated)
        {
            return Err(crate::Error::state(format!(
                "{} consecutive violations recorded in state {}",
                self.consecutive_violations, self.state
            )));
        }
        if self.cooldown_remaining > 0 && self.state != TenantState::Cooldown {
            return Err(crate::Error::state(format!(
                "cooldown of {} remaining in state {}",
                self.cooldown_remaining, self.state
            )));
        }
        if self.state == TenantState::Cooldown && self.cooldown_remaining == 0 {
            return Err(crate::Error::state("cooldown with no observations remaining"));
        }
        if self.state == TenantState::Normal && self.last_tier_applied.is_some() {
            return Err(crate::Error::state("tier retained after returning to normal"));
        }
        Ok(())
    }
}

impl Default for TenantRecord {
    fn default() -> Self {
        Self::new()
    }
}

/// A co-resident tenant ranked as a possible source of interference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BullyCandidate {
    pub tenant_id: TenantId,
    pub device_id: DeviceId,
    /// Topology affinity to the victim; lower means closer, infinite when unknown
    pub score: f64,
    pub usage: f64,
}

/// A tenant that crossed its persistence window this cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub tenant_id: TenantId,
    /// Relative overshoot: (latency - threshold) / threshold
    pub severity: f64,
    pub latency_ms: f64,
    pub observed_at: DateTime<Utc>,
    /// Filled in by the scorer; most likely bully first
    pub candidate_bullies: Vec<BullyCandidate>,
}

impl Violation {
    pub fn new(
        tenant_id: TenantId,
        severity: f64,
        latency_ms: f64,
        observed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            tenant_id,
            severity,
            latency_ms,
            observed_at,
            candidate_bullies: Vec::new(),
        }
    }

    pub fn top_candidate(&self) -> Option<&BullyCandidate> {
        self.candidate_bullies.first()
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Violation(tenant={}, latency={:.2}ms, severity={:.2}, candidates={})",
            self.tenant_id,
            self.latency_ms,
            self.severity,
            self.candidate_bullies.len()
        )
    }
}

/// Count of tenants in each state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSummary {
    pub normal: usize,
    pub degraded: usize,
    pub violated: usize,
    pub cooldown: usize,
}

impl StateSummary {
    pub fn add(&mut self, state: TenantState) {
        match state {
            TenantState::Normal => self.normal += 1,
            TenantState::Degraded => self.degraded += 1,
            TenantState::Violated => self.violated += 1,
            TenantState::Cooldown => self.cooldown += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.normal + self.degraded + self.violated + self.cooldown
    }
}

impl fmt::Display for StateSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "normal={} degraded={} violated={} cooldown={}",
            self.normal, self.degraded, self.violated, self.cooldown
        )
    }
}
