//! Mitigation actions and their outcomes

use crate::types::{DeviceId, TenantId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Isolation tier; ordered so that `Tier1 < Tier2`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MitigationTier {
    /// Bandwidth throttling of the bully's cgroup
    Tier1,
    /// Hardware partition reconfiguration of the bully's device
    Tier2,
}

impl MitigationTier {
    /// Tier to use when the previous tier did not resolve the episode
    pub fn escalate(self) -> Self {
        MitigationTier::Tier2
    }

    pub fn as_number(&self) -> u8 {
        match self {
            MitigationTier::Tier1 => 1,
            MitigationTier::Tier2 => 2,
        }
    }
}

impl fmt::Display for MitigationTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tier{}", self.as_number())
    }
}

/// What the action sink should do
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionParameters {
    /// Cap read and write bandwidth of the target's cgroup
    IoLimit { io_limit_mbps: u64 },
    /// Repartition the target's device with the given MIG profile
    MigReconfigure { profile: String },
}

impl fmt::Display for ActionParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionParameters::IoLimit { io_limit_mbps } => {
                write!(f, "io_limit={}MB/s", io_limit_mbps)
            }
            ActionParameters::MigReconfigure { profile } => write!(f, "mig_profile={}", profile),
        }
    }
}

/// Stable digest of (target, tier, parameters)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(u64);

impl IdempotencyKey {
    pub fn compute(
        target_pid: TenantId,
        tier: MitigationTier,
        parameters: &ActionParameters,
    ) -> Self {
        let mut hasher = DefaultHasher::new();
        target_pid.hash(&mut hasher);
        tier.hash(&mut hasher);
        parameters.hash(&mut hasher);
        Self(hasher.finish())
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// What an action is applied to, for idempotency bookkeeping
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetKey {
    Tenant(TenantId),
    Device(DeviceId),
}

/// A concrete, idempotent isolation step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MitigationAction {
    pub tier: MitigationTier,
    pub target_pid: TenantId,
    /// Device the target runs on; the lock scope for execution
    pub device_id: DeviceId,
    pub parameters: ActionParameters,
    pub idempotency_key: IdempotencyKey,
}

impl MitigationAction {
    pub fn new(
        tier: MitigationTier,
        target_pid: TenantId,
        device_id: DeviceId,
        parameters: ActionParameters,
    ) -> Self {
        let idempotency_key = IdempotencyKey::compute(target_pid, tier, &parameters);
        Self {
            tier,
            target_pid,
            device_id,
            parameters,
            idempotency_key,
        }
    }

    /// Cgroup limits belong to a tenant, MIG layouts to a device
    pub fn target_key(&self) -> TargetKey {
        match self.parameters {
            ActionParameters::IoLimit { .. } => TargetKey::Tenant(self.target_pid),
            ActionParameters::MigReconfigure { .. } => TargetKey::Device(self.device_id.clone()),
        }
    }
}

impl fmt::Display for MitigationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} on pid {} ({}): {} [key {}]",
            self.tier, self.target_pid, self.device_id, self.parameters, self.idempotency_key
        )
    }
}

/// Classification of a failed action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionErrorKind {
    PermissionDenied,
    DeviceBusy,
    InvalidProfile,
    Timeout,
    Unknown,
}

impl fmt::Display for ActionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionErrorKind::PermissionDenied => write!(f, "permission_denied"),
            ActionErrorKind::DeviceBusy => write!(f, "device_busy"),
            ActionErrorKind::InvalidProfile => write!(f, "invalid_profile"),
            ActionErrorKind::Timeout => write!(f, "timeout"),
            ActionErrorKind::Unknown => write!(f, "unknown"),
        }
    }
}

/// Failure reported by an action sink
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct SinkError {
    pub kind: ActionErrorKind,
    pub message: String,
}

impl SinkError {
    pub fn new(kind: ActionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Outcome of one executor call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    pub error_kind: Option<ActionErrorKind>,
    pub applied_at: DateTime<Utc>,
    /// Served from the idempotency cache without touching the system
    pub cached: bool,
    pub message: Option<String>,
}

impl ActionResult {
    pub fn succeeded(applied_at: DateTime<Utc>) -> Self {
        Self {
            success: true,
            error_kind: None,
            applied_at,
            cached: false,
            message: None,
        }
    }

    pub fn cached(applied_at: DateTime<Utc>) -> Self {
        Self {
            cached: true,
            ..Self::succeeded(applied_at)
        }
    }

    pub fn failed(
        kind: ActionErrorKind,
        message: impl Into<String>,
        applied_at: DateTime<Utc>,
    ) -> Self {
        Self {
            success: false,
            error_kind: Some(kind),
            applied_at,
            cached: false,
            message: Some(message.into()),
        }
    }
}
