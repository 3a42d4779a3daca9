//! Action executor
//!
//! Wraps an [`ActionSink`] with the guarantees the control loop relies on:
//! - repeated application of the same action to the same target is a no-op
//! - each call finishes within the configured deadline, whatever the sink does
//! - actions touching the same device never run concurrently
//! - failures come back as classified results, never as errors

use chrono::Utc;
use dashmap::DashMap;
use guard_core::{
    ActionErrorKind, ActionResult, ActionSink, DeviceId, ExecutorConfig, IdempotencyKey,
    MitigationAction, TargetKey, TenantId,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Applies mitigation actions through a sink
pub struct ActionExecutor {
    sink: Arc<dyn ActionSink>,
    timeout: Duration,

    /// Last successfully applied key per target
    applied: DashMap<TargetKey, IdempotencyKey>,

    /// One lock per device, held until the sink call has actually finished
    device_locks: DashMap<DeviceId, Arc<Mutex<()>>>,

    counters: Counters,
}

#[derive(Debug, Default)]
struct Counters {
    attempted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    cached: AtomicU64,
    timed_out: AtomicU64,
}

/// Executor statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorStats {
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cached: u64,
    pub timed_out: u64,
}

impl fmt::Display for ExecutorStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "attempted={} succeeded={} failed={} cached={} timed_out={}",
            self.attempted, self.succeeded, self.failed, self.cached, self.timed_out
        )
    }
}

impl ActionExecutor {
    pub fn new(sink: Arc<dyn ActionSink>, config: &ExecutorConfig) -> Self {
        Self::with_timeout(sink, config.action_timeout())
    }

    pub fn with_timeout(sink: Arc<dyn ActionSink>, timeout: Duration) -> Self {
        info!("Action executor using sink '{}' with a {:?} deadline", sink.name(), timeout);
        Self {
            sink,
            timeout,
            applied: DashMap::new(),
            device_locks: DashMap::new(),
            counters: Counters::default(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn sink_name(&self) -> &'static str {
        self.sink.name()
    }

    /// Apply an action, serialized per device and bounded by the deadline.
    ///
    /// Waiting for the device lock counts against the deadline. The sink call
    /// runs on its own task which owns the lock guard, so a sink that never
    /// yields cannot hold the caller past the deadline and the device stays
    /// locked until that call really ends.
    pub async fn apply(&self, action: &MitigationAction) -> ActionResult {
        self.counters.attempted.fetch_add(1, Ordering::Relaxed);
        let deadline = tokio::time::Instant::now() + self.timeout;

        let lock = self
            .device_locks
            .entry(action.device_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = match tokio::time::timeout_at(deadline, lock.lock_owned()).await {
            Ok(guard) => guard,
            Err(_) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Action {} gave up waiting for {} after {:?}",
                    action, action.device_id, self.timeout
                );
                return ActionResult::failed(
                    ActionErrorKind::DeviceBusy,
                    format!("{} still busy with a previous action", action.device_id),
                    Utc::now(),
                );
            }
        };

        let target = action.target_key();
        let already_applied = self
            .applied
            .get(&target)
            .map(|key| *key == action.idempotency_key)
            .unwrap_or(false);
        if already_applied {
            self.counters.cached.fetch_add(1, Ordering::Relaxed);
            debug!("Action {} already applied, skipping sink", action.idempotency_key);
            return ActionResult::cached(Utc::now());
        }

        let sink = Arc::clone(&self.sink);
        let owned = action.clone();
        let mut handle = tokio::spawn(async move {
            let _guard = guard;
            sink.execute(&owned).await
        });

        match tokio::time::timeout_at(deadline, &mut handle).await {
            Ok(Ok(Ok(()))) => {
                self.applied.insert(target, action.idempotency_key);
                self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                info!("Applied {}", action);
                ActionResult::succeeded(Utc::now())
            }
            Ok(Ok(Err(e))) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!("Action {} failed: {}", action, e);
                ActionResult::failed(e.kind, e.message, Utc::now())
            }
            Ok(Err(join_error)) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!("Action {} aborted: {}", action, join_error);
                ActionResult::failed(ActionErrorKind::Unknown, join_error.to_string(), Utc::now())
            }
            Err(_) => {
                handle.abort();
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                warn!("Action {} timed out after {:?}", action, self.timeout);
                ActionResult::failed(
                    ActionErrorKind::Timeout,
                    format!("no response within {:?}", self.timeout),
                    Utc::now(),
                )
            }
        }
    }

    /// Forget what was applied to tenants that are gone; returns how many entries were dropped
    pub fn evict_tenants(&self, tenants: &HashSet<TenantId>) -> usize {
        let before = self.applied.len();
        self.applied
            .retain(|target, _| !matches!(target, TargetKey::Tenant(pid) if tenants.contains(pid)));
        let evicted = before - self.applied.len();
        if evicted > 0 {
            debug!("Evicted {} applied actions of departed tenants", evicted);
        }
        evicted
    }

    /// Drop locks and applied layouts of devices no longer in the inventory.
    ///
    /// A lock still held by a running call is kept until a later pass.
    pub fn retain_devices(&self, devices: &HashSet<DeviceId>) -> usize {
        self.device_locks
            .retain(|device, lock| devices.contains(device) || Arc::strong_count(lock) > 1);
        let before = self.applied.len();
        self.applied.retain(|target, _| match target {
            TargetKey::Device(device) => devices.contains(device),
            _ => true,
        });
        let evicted = before - self.applied.len();
        if evicted > 0 {
            debug!("Evicted {} applied layouts of removed devices", evicted);
        }
        evicted
    }

    /// Targets with a remembered applied action
    pub fn tracked_targets(&self) -> usize {
        self.applied.len()
    }

    /// Devices with a lock allocated
    pub fn tracked_devices(&self) -> usize {
        self.device_locks.len()
    }

    pub fn stats(&self) -> ExecutorStats {
        ExecutorStats {
            attempted: self.counters.attempted.load(Ordering::Relaxed),
            succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            cached: self.counters.cached.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for ActionExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionExecutor")
            .field("sink", &self.sink.name())
            .field("timeout", &self.timeout)
            .field("stats", &self.stats())
            .field("tracked_targets", &self.tracked_targets())
            .field("tracked_devices", &self.tracked_devices())
            .finish()
    }
}
