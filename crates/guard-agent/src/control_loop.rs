//! The control loop
//!
//! One owner drives one cycle at a time. Within a cycle, scoring and planning
//! for independent violations run in parallel against an immutable topology
//! snapshot; the resulting decisions are then executed and committed to the
//! tracker sequentially, so every tenant changes state at most once per cycle.
//!
//! Tenants that stop appearing in both the observations and the resident
//! lists are forgotten after `stale_after_cycles` cycles, together with the
//! executor's memory of what was applied to them.

use crate::{AgentConfig, AgentError, Result};
use chrono::{DateTime, Utc};
use guard_adapter::{
    ActionExecutor, CommandActionSink, DryRunSink, FileTopologySource, MetricsDirSource,
    PmonProcessSource,
};
use guard_core::{
    ActionResult, ActionSink, CoResident, CycleSample, DeviceId, GpuProcess, GuardConfig,
    MitigationAction, MitigationTier, ObservationSource, ProcessSource, StateSummary, TenantId,
    TopologySource, Violation,
};
use guard_engine::{MitigationPlanner, PlacementScorer, TenantStateTracker, TopologySnapshot};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// An executed action and its outcome
#[derive(Debug, Clone, Serialize)]
pub struct ActionOutcome {
    pub victim: TenantId,
    pub action: MitigationAction,
    pub result: ActionResult,
}

/// What happened in one cycle
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub cycle: u64,
    pub topology_generation: u64,
    pub observed: usize,

    /// Violations decided this cycle, worst first, with ranked candidates
    pub violations: Vec<Violation>,

    pub actions: Vec<ActionOutcome>,

    /// Victims for which no action could be planned
    pub unplanned: Vec<TenantId>,

    /// Victims left for a later cycle by the action budget
    pub deferred: Vec<TenantId>,

    /// Tenants forgotten this cycle after being absent too long
    pub pruned: Vec<TenantId>,

    /// Set when the cycle was skipped
    pub skipped: Option<String>,

    pub summary: StateSummary,
}

impl CycleReport {
    pub fn failed_actions(&self) -> usize {
        self.actions.iter().filter(|a| !a.result.success).count()
    }
}

impl fmt::Display for CycleReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(reason) = &self.skipped {
            return write!(f, "cycle {} skipped: {}", self.cycle, reason);
        }
        write!(
            f,
            "cycle {}: observed={} violations={} actions={} failed={} unplanned={} deferred={} pruned={} [{}]",
            self.cycle,
            self.observed,
            self.violations.len(),
            self.actions.len(),
            self.failed_actions(),
            self.unplanned.len(),
            self.deferred.len(),
            self.pruned.len(),
            self.summary
        )
    }
}

/// Drives detection, scoring, planning and execution once per poll interval
pub struct ControlLoop {
    config: GuardConfig,
    topology_source: Arc<dyn TopologySource>,
    observations: Arc<dyn ObservationSource>,
    processes: Option<Arc<dyn ProcessSource>>,
    executor: ActionExecutor,
    tracker: TenantStateTracker,
    scorer: PlacementScorer,
    planner: MitigationPlanner,
    snapshot: Arc<TopologySnapshot>,
    /// Last cycle each tenant was reported in
    last_seen: HashMap<TenantId, u64>,
    cycle: u64,
}

impl ControlLoop {
    /// Build the loop; fails if the configuration is invalid or the first
    /// topology snapshot cannot be built
    pub fn new(
        config: GuardConfig,
        topology_source: Arc<dyn TopologySource>,
        observations: Arc<dyn ObservationSource>,
        sink: Arc<dyn ActionSink>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| AgentError::Config(e.to_string()))?;

        let snapshot = TopologySnapshot::build(topology_source.as_ref(), 1)
            .map_err(|e| AgentError::Startup(format!("initial topology discovery failed: {}", e)))?;

        Ok(Self {
            executor: ActionExecutor::new(sink, &config.executor),
            tracker: TenantStateTracker::new(&config.controller),
            scorer: PlacementScorer::from_config(&config.placement),
            planner: MitigationPlanner::new(config.placement.clone()),
            snapshot: Arc::new(snapshot),
            topology_source,
            observations,
            processes: None,
            config,
            last_seen: HashMap::new(),
            cycle: 0,
        })
    }

    /// Also take residents from driver-level process discovery
    pub fn with_process_source(mut self, source: Arc<dyn ProcessSource>) -> Self {
        info!("GPU process discovery via {}", source.name());
        self.processes = Some(source);
        self
    }

    /// Build the loop from the daemon configuration using the host adapters
    pub fn from_config(config: &AgentConfig) -> Result<Self> {
        let sources = &config.sources;
        let topology: Arc<dyn TopologySource> = Arc::new(FileTopologySource::new(
            &sources.topology_file,
            &sources.sysfs_node_dir,
        ));
        let observations: Arc<dyn ObservationSource> =
            Arc::new(MetricsDirSource::new(&sources.metrics_dir));
        let sink: Arc<dyn ActionSink> = if sources.dry_run {
            info!("Dry-run mode: actions will be logged, not applied");
            Arc::new(DryRunSink::new())
        } else {
            Arc::new(CommandActionSink::new(sources.command.clone()))
        };

        let control = Self::new(config.guard.clone(), topology, observations, sink)?;
        if !sources.process_discovery {
            return Ok(control);
        }
        let pmon = PmonProcessSource::new(&sources.command.nvidia_smi)
            .with_timeout(Duration::from_millis(sources.process_discovery_timeout_ms));
        Ok(control.with_process_source(Arc::new(pmon)))
    }

    pub fn tracker(&self) -> &TenantStateTracker {
        &self.tracker
    }

    pub fn executor(&self) -> &ActionExecutor {
        &self.executor
    }

    pub fn snapshot(&self) -> &Arc<TopologySnapshot> {
        &self.snapshot
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Run cycles every poll interval until `shutdown` resolves
    pub async fn run<F>(&mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let interval = self.config.controller.poll_interval();
        info!("Control loop started, polling every {:?}", interval);

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, stopping control loop");
                    break;
                }
                _ = ticker.tick() => {
                    let report = self.run_cycle().await;
                    if report.violations.is_empty() && report.skipped.is_none() {
                        debug!("{}", report);
                    } else {
                        info!("{}", report);
                    }
                }
            }
        }

        info!(
            "Control loop stopped after {} cycles; executor {}",
            self.cycle,
            self.executor.stats()
        );
        Ok(())
    }

    /// Run exactly one cycle
    pub async fn run_cycle(&mut self) -> CycleReport {
        self.cycle += 1;
        self.refresh_topology_if_due();

        let mut report = CycleReport {
            cycle: self.cycle,
            topology_generation: self.snapshot.generation(),
            ..CycleReport::default()
        };

        let mut sample = match self.observations.collect().await {
            Ok(sample) => sample,
            Err(e) => {
                warn!(
                    "Cycle {}: observation collection failed ({}), skipping: {}",
                    self.cycle,
                    e.category(),
                    e
                );
                report.skipped = Some(e.to_string());
                report.summary = self.tracker.summary();
                return report;
            }
        };
        report.observed = sample.observations.len();

        if let Some(source) = &self.processes {
            match source.processes().await {
                Ok(processes) => {
                    let added = merge_processes(&mut sample.residents, processes, &self.snapshot);
                    debug!("Cycle {}: {} residents added by {}", self.cycle, added, source.name());
                }
                Err(e) => warn!(
                    "Cycle {}: {} failed ({}), using reported residents only: {}",
                    self.cycle,
                    source.name(),
                    e.category(),
                    e
                ),
            }
        }
        report.pruned = self.forget_absent(&sample);

        let mut violations = self.tracker.update(&sample.observations);
        violations.sort_by(|a, b| {
            b.severity
                .total_cmp(&a.severity)
                .then_with(|| a.tenant_id.cmp(&b.tenant_id))
        });

        let budget = self.config.controller.max_actions_per_cycle;
        if budget > 0 && violations.len() > budget {
            report.deferred = violations.split_off(budget).iter().map(|v| v.tenant_id).collect();
            info!(
                "Cycle {}: action budget {} reached, deferring {} violations",
                self.cycle,
                budget,
                report.deferred.len()
            );
        }

        let decisions = self.decide(violations, &sample.residents);

        for (violation, plan) in decisions {
            let victim = violation.tenant_id;
            match plan {
                None => {
                    self.commit(victim, None, Utc::now());
                    report.unplanned.push(victim);
                }
                Some(action) => {
                    let result = self.executor.apply(&action).await;
                    if result.success {
                        self.commit(victim, Some(action.tier), result.applied_at);
                    } else {
                        match self.tracker.record_failure(victim) {
                            Ok(failures) => warn!(
                                "Mitigation for tenant {} failed ({} in this episode): {:?}",
                                victim, failures, result.error_kind
                            ),
                            Err(e) => warn!("Cannot record failure for tenant {}: {}", victim, e),
                        }
                    }
                    report.actions.push(ActionOutcome { victim, action, result });
                }
            }
            report.violations.push(violation);
        }

        report.summary = self.tracker.summary();
        report
    }

    /// Score and plan every violation in parallel; no state is touched here
    fn decide(
        &self,
        violations: Vec<Violation>,
        residents: &[CoResident],
    ) -> Vec<(Violation, Option<MitigationAction>)> {
        let tracker = &self.tracker;
        let scorer = &self.scorer;
        let planner = &self.planner;
        let snapshot = self.snapshot.as_ref();

        violations
            .into_par_iter()
            .map(|mut violation| {
                scorer.rank_violation(&mut violation, snapshot, residents);
                let plan = tracker
                    .record(violation.tenant_id)
                    .and_then(|record| planner.plan(&violation, record, snapshot));
                (violation, plan)
            })
            .collect()
    }

    fn commit(&mut self, victim: TenantId, tier: Option<MitigationTier>, at: DateTime<Utc>) {
        if let Err(e) = self.tracker.acknowledge(victim, tier, at) {
            warn!("Cannot acknowledge decision for tenant {}: {}", victim, e);
        }
    }

    /// Record who was reported this cycle and drop tenants absent for too long
    fn forget_absent(&mut self, sample: &CycleSample) -> Vec<TenantId> {
        let after = self.config.controller.stale_after_cycles;
        if after == 0 {
            return Vec::new();
        }

        let cycle = self.cycle;
        let reported = sample
            .observations
            .iter()
            .map(|o| o.tenant_id)
            .chain(sample.residents.iter().map(|r| r.tenant_id));
        for tenant in reported {
            self.last_seen.insert(tenant, cycle);
        }

        let mut expired: Vec<TenantId> = self
            .last_seen
            .iter()
            .filter(|(_, seen)| cycle - **seen >= after)
            .map(|(tenant, _)| *tenant)
            .collect();
        if expired.is_empty() {
            return expired;
        }
        expired.sort();

        for tenant in &expired {
            self.last_seen.remove(tenant);
        }
        let active: HashSet<TenantId> = self.last_seen.keys().copied().collect();
        let gone: HashSet<TenantId> = expired.iter().copied().collect();
        let records = self.tracker.prune(&active);
        let evicted = self.executor.evict_tenants(&gone);
        info!(
            "Cycle {}: forgot {} tenants absent for {} cycles ({} records, {} applied actions)",
            cycle,
            expired.len(),
            after,
            records,
            evicted
        );
        expired
    }

    fn refresh_topology_if_due(&mut self) {
        let every = self.config.controller.topology_refresh_cycles;
        if every == 0 || self.cycle <= 1 || (self.cycle - 1) % every != 0 {
            return;
        }

        let generation = self.snapshot.generation() + 1;
        match TopologySnapshot::build(self.topology_source.as_ref(), generation) {
            Ok(snapshot) => {
                let devices: HashSet<DeviceId> =
                    snapshot.devices().map(|d| d.device_id.clone()).collect();
                let evicted = self.executor.retain_devices(&devices);
                if evicted > 0 {
                    info!(
                        "Topology generation {} dropped {} applied device layouts",
                        generation, evicted
                    );
                }
                self.snapshot = Arc::new(snapshot);
            }
            Err(e) => warn!(
                "Topology refresh failed, keeping generation {}: {}",
                self.snapshot.generation(),
                e
            ),
        }
    }
}

/// Add discovered processes as residents.
///
/// A tenant already reported on the same device keeps its reported usage.
/// Processes on GPU indexes missing from the snapshot are dropped.
fn merge_processes(
    residents: &mut Vec<CoResident>,
    processes: Vec<GpuProcess>,
    snapshot: &TopologySnapshot,
) -> usize {
    let mut known: HashSet<(TenantId, DeviceId)> = residents
        .iter()
        .map(|r| (r.tenant_id, r.device_id.clone()))
        .collect();

    let mut added = 0;
    for process in processes {
        let Some(device) = snapshot.device_by_index(process.gpu_index) else {
            debug!("Process {} runs on unknown GPU index {}", process.tenant_id, process.gpu_index);
            continue;
        };
        if known.insert((process.tenant_id, device.device_id.clone())) {
            residents.push(CoResident::new(
                process.tenant_id,
                device.device_id.clone(),
                process.resource_usage(),
            ));
            added += 1;
        }
    }
    added
}

impl fmt::Debug for ControlLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlLoop")
            .field("cycle", &self.cycle)
            .field("topology_generation", &self.snapshot.generation())
            .field("tenants", &self.tracker.len())
            .field("tracked", &self.last_seen.len())
            .field("executor", &self.executor)
            .finish()
    }
}
