//! Mock capability implementations for testing

use async_trait::async_trait;
use guard_core::{
    ActionErrorKind, ActionSink, CycleSample, Error, GpuDevice, GpuProcess, MigProfile,
    MitigationAction, ObservationSource, ProcessSource, Result, SinkError, TopologySource,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Action sink that records calls instead of touching the host
#[derive(Debug, Default)]
pub struct MockActionSink {
    calls: Mutex<Vec<MitigationAction>>,
    failure: Mutex<Option<SinkError>>,
    delay: Option<Duration>,
    blocking: Mutex<Option<Duration>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockActionSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every call with the given classification
    pub fn with_failure(self, kind: ActionErrorKind, message: impl Into<String>) -> Self {
        *lock(&self.failure) = Some(SinkError::new(kind, message));
        self
    }

    /// Sleep before answering each call
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Block the worker thread before answering, like a sink stuck in a syscall
    pub fn with_blocking(self, duration: Duration) -> Self {
        self.set_blocking(Some(duration));
        self
    }

    pub fn set_blocking(&self, duration: Option<Duration>) {
        *lock(&self.blocking) = duration;
    }

    pub fn set_failure(&self, kind: ActionErrorKind, message: impl Into<String>) {
        *lock(&self.failure) = Some(SinkError::new(kind, message));
    }

    pub fn clear_failure(&self) {
        *lock(&self.failure) = None;
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    pub fn calls(&self) -> Vec<MitigationAction> {
        lock(&self.calls).clone()
    }

    /// Highest number of calls observed running at once
    pub fn max_concurrency(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ActionSink for MockActionSink {
    async fn execute(&self, action: &MitigationAction) -> std::result::Result<(), SinkError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _in_flight = InFlight(&self.in_flight);
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        lock(&self.calls).push(action.clone());
        debug!("Mock sink received {}", action);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let blocking = *lock(&self.blocking);
        if let Some(duration) = blocking {
            std::thread::sleep(duration);
        }

        match lock(&self.failure).clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

/// Replaceable topology with an optional failure switch
#[derive(Debug, Default)]
pub struct MockTopologySource {
    devices: Mutex<Vec<GpuDevice>>,
    distances: HashMap<(u32, u32), u32>,
    failing: AtomicBool,
    discover_calls: AtomicUsize,
}

impl MockTopologySource {
    pub fn new(devices: Vec<GpuDevice>) -> Self {
        Self {
            devices: Mutex::new(devices),
            ..Self::default()
        }
    }

    /// Two NUMA nodes with two MIG-capable GPUs each; GPUs on one node share a switch
    pub fn two_node() -> Self {
        let profiles = vec![
            MigProfile::new("1g.10gb", 1, 10_240),
            MigProfile::new("3g.40gb", 3, 40_960),
        ];
        let gpu = |id: &str, index: u32, node: u32, path: [&str; 3]| {
            let path = path.iter().map(|hop| hop.to_string()).collect();
            GpuDevice::new(id, index, node, path).with_available_profiles(profiles.clone())
        };
        Self::new(vec![
            gpu("GPU-0", 0, 0, ["0000:00", "0000:10", "0000:11"]),
            gpu("GPU-1", 1, 0, ["0000:00", "0000:10", "0000:12"]),
            gpu("GPU-2", 2, 1, ["0000:80", "0000:90", "0000:91"]),
            gpu("GPU-3", 3, 1, ["0000:80", "0000:90", "0000:92"]),
        ])
        .with_distance(0, 1, 21)
    }

    /// Record a symmetric NUMA distance
    pub fn with_distance(mut self, a: u32, b: u32, distance: u32) -> Self {
        self.distances.insert((a, b), distance);
        self.distances.insert((b, a), distance);
        self
    }

    /// Replace the inventory returned by later discoveries
    pub fn set_devices(&self, devices: Vec<GpuDevice>) {
        *lock(&self.devices) = devices;
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn discover_calls(&self) -> usize {
        self.discover_calls.load(Ordering::SeqCst)
    }
}

impl TopologySource for MockTopologySource {
    fn discover(&self) -> Result<Vec<GpuDevice>> {
        self.discover_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::topology("mock topology source unavailable"));
        }
        Ok(lock(&self.devices).clone())
    }

    fn numa_distance(&self, from: u32, to: u32) -> Option<u32> {
        if from == to {
            return Some(10);
        }
        self.distances.get(&(from, to)).copied()
    }
}

/// Observation source replaying a script, one entry per cycle.
///
/// `None` entries fail the collection. Once the script is exhausted the last
/// successful sample is repeated.
#[derive(Debug, Default)]
pub struct MockObservationSource {
    script: Mutex<VecDeque<Option<CycleSample>>>,
    last: Mutex<CycleSample>,
    collect_calls: AtomicUsize,
}

impl MockObservationSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, sample: CycleSample) {
        lock(&self.script).push_back(Some(sample));
    }

    pub fn push_failure(&self) {
        lock(&self.script).push_back(None);
    }

    pub fn collect_calls(&self) -> usize {
        self.collect_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObservationSource for MockObservationSource {
    async fn collect(&self) -> Result<CycleSample> {
        self.collect_calls.fetch_add(1, Ordering::SeqCst);
        let next = lock(&self.script).pop_front();
        match next {
            Some(Some(sample)) => {
                *lock(&self.last) = sample.clone();
                Ok(sample)
            }
            Some(None) => Err(Error::invalid_observation("mock observation source failure")),
            None => Ok(lock(&self.last).clone()),
        }
    }
}

/// Process source returning a fixed list, with an optional failure switch
#[derive(Debug, Default)]
pub struct MockProcessSource {
    processes: Mutex<Vec<GpuProcess>>,
    failing: AtomicBool,
}

impl MockProcessSource {
    pub fn new(processes: Vec<GpuProcess>) -> Self {
        Self {
            processes: Mutex::new(processes),
            ..Self::default()
        }
    }

    pub fn set_processes(&self, processes: Vec<GpuProcess>) {
        *lock(&self.processes) = processes;
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProcessSource for MockProcessSource {
    async fn processes(&self) -> Result<Vec<GpuProcess>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Other(anyhow::anyhow!("mock process source unavailable")));
        }
        Ok(lock(&self.processes).clone())
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use guard_core::{Observation, TenantId};

    #[tokio::test]
    async fn test_observation_script_replay() {
        let source = MockObservationSource::new();
        let sample = CycleSample {
            observations: vec![Observation::new(1, 150.0, Utc::now())],
            residents: vec![],
        };
        source.push(sample.clone());
        source.push_failure();

        assert_eq!(source.collect().await.unwrap(), sample);
        assert!(source.collect().await.is_err());
        assert_eq!(source.collect().await.unwrap().observations[0].tenant_id, TenantId(1));
        assert_eq!(source.collect_calls(), 3);
    }

    #[test]
    fn test_topology_switch() {
        let source = MockTopologySource::two_node();
        assert_eq!(source.discover().unwrap().len(), 4);
        assert_eq!(source.numa_distance(1, 0), Some(21));

        source.set_failing(true);
        assert!(source.discover().is_err());
        assert_eq!(source.discover_calls(), 2);

        source.set_failing(false);
        source.set_devices(Vec::new());
        assert!(source.discover().unwrap().is_empty());
    }
}
