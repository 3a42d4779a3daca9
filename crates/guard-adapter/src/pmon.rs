//! GPU process discovery through `nvidia-smi pmon`
//!
//! One `pmon -c 1 -s um` sample lists every compute process per GPU with its
//! SM and memory utilization. Tenants that never write a metric file still
//! show up here, so they can be ranked as neighbors.

use crate::AdapterError;
use async_trait::async_trait;
use guard_core::{GpuProcess, ProcessSource, TenantId};
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

const PMON_ARGS: [&str; 5] = ["pmon", "-c", "1", "-s", "um"];

/// pmon samples for about a second before printing
pub const DEFAULT_PMON_TIMEOUT: Duration = Duration::from_secs(5);

/// Lists GPU processes by running `nvidia-smi pmon` once per call
#[derive(Debug, Clone)]
pub struct PmonProcessSource {
    nvidia_smi: PathBuf,
    timeout: Duration,
}

impl PmonProcessSource {
    pub fn new(nvidia_smi: impl Into<PathBuf>) -> Self {
        Self {
            nvidia_smi: nvidia_smi.into(),
            timeout: DEFAULT_PMON_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn sample(&self) -> crate::Result<String> {
        debug!("Running {} {}", self.nvidia_smi.display(), PMON_ARGS.join(" "));
        let run = Command::new(&self.nvidia_smi)
            .args(PMON_ARGS)
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, run).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(AdapterError::Command(format!(
                    "failed to run {}: {}",
                    self.nvidia_smi.display(),
                    e
                )))
            }
            Err(_) => {
                return Err(AdapterError::Command(format!(
                    "nvidia-smi pmon gave no sample within {:?}",
                    self.timeout
                )))
            }
        };

        if !output.status.success() {
            return Err(AdapterError::Command(format!(
                "nvidia-smi pmon exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl ProcessSource for PmonProcessSource {
    async fn processes(&self) -> guard_core::Result<Vec<GpuProcess>> {
        let stdout = self.sample().await?;
        let processes = parse_pmon(&stdout);
        debug!("pmon reported {} GPU processes", processes.len());
        Ok(processes)
    }

    fn name(&self) -> &'static str {
        "nvidia-smi-pmon"
    }
}

/// Column positions, taken from the `# gpu pid type ...` header when present
#[derive(Debug, Clone, Copy, PartialEq)]
struct PmonColumns {
    gpu: usize,
    pid: usize,
    sm: Option<usize>,
    mem: Option<usize>,
    command: Option<usize>,
}

impl Default for PmonColumns {
    fn default() -> Self {
        Self {
            gpu: 0,
            pid: 1,
            sm: Some(3),
            mem: Some(4),
            command: None,
        }
    }
}

impl PmonColumns {
    /// Only the name header qualifies; the units line (`# Idx # C/G ...`) does not
    fn from_header(header: &str) -> Option<Self> {
        let names: Vec<&str> = header.split_whitespace().collect();
        let position = |name: &str| names.iter().position(|n| n.eq_ignore_ascii_case(name));
        Some(Self {
            gpu: position("gpu")?,
            pid: position("pid")?,
            sm: position("sm"),
            mem: position("mem"),
            command: position("command"),
        })
    }

    fn process(&self, fields: &[&str]) -> Option<GpuProcess> {
        let gpu_index = fields.get(self.gpu)?.parse::<u32>().ok()?;
        // Idle GPUs get a row of dashes
        let pid = fields.get(self.pid)?.parse::<u32>().ok()?;
        let percent = |column: Option<usize>| {
            column
                .and_then(|i| fields.get(i))
                .and_then(|value| value.parse::<f64>().ok())
        };
        let command = match self.command {
            Some(i) => fields.get(i..).map(|rest| rest.join(" ")).unwrap_or_default(),
            None => fields.last().map(|s| s.to_string()).unwrap_or_default(),
        };

        Some(GpuProcess {
            tenant_id: TenantId(pid),
            gpu_index,
            sm_percent: percent(self.sm),
            mem_percent: percent(self.mem),
            command,
        })
    }
}

/// Parse the text output of `nvidia-smi pmon`
pub fn parse_pmon(output: &str) -> Vec<GpuProcess> {
    let mut columns = PmonColumns::default();
    let mut processes = Vec::new();

    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(header) = line.strip_prefix('#') {
            if let Some(found) = PmonColumns::from_header(header) {
                columns = found;
            }
            continue;
        }

        let fields: Vec<&str> = line.split_whitespace().collect();
        match columns.process(&fields) {
            Some(process) => processes.push(process),
            None => debug!("Skipping pmon row without a process: {}", line),
        }
    }
    processes
}
