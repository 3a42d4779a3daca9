//! Action sink that applies mitigations to the host
//!
//! Tier 1 bandwidth caps are written to the target's cgroup v2 `io.max`.
//! Tier 2 repartitioning is delegated to `nvidia-smi`.

use async_trait::async_trait;
use guard_core::{
    ActionErrorKind, ActionParameters, ActionSink, DeviceId, MitigationAction, SinkError, TenantId,
};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

const BYTES_PER_MB: u64 = 1024 * 1024;
const EBUSY: i32 = 16;

/// Host paths used by the command sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandSinkConfig {
    /// Mount point of the cgroup v2 hierarchy
    pub cgroup_root: PathBuf,

    /// procfs mount point
    pub proc_root: PathBuf,

    /// `nvidia-smi` binary
    pub nvidia_smi: PathBuf,

    /// Block devices to cap as `MAJ:MIN`; discovered from `/proc/partitions` when empty
    pub block_devices: Vec<String>,
}

impl Default for CommandSinkConfig {
    fn default() -> Self {
        Self {
            cgroup_root: PathBuf::from("/sys/fs/cgroup"),
            proc_root: PathBuf::from("/proc"),
            nvidia_smi: PathBuf::from("nvidia-smi"),
            block_devices: Vec::new(),
        }
    }
}

/// Applies actions with cgroup writes and `nvidia-smi`
#[derive(Debug, Clone)]
pub struct CommandActionSink {
    config: CommandSinkConfig,
}

impl CommandActionSink {
    pub fn new(config: CommandSinkConfig) -> Self {
        Self { config }
    }

    /// Cap read and write bandwidth of every block device for the tenant's cgroup
    async fn apply_io_limit(&self, pid: TenantId, io_limit_mbps: u64) -> Result<(), SinkError> {
        let cgroup = self.cgroup_of(pid).await?;
        let io_max = self
            .config
            .cgroup_root
            .join(cgroup.trim_start_matches('/'))
            .join("io.max");

        let devices = self.block_devices().await?;
        if devices.is_empty() {
            return Err(SinkError::new(ActionErrorKind::Unknown, "no block devices to limit"));
        }

        let bytes = io_limit_mbps.saturating_mul(BYTES_PER_MB);
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&io_max)
            .await
            .map_err(|e| io_failure(&io_max, e))?;
        // io.max takes one device per write
        for device in &devices {
            let line = format!("{} rbps={} wbps={}\n", device, bytes, bytes);
            file.write_all(line.as_bytes())
                .await
                .map_err(|e| io_failure(&io_max, e))?;
        }
        file.flush().await.map_err(|e| io_failure(&io_max, e))?;

        info!(
            "Limited pid {} to {} MB/s on {} block devices via {}",
            pid,
            io_limit_mbps,
            devices.len(),
            io_max.display()
        );
        Ok(())
    }

    /// Enable MIG mode on the device and create a compute instance with the profile
    async fn apply_mig_profile(&self, device: &DeviceId, profile: &str) -> Result<(), SinkError> {
        self.nvidia_smi(&["-i", device.as_str(), "-mig", "1"]).await?;
        self.nvidia_smi(&["mig", "-i", device.as_str(), "-cgi", profile, "-C"])
            .await?;
        info!("Reconfigured {} with MIG profile {}", device, profile);
        Ok(())
    }

    async fn nvidia_smi(&self, args: &[&str]) -> Result<(), SinkError> {
        debug!("Running {} {}", self.config.nvidia_smi.display(), args.join(" "));
        let output = Command::new(&self.config.nvidia_smi)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                SinkError::new(
                    classify_io_error(&e),
                    format!("failed to run {}: {}", self.config.nvidia_smi.display(), e),
                )
            })?;

        if output.status.success() {
            return Ok(());
        }

        Err(command_failure(
            args,
            &output.status.to_string(),
            &String::from_utf8_lossy(&output.stderr),
            &String::from_utf8_lossy(&output.stdout),
        ))
    }

    async fn cgroup_of(&self, pid: TenantId) -> Result<String, SinkError> {
        let path = self.config.proc_root.join(pid.pid().to_string()).join("cgroup");
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| io_failure(&path, e))?;
        parse_unified_cgroup(&content).ok_or_else(|| {
            SinkError::new(
                ActionErrorKind::Unknown,
                format!("pid {} is not in a cgroup v2 hierarchy", pid),
            )
        })
    }

    async fn block_devices(&self) -> Result<Vec<String>, SinkError> {
        if !self.config.block_devices.is_empty() {
            return Ok(self.config.block_devices.clone());
        }
        let path = self.config.proc_root.join("partitions");
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| io_failure(&path, e))?;
        Ok(parse_partitions(&content))
    }
}

#[async_trait]
impl ActionSink for CommandActionSink {
    async fn execute(&self, action: &MitigationAction) -> Result<(), SinkError> {
        match &action.parameters {
            ActionParameters::IoLimit { io_limit_mbps } => {
                self.apply_io_limit(action.target_pid, *io_limit_mbps).await
            }
            ActionParameters::MigReconfigure { profile } => {
                self.apply_mig_profile(&action.device_id, profile).await
            }
        }
    }

    fn name(&self) -> &'static str {
        "command"
    }
}

/// Path of the unified (`0::`) hierarchy from a `/proc/<pid>/cgroup` file
fn parse_unified_cgroup(content: &str) -> Option<String> {
    content
        .lines()
        .find_map(|line| line.strip_prefix("0::"))
        .map(|path| path.trim().to_string())
}

/// Whole disks from `/proc/partitions` as `MAJ:MIN`, skipping partitions and virtual devices
fn parse_partitions(content: &str) -> Vec<String> {
    content
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() != 4
                || fields[0].parse::<u32>().is_err()
                || fields[1].parse::<u32>().is_err()
            {
                return None;
            }
            let name = fields[3];
            if ["loop", "ram", "zram"].iter().any(|p| name.starts_with(p)) || is_partition(name) {
                return None;
            }
            Some(format!("{}:{}", fields[0], fields[1]))
        })
        .collect()
}

fn is_partition(name: &str) -> bool {
    if name.starts_with("nvme") || name.starts_with("mmcblk") {
        // nvme0n1p2, mmcblk0p1
        return name
            .rsplit_once('p')
            .map(|(head, tail)| {
                let numbered = !tail.is_empty() && tail.chars().all(|c| c.is_ascii_digit());
                numbered && head.chars().last().map_or(false, |c| c.is_ascii_digit())
            })
            .unwrap_or(false);
    }
    name.chars().last().map_or(false, |c| c.is_ascii_digit())
}

/// Failure of an `nvidia-smi` run, classified on what the tool printed.
///
/// Arguments only go into the message; a profile or device name must not
/// decide the classification.
fn command_failure(args: &[&str], status: &str, stderr: &str, stdout: &str) -> SinkError {
    let stderr = stderr.trim();
    let output = if stderr.is_empty() { stdout.trim() } else { stderr };
    let message = format!("nvidia-smi {} exited with {}: {}", args.join(" "), status, output);
    SinkError::new(classify_failure(output), message)
}

fn io_failure(path: &Path, err: io::Error) -> SinkError {
    SinkError::new(classify_io_error(&err), format!("{}: {}", path.display(), err))
}

fn classify_io_error(err: &io::Error) -> ActionErrorKind {
    if err.kind() == io::ErrorKind::PermissionDenied {
        return ActionErrorKind::PermissionDenied;
    }
    if err.raw_os_error() == Some(EBUSY) {
        return ActionErrorKind::DeviceBusy;
    }
    classify_failure(&err.to_string())
}

/// Classify a failure message from a host command
pub fn classify_failure(message: &str) -> ActionErrorKind {
    let message = message.to_lowercase();
    if message.contains("permission") || message.contains("not permitted") {
        ActionErrorKind::PermissionDenied
    } else if message.contains("busy") || message.contains("in use") {
        ActionErrorKind::DeviceBusy
    } else if message.contains("invalid") || message.contains("profile") {
        ActionErrorKind::InvalidProfile
    } else {
        ActionErrorKind::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use guard_core::MitigationTier;
    use tempfile::TempDir;

    struct Host {
        _dir: TempDir,
        config: CommandSinkConfig,
        io_max: PathBuf,
    }

    fn fake_host(pid: u32) -> Host {
        let dir = TempDir::new().unwrap();
        let proc_root = dir.path().join("proc");
        let cgroup_root = dir.path().join("cgroup");
        std::fs::create_dir_all(proc_root.join(pid.to_string())).unwrap();
        std::fs::write(
            proc_root.join(pid.to_string()).join("cgroup"),
            "0::/tenants/job-7\n",
        )
        .unwrap();
        std::fs::write(
            proc_root.join("partitions"),
            concat!(
                "major minor  #blocks  name\n\n",
                " 259        0  976762584 nvme0n1\n",
                " 259        1     524288 nvme0n1p1\n",
                "   8        0  488386584 sda\n",
                "   8        1  488385536 sda1\n",
                "   7        0      65536 loop0\n",
            ),
        )
        .unwrap();
        let cgroup_dir = cgroup_root.join("tenants").join("job-7");
        std::fs::create_dir_all(&cgroup_dir).unwrap();
        let io_max = cgroup_dir.join("io.max");
        std::fs::write(&io_max, "").unwrap();

        Host {
            _dir: dir,
            config: CommandSinkConfig {
                cgroup_root,
                proc_root,
                nvidia_smi: PathBuf::from("/nonexistent/nvidia-smi"),
                block_devices: Vec::new(),
            },
            io_max,
        }
    }

    fn io_action(pid: u32, mbps: u64) -> MitigationAction {
        MitigationAction::new(
            MitigationTier::Tier1,
            TenantId(pid),
            DeviceId::from("GPU-0"),
            ActionParameters::IoLimit { io_limit_mbps: mbps },
        )
    }

    #[test]
    fn test_classify_failure() {
        assert_eq!(classify_failure("Insufficient Permissions"), ActionErrorKind::PermissionDenied);
        assert_eq!(classify_failure("Operation not permitted"), ActionErrorKind::PermissionDenied);
        assert_eq!(classify_failure("GPU is busy"), ActionErrorKind::DeviceBusy);
        assert_eq!(
            classify_failure("device in use by another client"),
            ActionErrorKind::DeviceBusy
        );
        assert_eq!(
            classify_failure("Invalid GPU instance profile ID"),
            ActionErrorKind::InvalidProfile
        );
        assert_eq!(classify_failure("segfault"), ActionErrorKind::Unknown);
    }

    #[test]
    fn test_command_failure_ignores_arguments() {
        let args = ["mig", "-i", "GPU-busy-0", "-cgi", "invalid-profile", "-C"];

        let err = command_failure(&args, "exit status: 3", "Unable to reach the driver\n", "");
        assert_eq!(err.kind, ActionErrorKind::Unknown);
        assert!(err.message.contains("-cgi invalid-profile"));
        assert!(err.message.contains("Unable to reach the driver"));

        let err = command_failure(&args, "exit status: 4", "", "Insufficient Permissions\n");
        assert_eq!(err.kind, ActionErrorKind::PermissionDenied);

        let err = command_failure(&args, "exit status: 2", "No such profile: 9g.90gb", "ignored");
        assert_eq!(err.kind, ActionErrorKind::InvalidProfile);
        assert!(!err.message.contains("ignored"));
    }

    #[test]
    fn test_classify_io_error() {
        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "nope");
        assert_eq!(classify_io_error(&denied), ActionErrorKind::PermissionDenied);
        assert_eq!(
            classify_io_error(&io::Error::from_raw_os_error(EBUSY)),
            ActionErrorKind::DeviceBusy
        );
    }

    #[test]
    fn test_parse_unified_cgroup() {
        assert_eq!(parse_unified_cgroup("0::/a/b\n"), Some("/a/b".to_string()));
        assert_eq!(
            parse_unified_cgroup("12:memory:/legacy\n0::/system.slice/job.service\n"),
            Some("/system.slice/job.service".to_string())
        );
        assert_eq!(parse_unified_cgroup("12:memory:/legacy\n"), None);
    }

    #[test]
    fn test_parse_partitions_keeps_whole_disks() {
        let content = concat!(
            "major minor  #blocks  name\n\n",
            " 259 0 1 nvme0n1\n 259 1 1 nvme0n1p1\n",
            " 8 0 1 sda\n 8 1 1 sda1\n 7 0 1 loop0\n",
            " 179 0 1 mmcblk0\n 179 1 1 mmcblk0p1\n",
        );
        assert_eq!(parse_partitions(content), vec!["259:0", "8:0", "179:0"]);
    }

    #[tokio::test]
    async fn test_io_limit_written_per_device() {
        let host = fake_host(4242);
        let sink = CommandActionSink::new(host.config.clone());

        sink.execute(&io_action(4242, 100)).await.unwrap();

        let written = std::fs::read_to_string(&host.io_max).unwrap();
        assert_eq!(
            written,
            "259:0 rbps=104857600 wbps=104857600\n8:0 rbps=104857600 wbps=104857600\n"
        );
    }

    #[tokio::test]
    async fn test_io_limit_uses_configured_devices() {
        let host = fake_host(4242);
        let mut config = host.config.clone();
        config.block_devices = vec!["253:3".to_string()];
        let sink = CommandActionSink::new(config);

        sink.execute(&io_action(4242, 1)).await.unwrap();
        let written = std::fs::read_to_string(&host.io_max).unwrap();
        assert_eq!(written, "253:3 rbps=1048576 wbps=1048576\n");
    }

    #[tokio::test]
    async fn test_unknown_pid_fails_without_panicking() {
        let host = fake_host(4242);
        let sink = CommandActionSink::new(host.config.clone());
        let err = sink.execute(&io_action(1, 100)).await.unwrap_err();
        assert_eq!(err.kind, ActionErrorKind::Unknown);
    }

    #[tokio::test]
    async fn test_missing_nvidia_smi_is_reported() {
        let host = fake_host(4242);
        let sink = CommandActionSink::new(host.config.clone());
        let action = MitigationAction::new(
            MitigationTier::Tier2,
            TenantId(4242),
            DeviceId::from("GPU-0"),
            ActionParameters::MigReconfigure {
                profile: "1g.10gb".to_string(),
            },
        );
        let err = sink.execute(&action).await.unwrap_err();
        assert!(err.message.contains("failed to run"));
    }
}
