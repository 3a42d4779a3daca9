//! Observation source backed by a directory of per-tenant metric files
//!
//! An external collector writes one `<pid>.metric` file per tenant, either a
//! bare latency number or `key: value` lines:
//!
//! ```text
//! p99_latency_ms: 123.45
//! device: GPU-8f3c2a
//! usage: 0.72
//! ```

use crate::{AdapterError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use guard_core::{CoResident, CycleSample, DeviceId, Observation, ObservationSource, TenantId};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const METRIC_EXTENSION: &str = "metric";

/// Parsed content of one metric file
#[derive(Debug, Clone, PartialEq)]
struct MetricFile {
    latency_ms: f64,
    device: Option<DeviceId>,
    usage: f64,
}

/// Reads `<dir>/<pid>.metric` files once per cycle
#[derive(Debug, Clone)]
pub struct MetricsDirSource {
    dir: PathBuf,
}

impl MetricsDirSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn read_sample(&self) -> Result<CycleSample> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| {
                AdapterError::Metrics(format!("cannot read {}: {}", self.dir.display(), e))
            })?;

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if let Some(pid) = tenant_of(&path) {
                files.push((pid, path));
            }
        }
        files.sort();

        let mut sample = CycleSample::default();
        for (tenant, path) in files {
            let content = match tokio::fs::read_to_string(&path).await {
                Ok(content) => content,
                Err(e) => {
                    warn!("Skipping unreadable metric file {}: {}", path.display(), e);
                    continue;
                }
            };
            let Some(metric) = parse_metric(&content) else {
                warn!("Skipping malformed metric file {}", path.display());
                continue;
            };

            let observed_at = match tokio::fs::metadata(&path).await.and_then(|m| m.modified()) {
                Ok(modified) => DateTime::<Utc>::from(modified),
                Err(_) => Utc::now(),
            };

            sample
                .observations
                .push(Observation::new(tenant, metric.latency_ms, observed_at));
            if let Some(device) = metric.device {
                sample.residents.push(CoResident::new(tenant, device, metric.usage));
            }
        }

        debug!(
            "Collected {} observations and {} placements from {}",
            sample.observations.len(),
            sample.residents.len(),
            self.dir.display()
        );
        Ok(sample)
    }
}

#[async_trait]
impl ObservationSource for MetricsDirSource {
    async fn collect(&self) -> guard_core::Result<CycleSample> {
        Ok(self.read_sample().await?)
    }
}

/// Tenant id from a `<pid>.metric` file name
fn tenant_of(path: &Path) -> Option<TenantId> {
    if path.extension()? != METRIC_EXTENSION {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}

fn parse_metric(content: &str) -> Option<MetricFile> {
    let content = content.trim();
    if let Ok(latency_ms) = content.parse::<f64>() {
        return Some(MetricFile {
            latency_ms,
            device: None,
            usage: 0.0,
        });
    }

    let mut latency_ms = None;
    let mut device = None;
    let mut usage = 0.0;
    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "p99_latency_ms" => latency_ms = Some(value.parse().ok()?),
            "device" if !value.is_empty() => device = Some(DeviceId::from(value)),
            "usage" => usage = value.parse().ok()?,
            _ => {}
        }
    }

    Some(MetricFile {
        latency_ms: latency_ms?,
        device,
        usage,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_metric_formats() {
        assert_eq!(parse_metric("123.5\n").unwrap().latency_ms, 123.5);

        let metric = parse_metric("p99_latency_ms: 150.0\ndevice: GPU-1\nusage: 0.8\n").unwrap();
        assert_eq!(metric.latency_ms, 150.0);
        assert_eq!(metric.device, Some(DeviceId::from("GPU-1")));
        assert_eq!(metric.usage, 0.8);

        let metric =
            parse_metric("# written by collector\np99_latency_ms: 90\nqueue: 4\n").unwrap();
        assert_eq!(metric.latency_ms, 90.0);
        assert!(metric.device.is_none());

        assert!(parse_metric("").is_none());
        assert!(parse_metric("device: GPU-1").is_none());
        assert!(parse_metric("p99_latency_ms: fast").is_none());
        assert!(parse_metric("p99_latency_ms: 10\nusage: lots").is_none());
    }

    #[test]
    fn test_tenant_of() {
        assert_eq!(tenant_of(Path::new("/m/4242.metric")), Some(TenantId(4242)));
        assert_eq!(tenant_of(Path::new("/m/4242.txt")), None);
        assert_eq!(tenant_of(Path::new("/m/job.metric")), None);
    }

    #[tokio::test]
    async fn test_collect_from_directory() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("200.metric"),
            "p99_latency_ms: 150\ndevice: GPU-0\nusage: 0.4\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("100.metric"), "80.5").unwrap();
        std::fs::write(dir.path().join("300.metric"), "garbage").unwrap();
        std::fs::write(dir.path().join("README"), "not a metric").unwrap();

        let source = MetricsDirSource::new(dir.path());
        let sample = source.collect().await.unwrap();

        let tenants: Vec<u32> = sample.observations.iter().map(|o| o.tenant_id.pid()).collect();
        assert_eq!(tenants, vec![100, 200]);
        assert_eq!(sample.residents, vec![CoResident::new(200, "GPU-0", 0.4)]);
    }

    #[tokio::test]
    async fn test_missing_directory_is_an_error() {
        let dir = TempDir::new().unwrap();
        let source = MetricsDirSource::new(dir.path().join("absent"));
        let err = source.collect().await.unwrap_err();
        assert!(matches!(err, guard_core::Error::InvalidObservation(_)));
    }
}
