//! Action sink that only logs

use async_trait::async_trait;
use guard_core::{ActionSink, MitigationAction, SinkError};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Accepts every action and applies nothing
#[derive(Debug, Default)]
pub struct DryRunSink {
    accepted: AtomicU64,
}

impl DryRunSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ActionSink for DryRunSink {
    async fn execute(&self, action: &MitigationAction) -> Result<(), SinkError> {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        info!("[dry-run] would apply {}", action);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "dry-run"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use guard_core::{ActionParameters, DeviceId, MitigationTier, TenantId};

    #[tokio::test]
    async fn test_dry_run_accepts_everything() {
        let sink = DryRunSink::new();
        let action = MitigationAction::new(
            MitigationTier::Tier2,
            TenantId(3),
            DeviceId::from("GPU-0"),
            ActionParameters::MigReconfigure {
                profile: "1g.10gb".to_string(),
            },
        );
        assert!(sink.execute(&action).await.is_ok());
        assert!(sink.execute(&action).await.is_ok());
        assert_eq!(sink.accepted(), 2);
        assert_eq!(sink.name(), "dry-run");
    }
}
