//! # guard-core
//!
//! Core types, traits, and configuration for gpu-guard, a control loop that
//! protects per-tenant latency SLOs on shared GPU nodes.
//!
//! This crate provides the foundational pieces shared by every other crate:
//!
//! - The data model: observations, tenant records, violations, actions and results
//! - Capability traits for the topology, observation and process sources and the action sink
//! - Configuration schema and validation
//! - Error handling types

pub mod action;
pub mod config;
pub mod error;
pub mod state;
pub mod traits;
pub mod types;

// Re-export commonly used types at the crate root
pub use action::{
    ActionErrorKind, ActionParameters, ActionResult, IdempotencyKey, MitigationAction,
    MitigationTier, SinkError, TargetKey,
};
pub use self::config::{ControllerConfig, ExecutorConfig, GuardConfig, PlacementConfig};
pub use error::{Error, Result};
pub use state::{BullyCandidate, StateSummary, TenantRecord, TenantState, Violation};
pub use traits::{ActionSink, ObservationSource, ProcessSource, TopologySource};
pub use types::{
    CoResident, CycleSample, DeviceId, GpuDevice, GpuProcess, MigProfile, Observation, TenantId,
};
