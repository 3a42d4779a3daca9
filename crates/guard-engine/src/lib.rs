//! # guard-engine
//!
//! Pure decision engine for gpu-guard. Nothing in this crate performs I/O:
//! every function is a deterministic step over in-memory inputs, so the whole
//! detect/score/plan pipeline can be unit tested without a GPU.
//!
//! - [`TopologySnapshot`]: immutable device topology and affinity scores
//! - [`TenantStateTracker`]: per-tenant violation state machine
//! - [`PlacementScorer`]: ranking of likely bullies
//! - [`MitigationPlanner`]: tier selection and action parameters

pub mod planner;
pub mod scorer;
pub mod topology;
pub mod tracker;

pub use planner::MitigationPlanner;
pub use scorer::PlacementScorer;
pub use topology::{AffinityWeights, TopologySnapshot, LOCAL_NUMA_DISTANCE};
pub use tracker::{DetectionPolicy, TenantStateTracker};
