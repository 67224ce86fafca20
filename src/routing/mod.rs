//! # Stage: Adaptive Routing
//!
//! ## Responsibility
//! Choose which arm (backend/model configuration) serves each request, learn
//! from observed outcomes, and account usage per arm. Selection is a bandit:
//! Thompson sampling, UCB, or a contextual variant of either, picked at
//! construction time.
//!
//! ## Guarantees
//! - Thread-safe: arm statistics live behind per-arm locks in the
//!   [`ArmRegistry`]; dedupe and archive sets are sharded maps.
//! - Exactly-once: rewards and charges are applied at most once per request
//!   id within the retention window.
//! - Non-blocking: `route()` is computation only and never awaits.
//! - Deterministic under a seed: a fixed `seed` reproduces every sample.
//!
//! ## NOT Responsible For
//! - Calling backends (that belongs to `orchestrator`)
//! - Demand forecasting (that belongs to `prewarm`)
//! - Policy/permission checks (that belongs to `policy`)

pub mod arm;
pub mod config;
pub mod decision;
pub mod dedup;
pub mod engine;
pub mod policy;
pub mod registry;
pub mod usage;

// Re-exports for convenience
pub use arm::{ArmHealth, ArmSnapshot, ArmStats, LatencyStats};
pub use config::{ArmSpec, PolicyKind, RoutingConfig};
pub use decision::{Constraints, ContextKey, Rationale, RoutingContext, RoutingDecision, RoutingRequest};
pub use dedup::RetentionMap;
pub use engine::{ExclusionCounts, OutcomeStatus, RoutingEngine, RoutingError};
pub use policy::{BasePolicy, Selection, SelectionPolicy};
pub use registry::{ArmRegistry, Outcome};
pub use usage::{ArmUsageSnapshot, UsageLedger, UsageSnapshot};
