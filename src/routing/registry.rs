//! # Arm Registry
//!
//! ## Responsibility
//!
//! Owns every arm's statistics, health, in-flight count, and the warmth of
//! each resource class. Injected into the routing engine; tests seed it with
//! synthetic statistics directly.
//!
//! ## Guarantees
//!
//! - **Per-arm locking**: each arm's statistics sit behind their own mutex,
//!   so concurrent outcome recording on different arms never contends
//! - **Atomic updates**: one outcome updates global, context, latency, and
//!   health state under a single lock acquisition
//! - **Retention**: retired arms keep their statistics
//!
//! ## NOT Responsible For
//!
//! - Exactly-once semantics (see [`RoutingEngine`](super::RoutingEngine))
//! - Choosing arms (see [`SelectionPolicy`](super::SelectionPolicy))

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

use super::arm::{ArmHealth, ArmSnapshot, ArmStats, LatencyStats};
use super::config::ArmSpec;
use super::decision::ContextKey;
use crate::clock::UnixMillis;
use crate::{ArmId, ResourceClass};

#[derive(Debug)]
struct ArmState {
    global: ArmStats,
    contexts: HashMap<ContextKey, ArmStats>,
    latency: LatencyStats,
    health: ArmHealth,
    consecutive_failures: u32,
}

#[derive(Debug)]
struct ArmEntry {
    spec: ArmSpec,
    state: Mutex<ArmState>,
    in_flight: AtomicU32,
}

/// One outcome to fold into an arm.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Outcome {
    /// Shaped reward in `[0, 1]`.
    pub reward: f64,
    /// Whether the backend call succeeded.
    pub success: bool,
    /// Observed latency, if the call produced one.
    pub latency_ms: Option<f64>,
}

impl Outcome {
    /// Successful outcome with the given reward and latency.
    pub fn success(reward: f64, latency_ms: f64) -> Self {
        Self {
            reward,
            success: true,
            latency_ms: Some(latency_ms),
        }
    }

    /// Failed outcome with zero reward.
    pub fn failure() -> Self {
        Self {
            reward: 0.0,
            success: false,
            latency_ms: None,
        }
    }
}

/// Registry of arms and resource-class warmth.
///
/// # Panics
///
/// This type and its methods never panic.
#[derive(Debug)]
pub struct ArmRegistry {
    arms: DashMap<ArmId, Arc<ArmEntry>>,
    warm_until: DashMap<ResourceClass, UnixMillis>,
    retire_after_failures: u32,
}

impl ArmRegistry {
    /// Create an empty registry.
    pub fn new(retire_after_failures: u32) -> Self {
        Self {
            arms: DashMap::new(),
            warm_until: DashMap::new(),
            retire_after_failures: retire_after_failures.max(1),
        }
    }

    /// Create a registry pre-populated with `specs`. Duplicate ids keep the first.
    pub fn with_arms(specs: impl IntoIterator<Item = ArmSpec>, retire_after_failures: u32) -> Self {
        let registry = Self::new(retire_after_failures);
        for spec in specs {
            registry.register(spec);
        }
        registry
    }

    /// Add an arm. Returns `false` (and changes nothing) if the id exists.
    pub fn register(&self, spec: ArmSpec) -> bool {
        let id = spec.id.clone();
        if self.arms.contains_key(&id) {
            return false;
        }
        info!(arm_id = %id, resource_class = %spec.resource_class, "arm registered");
        self.arms.insert(
            id,
            Arc::new(ArmEntry {
                spec,
                state: Mutex::new(ArmState {
                    global: ArmStats::default(),
                    contexts: HashMap::new(),
                    latency: LatencyStats::default(),
                    health: ArmHealth::Live,
                    consecutive_failures: 0,
                }),
                in_flight: AtomicU32::new(0),
            }),
        );
        true
    }

    fn entry(&self, arm_id: &ArmId) -> Option<Arc<ArmEntry>> {
        self.arms.get(arm_id).map(|e| Arc::clone(e.value()))
    }

    /// Return `true` if the arm is registered.
    pub fn contains(&self, arm_id: &ArmId) -> bool {
        self.arms.contains_key(arm_id)
    }

    /// Registered arm count.
    pub fn len(&self) -> usize {
        self.arms.len()
    }

    /// Return `true` if no arms are registered.
    pub fn is_empty(&self) -> bool {
        self.arms.is_empty()
    }

    /// Registered arm ids, sorted.
    pub fn ids(&self) -> Vec<ArmId> {
        let mut ids: Vec<ArmId> = self.arms.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Static spec of an arm.
    pub fn spec(&self, arm_id: &ArmId) -> Option<ArmSpec> {
        self.entry(arm_id).map(|e| e.spec.clone())
    }

    /// Current health of an arm.
    pub fn health(&self, arm_id: &ArmId) -> Option<ArmHealth> {
        self.entry(arm_id).map(|e| e.state.lock().health)
    }

    /// Global statistics of an arm.
    pub fn stats(&self, arm_id: &ArmId) -> Option<ArmStats> {
        self.entry(arm_id).map(|e| e.state.lock().global)
    }

    /// Statistics of one context bucket of an arm.
    pub fn context_stats(&self, arm_id: &ArmId, key: &ContextKey) -> Option<ArmStats> {
        self.entry(arm_id)
            .and_then(|e| e.state.lock().contexts.get(key).copied())
    }

    /// Overwrite an arm's global statistics.
    ///
    /// Returns `false` if the arm is unknown.
    pub fn seed_stats(&self, arm_id: &ArmId, stats: ArmStats) -> bool {
        match self.entry(arm_id) {
            Some(e) => {
                e.state.lock().global = stats;
                true
            }
            None => false,
        }
    }

    /// Overwrite one context bucket of an arm.
    ///
    /// Returns `false` if the arm is unknown.
    pub fn seed_context_stats(&self, arm_id: &ArmId, key: ContextKey, stats: ArmStats) -> bool {
        match self.entry(arm_id) {
            Some(e) => {
                e.state.lock().contexts.insert(key, stats);
                true
            }
            None => false,
        }
    }

    /// Snapshot all arms, sorted by id, with `context` bucket stats attached.
    pub fn snapshots(&self, context: Option<&ContextKey>, now: UnixMillis) -> Vec<ArmSnapshot> {
        let mut out: Vec<ArmSnapshot> = self
            .arms
            .iter()
            .map(|e| {
                let entry = e.value();
                let state = entry.state.lock();
                let in_flight = entry.in_flight.load(Ordering::Relaxed);
                ArmSnapshot {
                    spec: entry.spec.clone(),
                    global: state.global,
                    context: context.and_then(|k| state.contexts.get(k).copied()),
                    latency: state.latency,
                    health: state.health,
                    in_flight,
                    warm: in_flight > 0 || self.is_warm(&entry.spec.resource_class, now),
                }
            })
            .collect();
        out.sort_by(|a, b| a.spec.id.cmp(&b.spec.id));
        out
    }

    /// Fold one outcome into an arm.
    ///
    /// A failure increments the consecutive-failure counter and retires the arm
    /// once it reaches the configured threshold; a success resets it. A
    /// non-finite reward is treated as corrupt input: it is discarded and the
    /// arm is retired.
    ///
    /// Returns `false` if the arm is unknown.
    pub fn apply_outcome(&self, arm_id: &ArmId, context: Option<&ContextKey>, outcome: Outcome) -> bool {
        let Some(entry) = self.entry(arm_id) else {
            return false;
        };
        let mut state = entry.state.lock();
        if !outcome.reward.is_finite() {
            error!(arm_id = %arm_id, reward = outcome.reward, "non-finite reward; retiring arm");
            state.health = ArmHealth::Retired;
            return true;
        }
        state.global.record(outcome.reward, outcome.success);
        if let Some(key) = context {
            state
                .contexts
                .entry(key.clone())
                .or_default()
                .record(outcome.reward, outcome.success);
        }
        if let Some(ms) = outcome.latency_ms.filter(|ms| ms.is_finite() && *ms >= 0.0) {
            state.latency.observe(ms);
        }
        if outcome.success {
            state.consecutive_failures = 0;
        } else {
            state.consecutive_failures = state.consecutive_failures.saturating_add(1);
            if state.health == ArmHealth::Live
                && state.consecutive_failures >= self.retire_after_failures
            {
                warn!(
                    arm_id = %arm_id,
                    consecutive_failures = state.consecutive_failures,
                    "arm retired after sustained failures"
                );
                state.health = ArmHealth::Retired;
            }
        }
        true
    }

    /// Force an arm out of rotation. Returns `false` if unknown.
    pub fn retire(&self, arm_id: &ArmId) -> bool {
        match self.entry(arm_id) {
            Some(e) => {
                e.state.lock().health = ArmHealth::Retired;
                warn!(arm_id = %arm_id, "arm retired");
                true
            }
            None => false,
        }
    }

    /// Return a retired arm to rotation and clear its failure counter.
    /// Returns `false` if unknown.
    pub fn revive(&self, arm_id: &ArmId) -> bool {
        match self.entry(arm_id) {
            Some(e) => {
                let mut state = e.state.lock();
                state.health = ArmHealth::Live;
                state.consecutive_failures = 0;
                info!(arm_id = %arm_id, "arm revived");
                true
            }
            None => false,
        }
    }

    /// Count a request as executing on `arm_id`.
    pub fn begin(&self, arm_id: &ArmId) {
        if let Some(e) = self.entry(arm_id) {
            e.in_flight.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Count a request as finished on `arm_id`.
    ///
    /// The arm's resource class stays warm for `keep_warm_ms` afterwards.
    pub fn end(&self, arm_id: &ArmId, now: UnixMillis, keep_warm_ms: u64) {
        if let Some(e) = self.entry(arm_id) {
            // Saturating decrement.
            let _ = e
                .in_flight
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
            self.mark_warm(&e.spec.resource_class, now.saturating_add(keep_warm_ms));
        }
    }

    /// Requests currently executing on `arm_id`.
    pub fn in_flight(&self, arm_id: &ArmId) -> u32 {
        self.entry(arm_id)
            .map(|e| e.in_flight.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Keep `class` warm until `until`. Never shortens an existing window.
    pub fn mark_warm(&self, class: &ResourceClass, until: UnixMillis) {
        self.warm_until
            .entry(class.clone())
            .and_modify(|t| *t = (*t).max(until))
            .or_insert(until);
    }

    /// Return `true` if `class` is inside a warm window at `now`.
    pub fn is_warm(&self, class: &ResourceClass, now: UnixMillis) -> bool {
        self.warm_until
            .get(class)
            .map(|t| *t.value() > now)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ArmRegistry {
        ArmRegistry::with_arms(
            [
                ArmSpec::new("a", "slm", "echo"),
                ArmSpec::new("b", "llm", "echo").with_cold_start_penalty(1000),
            ],
            3,
        )
    }

    #[test]
    fn test_register_rejects_duplicate_id() {
        let reg = registry();
        assert!(!reg.register(ArmSpec::new("a", "x", "echo")));
        assert_eq!(reg.spec(&ArmId::new("a")).unwrap().resource_class.as_str(), "slm");
        assert!(reg.register(ArmSpec::new("c", "x", "echo")));
        assert_eq!(reg.len(), 3);
    }

    #[test]
    fn test_apply_outcome_updates_global_and_context() {
        let reg = registry();
        let key = crate::routing::RoutingContext {
            task_type: Some("code".into()),
            ..Default::default()
        }
        .key()
        .unwrap();
        let a = ArmId::new("a");
        assert!(reg.apply_outcome(&a, Some(&key), Outcome::success(0.8, 120.0)));
        assert_eq!(reg.stats(&a).unwrap().trials, 1);
        assert_eq!(reg.context_stats(&a, &key).unwrap().trials, 1);
    }

    #[test]
    fn test_consecutive_failures_retire_arm() {
        let reg = registry();
        let a = ArmId::new("a");
        for _ in 0..2 {
            reg.apply_outcome(&a, None, Outcome::failure());
        }
        reg.apply_outcome(&a, None, Outcome::success(1.0, 10.0));
        for _ in 0..2 {
            reg.apply_outcome(&a, None, Outcome::failure());
        }
        assert_eq!(reg.health(&a), Some(ArmHealth::Live));
        reg.apply_outcome(&a, None, Outcome::failure());
        assert_eq!(reg.health(&a), Some(ArmHealth::Retired));
        assert_eq!(reg.stats(&a).unwrap().trials, 6);
    }

    #[test]
    fn test_non_finite_reward_retires_without_recording() {
        let reg = registry();
        let a = ArmId::new("a");
        reg.apply_outcome(&a, None, Outcome::success(f64::NAN, 1.0));
        assert_eq!(reg.health(&a), Some(ArmHealth::Retired));
        assert_eq!(reg.stats(&a).unwrap().trials, 0);
    }

    #[test]
    fn test_apply_outcome_unknown_arm_returns_false() {
        assert!(!registry().apply_outcome(&ArmId::new("zz"), None, Outcome::failure()));
    }

    #[test]
    fn test_warm_window_affects_snapshot() {
        let reg = registry();
        let llm = ResourceClass::new("llm");
        let snap = |now| {
            reg.snapshots(None, now)
                .into_iter()
                .find(|s| s.spec.id.as_str() == "b")
                .unwrap()
        };
        assert!(!snap(0).warm);
        reg.mark_warm(&llm, 500);
        assert!(snap(499).warm);
        assert!(!snap(500).warm);
    }

    #[test]
    fn test_end_saturates_and_warms_class() {
        let reg = registry();
        let a = ArmId::new("a");
        reg.begin(&a);
        reg.end(&a, 0, 100);
        reg.end(&a, 0, 100);
        assert_eq!(reg.in_flight(&a), 0);
        assert!(reg.is_warm(&ResourceClass::new("slm"), 50));
    }

    #[test]
    fn test_revive_clears_retirement() {
        let reg = registry();
        let a = ArmId::new("a");
        reg.retire(&a);
        reg.revive(&a);
        assert_eq!(reg.health(&a), Some(ArmHealth::Live));
    }
}
