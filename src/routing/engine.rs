//! # Routing Decision Engine
//!
//! ## Responsibility
//!
//! Filter arms by health and hard constraints, pick one with the configured
//! [`SelectionPolicy`], optionally pair it with a challenger for shadow
//! execution, archive the decision, and attribute rewards back to arms
//! exactly once per request id.
//!
//! ## Guarantees
//!
//! - **Idempotent routing**: routing the same request id twice returns the
//!   archived decision
//! - **Exactly-once rewards**: a second `record_outcome` for the same request
//!   id is logged and ignored
//! - **Bounded memory**: archive and dedupe sets are capped by entry count
//!   and retention window
//! - **Non-blocking**: routing is computation only; no `.await` anywhere
//!
//! ## NOT Responsible For
//!
//! - Calling backends (see `orchestrator`)
//! - Prewarming (see `prewarm`)

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::arm::{ArmHealth, ArmSnapshot};
use super::config::RoutingConfig;
use super::decision::{Constraints, Rationale, RoutingDecision, RoutingRequest};
use super::dedup::RetentionMap;
use super::policy::SelectionPolicy;
use super::registry::{ArmRegistry, Outcome};
use crate::clock::{now_millis, secs, UnixMillis};
use crate::metrics::{MetricsSink, DUPLICATE_OUTCOMES_TOTAL};
use crate::protocol::QosClass;
use crate::{ArmId, RequestId};

/// How many arms each constraint excluded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExclusionCounts {
    /// Retired arms.
    pub unhealthy: usize,
    /// Arms below the quality target.
    pub quality: usize,
    /// Arms over the cost ceiling.
    pub cost: usize,
    /// Arms over the latency SLO.
    pub latency: usize,
    /// Arms at capacity.
    pub capacity: usize,
    /// Arms excluded explicitly (e.g. the failed arm on retry).
    pub excluded: usize,
}

impl ExclusionCounts {
    /// Return `true` if cost is the only reason any arm was excluded.
    pub fn only_cost(&self) -> bool {
        self.cost > 0
            && self.unhealthy == 0
            && self.quality == 0
            && self.latency == 0
            && self.capacity == 0
    }
}

/// Errors produced by the routing engine.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RoutingError {
    /// No live arm satisfies the constraints.
    #[error("no eligible arm for request {request_id} ({excluded:?})")]
    NoEligibleArm {
        /// Request being routed.
        request_id: RequestId,
        /// Why arms were excluded.
        excluded: ExclusionCounts,
    },
}

/// Result of [`RoutingEngine::record_outcome`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeStatus {
    /// Statistics updated.
    Applied,
    /// The request id was already recorded; nothing changed.
    Duplicate,
    /// The arm is not registered; nothing changed.
    UnknownArm,
}

/// Adaptive router over an [`ArmRegistry`].
///
/// # Panics
///
/// This type and its methods never panic.
#[derive(Debug)]
pub struct RoutingEngine {
    registry: Arc<ArmRegistry>,
    policy: SelectionPolicy,
    config: RoutingConfig,
    rng: Mutex<StdRng>,
    archive: RetentionMap<RequestId, Arc<RoutingDecision>>,
    recorded: RetentionMap<RequestId, ArmId>,
    metrics: Arc<dyn MetricsSink>,
}

impl RoutingEngine {
    /// Build an engine over `registry` using the policy named in `config`.
    pub fn new(registry: Arc<ArmRegistry>, config: RoutingConfig, metrics: Arc<dyn MetricsSink>) -> Self {
        let policy = SelectionPolicy::from_config(&config);
        Self::with_policy(registry, config, policy, metrics)
    }

    /// Build an engine with an explicit policy.
    pub fn with_policy(
        registry: Arc<ArmRegistry>,
        config: RoutingConfig,
        policy: SelectionPolicy,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let retention_ms = secs(config.dedup_retention_s);
        info!(policy = policy.name(), arms = registry.len(), "routing engine ready");
        Self {
            archive: RetentionMap::new(retention_ms, config.dedup_max_entries),
            recorded: RetentionMap::new(retention_ms, config.dedup_max_entries),
            registry,
            policy,
            config,
            rng: Mutex::new(rng),
            metrics,
        }
    }

    /// The registry this engine routes over.
    pub fn registry(&self) -> &Arc<ArmRegistry> {
        &self.registry
    }

    /// The active configuration.
    pub fn config(&self) -> &RoutingConfig {
        &self.config
    }

    /// The active selection policy.
    pub fn policy(&self) -> SelectionPolicy {
        self.policy
    }

    /// Route a request.
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError::NoEligibleArm`] when every arm is retired or
    /// violates a constraint.
    pub fn route(
        &self,
        request: &RoutingRequest,
        constraints: &Constraints,
    ) -> Result<Arc<RoutingDecision>, RoutingError> {
        self.route_at(request, constraints, now_millis())
    }

    /// [`route`](Self::route) with an explicit clock.
    ///
    /// # Errors
    ///
    /// See [`route`](Self::route).
    pub fn route_at(
        &self,
        request: &RoutingRequest,
        constraints: &Constraints,
        now: UnixMillis,
    ) -> Result<Arc<RoutingDecision>, RoutingError> {
        self.decide(request, constraints, &[], 1, now)
    }

    /// Route the alternate attempt after `failed` errored.
    ///
    /// The decision is archived under `request.request_id.retry()` with
    /// [`Rationale::Retry`] and never pairs a challenger.
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError::NoEligibleArm`] when no other arm is eligible.
    pub fn reroute(
        &self,
        request: &RoutingRequest,
        constraints: &Constraints,
        failed: &ArmId,
        now: UnixMillis,
    ) -> Result<Arc<RoutingDecision>, RoutingError> {
        let retry = RoutingRequest {
            request_id: request.request_id.retry(),
            ..request.clone()
        };
        self.decide(&retry, constraints, std::slice::from_ref(failed), 2, now)
    }

    /// Archived decision for a request id.
    pub fn decision(&self, request_id: &RequestId) -> Option<Arc<RoutingDecision>> {
        self.archive.get(request_id)
    }

    fn decide(
        &self,
        request: &RoutingRequest,
        constraints: &Constraints,
        exclude: &[ArmId],
        attempt: u32,
        now: UnixMillis,
    ) -> Result<Arc<RoutingDecision>, RoutingError> {
        if let Some(existing) = self.archive.get(&request.request_id) {
            debug!(request_id = %request.request_id, "returning archived decision");
            return Ok(existing);
        }

        let context_key = request.context.key();
        let snapshots = self.registry.snapshots(context_key.as_ref(), now);
        let (eligible, excluded) =
            filter_eligible(snapshots, request.estimated_tokens, constraints, exclude);

        let selection = {
            let mut rng = self.rng.lock();
            self.policy
                .select_arm(&eligible, self.config.tie_epsilon, &mut *rng)
        };
        let Some(selection) = selection else {
            warn!(request_id = %request.request_id, ?excluded, "no eligible arm");
            return Err(RoutingError::NoEligibleArm {
                request_id: request.request_id.clone(),
                excluded,
            });
        };
        let Some(chosen) = eligible.iter().find(|a| a.spec.id == selection.arm_id) else {
            return Err(RoutingError::NoEligibleArm {
                request_id: request.request_id.clone(),
                excluded,
            });
        };

        let challenger = if attempt == 1 {
            self.pick_challenger(&eligible, &selection.arm_id, request.qos)
        } else {
            None
        };
        let rationale = if attempt > 1 {
            Rationale::Retry
        } else if challenger.is_some() {
            Rationale::Champion
        } else if self.is_best_mean(&eligible, chosen) {
            Rationale::Exploitation
        } else {
            Rationale::Exploration
        };

        let decision = Arc::new(RoutingDecision {
            request_id: request.request_id.clone(),
            arm_id: chosen.spec.id.clone(),
            resource_class: chosen.spec.resource_class.clone(),
            backend: chosen.spec.backend.clone(),
            rationale,
            challenger,
            predicted_cost_usd_micros: chosen.spec.estimate_cost(request.estimated_tokens),
            predicted_latency_ms: chosen.predicted_latency_ms(),
            score: selection.score,
            context_key,
            qos: request.qos,
            decided_at: now,
            attempt,
        });

        match self
            .archive
            .insert_if_absent(request.request_id.clone(), Arc::clone(&decision), now)
        {
            Ok(()) => {
                info!(
                    request_id = %decision.request_id,
                    arm_id = %decision.arm_id,
                    rationale = decision.rationale.as_str(),
                    score = decision.score,
                    "route decided"
                );
                self.metrics.routing_event(&decision);
                Ok(decision)
            }
            // A concurrent call archived first; its decision wins.
            Err(existing) => Ok(existing),
        }
    }

    fn is_best_mean(&self, eligible: &[ArmSnapshot], chosen: &ArmSnapshot) -> bool {
        let chosen_stats = self.policy.stats_for(chosen);
        if chosen_stats.trials == 0 {
            return false;
        }
        let mean = chosen_stats.mean();
        eligible
            .iter()
            .all(|a| self.policy.stats_for(a).mean() <= mean + self.config.tie_epsilon)
    }

    fn pick_challenger(&self, eligible: &[ArmSnapshot], champion: &ArmId, qos: QosClass) -> Option<ArmId> {
        if qos == QosClass::Gold || self.config.challenger_fraction <= 0.0 || eligible.len() < 2 {
            return None;
        }
        let mut rng = self.rng.lock();
        if rng.gen::<f64>() >= self.config.challenger_fraction {
            return None;
        }
        let others: Vec<&ArmSnapshot> = eligible.iter().filter(|a| &a.spec.id != champion).collect();
        let flagged: Vec<&ArmSnapshot> = others.iter().copied().filter(|a| a.spec.challenger).collect();
        let pool = if flagged.is_empty() { others } else { flagged };
        if pool.is_empty() {
            return None;
        }
        let idx = rng.gen_range(0..pool.len());
        Some(pool[idx].spec.id.clone())
    }

    /// Record the outcome of a routed request.
    ///
    /// Applied at most once per request id while the id is retained.
    pub fn record_outcome(&self, request_id: &RequestId, arm_id: &ArmId, outcome: Outcome) -> OutcomeStatus {
        self.record_outcome_at(request_id, arm_id, outcome, now_millis())
    }

    /// [`record_outcome`](Self::record_outcome) with an explicit clock.
    pub fn record_outcome_at(
        &self,
        request_id: &RequestId,
        arm_id: &ArmId,
        outcome: Outcome,
        now: UnixMillis,
    ) -> OutcomeStatus {
        if !self.registry.contains(arm_id) {
            warn!(request_id = %request_id, arm_id = %arm_id, "outcome for unknown arm ignored");
            return OutcomeStatus::UnknownArm;
        }
        if let Err(prev) = self
            .recorded
            .insert_if_absent(request_id.clone(), arm_id.clone(), now)
        {
            warn!(
                request_id = %request_id,
                arm_id = %arm_id,
                first_arm_id = %prev,
                "duplicate outcome ignored"
            );
            self.metrics.inc_counter(DUPLICATE_OUTCOMES_TOTAL, &[]);
            return OutcomeStatus::Duplicate;
        }
        let context = self
            .archive
            .get(request_id)
            .and_then(|d| d.context_key.clone());
        self.registry
            .apply_outcome(arm_id, context.as_ref(), outcome);
        debug!(
            request_id = %request_id,
            arm_id = %arm_id,
            reward = outcome.reward,
            success = outcome.success,
            "outcome recorded"
        );
        OutcomeStatus::Applied
    }

    /// Shaped reward for a finished request.
    ///
    /// Failures score `0`. Successes score `1 - latency_weight * min(latency / slo, 1)
    /// - cost_weight * min(cost / max_cost, 1)`, clamped to `[0, 1]`.
    pub fn shape_reward(
        &self,
        success: bool,
        latency_ms: f64,
        cost_usd_micros: u64,
        constraints: &Constraints,
    ) -> f64 {
        if !success {
            return 0.0;
        }
        let latency_frac = ratio(latency_ms, constraints.latency_slo_ms as f64);
        let cost_frac = ratio(cost_usd_micros as f64, constraints.max_cost_usd_micros as f64);
        (1.0 - self.config.latency_weight * latency_frac - self.config.cost_weight * cost_frac)
            .clamp(0.0, 1.0)
    }
}

fn ratio(value: f64, limit: f64) -> f64 {
    if limit <= 0.0 || !limit.is_finite() {
        return 0.0;
    }
    (value / limit).clamp(0.0, 1.0)
}

fn filter_eligible(
    snapshots: Vec<ArmSnapshot>,
    estimated_tokens: u64,
    constraints: &Constraints,
    exclude: &[ArmId],
) -> (Vec<ArmSnapshot>, ExclusionCounts) {
    let mut counts = ExclusionCounts::default();
    let eligible = snapshots
        .into_iter()
        .filter(|arm| {
            if exclude.contains(&arm.spec.id) {
                counts.excluded += 1;
                false
            } else if arm.health == ArmHealth::Retired {
                counts.unhealthy += 1;
                false
            } else if arm.spec.quality < constraints.quality_target {
                counts.quality += 1;
                false
            } else if arm.spec.estimate_cost(estimated_tokens) > constraints.max_cost_usd_micros {
                counts.cost += 1;
                false
            } else if arm.predicted_latency_ms() > constraints.latency_slo_ms as f64 {
                counts.latency += 1;
                false
            } else if arm.in_flight >= arm.spec.max_in_flight {
                counts.capacity += 1;
                false
            } else {
                true
            }
        })
        .collect();
    (eligible, counts)
}
